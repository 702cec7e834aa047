//! The file record: the unit of replication metadata.

use drift_blocks::Block;
use drift_proto::{BlockInfo, FileInfo, FLAG_DELETED, FLAG_DIRECTORY, FLAG_INVALID};
use serde::{Deserialize, Serialize};

/// A file as tracked by the model: announced metadata plus the offset-bearing
/// block list used for diffing and assembly.
///
/// Cluster-wide conflict resolution looks only at `(modified, version)`; see
/// [`File::same_version`] and [`File::newer_than`]. Two records with the same
/// pair are interchangeable even when their block lists differ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub name: String,
    pub flags: u32,
    pub modified: i64,
    pub version: u32,
    pub blocks: Vec<Block>,
}

impl File {
    /// The two records denote the same version of the file.
    pub fn same_version(&self, other: &File) -> bool {
        self.modified == other.modified && self.version == other.version
    }

    /// This record denotes a strictly newer version than `other`.
    pub fn newer_than(&self, other: &File) -> bool {
        self.modified > other.modified
            || (self.modified == other.modified && self.version > other.version)
    }

    /// Total byte size described by the block list.
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.length as u64).sum()
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn is_invalid(&self) -> bool {
        self.flags & FLAG_INVALID != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }
}

impl From<FileInfo> for File {
    /// Block offsets are regenerated as the prefix sum of the lengths; the
    /// wire format does not carry them.
    fn from(f: FileInfo) -> Self {
        let mut offset = 0u64;
        let blocks = f
            .blocks
            .into_iter()
            .map(|b| {
                let block = Block {
                    offset,
                    length: b.length,
                    hash: b.hash,
                };
                offset += block.length as u64;
                block
            })
            .collect();
        Self {
            name: f.name,
            flags: f.flags,
            modified: f.modified,
            version: f.version,
            blocks,
        }
    }
}

impl From<&File> for FileInfo {
    fn from(f: &File) -> Self {
        Self {
            name: f.name.clone(),
            flags: f.flags,
            modified: f.modified,
            version: f.version,
            blocks: f
                .blocks
                .iter()
                .map(|b| BlockInfo {
                    length: b.length,
                    hash: b.hash.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(modified: i64, version: u32) -> File {
        File {
            name: "f".to_string(),
            modified,
            version,
            ..Default::default()
        }
    }

    #[test]
    fn same_version_ignores_blocks_and_flags() {
        let mut a = file(100, 2);
        let mut b = file(100, 2);
        a.flags = 0o644;
        b.flags = FLAG_DELETED;
        b.blocks.push(Block {
            offset: 0,
            length: 10,
            hash: vec![1; 32],
        });
        assert!(a.same_version(&b));
        assert!(!a.newer_than(&b));
        assert!(!b.newer_than(&a));
    }

    #[test]
    fn newer_than_orders_by_modified_then_version() {
        assert!(file(200, 0).newer_than(&file(100, 9)));
        assert!(file(100, 3).newer_than(&file(100, 2)));
        assert!(!file(100, 2).newer_than(&file(100, 2)));
        assert!(!file(99, 9).newer_than(&file(100, 0)));
    }

    #[test]
    fn absent_local_is_older_than_everything() {
        // A default record has modified == 0, version == 0 and loses to any
        // real announcement.
        assert!(file(1, 0).newer_than(&File::default()));
    }

    #[test]
    fn wire_round_trip_regenerates_offsets() {
        let original = File {
            name: "dir/data.bin".to_string(),
            flags: 0o644,
            modified: 1_700_000_000,
            version: 7,
            blocks: vec![
                Block {
                    offset: 0,
                    length: 128 * 1024,
                    hash: vec![1; 32],
                },
                Block {
                    offset: 128 * 1024,
                    length: 4000,
                    hash: vec![2; 32],
                },
            ],
        };
        let wire = FileInfo::from(&original);
        assert!(wire.blocks.iter().all(|b| !b.hash.is_empty()));
        let back = File::from(wire);
        assert_eq!(back, original);
    }
}
