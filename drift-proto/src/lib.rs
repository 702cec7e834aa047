//! Wire-facing data types for the driftsync replication protocol.
//!
//! This crate defines the file metadata records exchanged in index
//! announcements, the flag bits they carry, and the capability traits that
//! connect the replication model to the framed transport layer. The framed
//! codec itself (message envelopes, compression, ping) lives with the
//! transport; everything here is the payload vocabulary both sides agree on.

pub mod peer;

use serde::{Deserialize, Serialize};

pub use peer::{ConnectionInfo, Peer, PeerEvents, RequestError, Statistics, Transport};

/// The record describes a file that has been deleted on the announcing
/// replica. Deleted records carry no blocks.
pub const FLAG_DELETED: u32 = 1 << 12;

/// The record is a placeholder for a file the announcing replica cannot
/// currently vouch for (e.g. it is being rewritten continuously). Invalid
/// files are never pulled.
pub const FLAG_INVALID: u32 = 1 << 13;

/// The record describes a directory. Directories carry no blocks; only
/// their permission bits and modification time are replicated.
pub const FLAG_DIRECTORY: u32 = 1 << 14;

/// The low twelve bits of the flags field carry POSIX permission bits.
pub const FLAG_MODE_MASK: u32 = 0xfff;

/// A single content block within a file announcement.
///
/// Offsets are not transmitted; receivers regenerate them as the prefix sum
/// of the block lengths, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub length: u32,
    pub hash: Vec<u8>,
}

/// A file metadata record as announced in an index message.
///
/// The pair `(modified, version)` totally orders records for a given name
/// cluster-wide; two records with the same pair are interchangeable even if
/// their block lists differ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Relative path from the repository root, forward-slash separated.
    pub name: String,
    pub flags: u32,
    /// Seconds since the epoch of the last mutation.
    pub modified: i64,
    /// Counter bumped on every local mutation that preserves `modified`.
    pub version: u32,
    pub blocks: Vec<BlockInfo>,
}

impl FileInfo {
    /// Total byte size described by the block list.
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.length as u64).sum()
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_sums_block_lengths() {
        let f = FileInfo {
            name: "a/b".to_string(),
            blocks: vec![
                BlockInfo {
                    length: 128 * 1024,
                    hash: vec![0; 32],
                },
                BlockInfo {
                    length: 42,
                    hash: vec![1; 32],
                },
            ],
            ..Default::default()
        };
        assert_eq!(f.size(), 128 * 1024 + 42);
    }

    #[test]
    fn flag_bits_do_not_overlap_mode() {
        assert_eq!(FLAG_DELETED & FLAG_MODE_MASK, 0);
        assert_eq!(FLAG_INVALID & FLAG_MODE_MASK, 0);
        assert_eq!(FLAG_DIRECTORY & FLAG_MODE_MASK, 0);
    }

    #[test]
    fn file_info_round_trips_through_json() {
        let f = FileInfo {
            name: "dir/file".to_string(),
            flags: FLAG_DIRECTORY | 0o755,
            modified: 1_700_000_000,
            version: 3,
            blocks: vec![BlockInfo {
                length: 7,
                hash: b"not a real hash".to_vec(),
            }],
        };
        let json = serde_json::to_string(&f).unwrap();
        let back: FileInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(f, back);
    }
}
