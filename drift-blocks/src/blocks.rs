use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::errors::{BlockError, Result};

/// Fixed block size used for all files. The last block of a file may be
/// shorter.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// A contiguous region of a file identified by its blake3 digest.
///
/// Offsets are always the prefix sum of the preceding block lengths.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub offset: u64,
    pub length: u32,
    pub hash: Vec<u8>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block {{ offset: {}, length: {}, hash: {} }}",
            self.offset,
            self.length,
            hex::encode(&self.hash)
        )
    }
}

/// Partition of a wanted block list into blocks already held locally and
/// blocks that must be fetched from peers.
#[derive(Debug, Clone, Default)]
pub struct BlockDiff {
    /// Blocks whose content is already present at the same offset locally.
    pub have: Vec<Block>,
    /// Blocks that must be fetched remotely.
    pub need: Vec<Block>,
}

/// Read `reader` to the end, hashing consecutive `block_size` regions.
///
/// Returns one [`Block`] per region, with offsets assigned as the running
/// prefix sum. An empty stream yields an empty list.
pub async fn hash_blocks<R>(mut reader: R, block_size: usize) -> Result<Vec<Block>>
where
    R: AsyncRead + Unpin,
{
    if block_size == 0 {
        return Err(BlockError::InvalidBlockSize(block_size));
    }

    let mut blocks = Vec::new();
    let mut buf = vec![0u8; block_size];
    let mut offset = 0u64;

    loop {
        let mut filled = 0;
        while filled < block_size {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }

        let hash = blake3::hash(&buf[..filled]);
        blocks.push(Block {
            offset,
            length: filled as u32,
            hash: hash.as_bytes().to_vec(),
        });
        offset += filled as u64;

        if filled < block_size {
            break;
        }
    }

    trace!(blocks = blocks.len(), bytes = offset, "hashed block list");
    Ok(blocks)
}

/// Split `want` into blocks reusable from `have` and blocks to fetch.
///
/// A block is reusable when the local list carries the same hash at the same
/// offset. Position-wise comparison is sufficient because offsets on both
/// sides are prefix sums over the same fixed block size.
pub fn diff(have: &[Block], want: &[Block]) -> BlockDiff {
    let mut result = BlockDiff::default();

    for (i, block) in want.iter().enumerate() {
        match have.get(i) {
            Some(local) if local.offset == block.offset && local.hash == block.hash => {
                result.have.push(block.clone());
            }
            _ => result.need.push(block.clone()),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(offset: u64, length: u32, seed: u8) -> Block {
        Block {
            offset,
            length,
            hash: vec![seed; 32],
        }
    }

    #[tokio::test]
    async fn empty_stream_yields_no_blocks() {
        let blocks = hash_blocks(&b""[..], BLOCK_SIZE).await.unwrap();
        assert!(blocks.is_empty());
    }

    #[tokio::test]
    async fn short_file_is_a_single_short_block() {
        let blocks = hash_blocks(&b"foobar\n"[..], BLOCK_SIZE).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[0].length, 7);
        assert_eq!(blocks[0].hash, blake3::hash(b"foobar\n").as_bytes().to_vec());
    }

    #[tokio::test]
    async fn offsets_are_prefix_sums() {
        let data = vec![0xabu8; BLOCK_SIZE * 2 + 100];
        let blocks = hash_blocks(&data[..], BLOCK_SIZE).await.unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, BLOCK_SIZE as u64);
        assert_eq!(blocks[2].offset, 2 * BLOCK_SIZE as u64);
        assert_eq!(blocks[2].length, 100);
    }

    #[tokio::test]
    async fn exact_multiple_has_no_trailing_block() {
        let data = vec![0x55u8; BLOCK_SIZE];
        let blocks = hash_blocks(&data[..], BLOCK_SIZE).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].length, BLOCK_SIZE as u32);
    }

    #[tokio::test]
    async fn zero_block_size_is_rejected() {
        let err = hash_blocks(&b"x"[..], 0).await.unwrap_err();
        assert!(matches!(err, BlockError::InvalidBlockSize(0)));
    }

    #[test]
    fn diff_of_identical_lists_needs_nothing() {
        let have = vec![block(0, 128, 1), block(128, 128, 2)];
        let d = diff(&have, &have);
        assert_eq!(d.have.len(), 2);
        assert!(d.need.is_empty());
    }

    #[test]
    fn diff_against_empty_local_needs_everything() {
        let want = vec![block(0, 128, 1), block(128, 128, 2)];
        let d = diff(&[], &want);
        assert!(d.have.is_empty());
        assert_eq!(d.need, want);
    }

    #[test]
    fn diff_detects_changed_middle_block() {
        let have = vec![block(0, 128, 1), block(128, 128, 2), block(256, 128, 3)];
        let mut want = have.clone();
        want[1].hash = vec![9; 32];
        let d = diff(&have, &want);
        assert_eq!(d.have.len(), 2);
        assert_eq!(d.need.len(), 1);
        assert_eq!(d.need[0].offset, 128);
    }

    #[test]
    fn diff_of_grown_file_fetches_the_tail() {
        let have = vec![block(0, 128, 1)];
        let want = vec![block(0, 128, 1), block(128, 64, 2)];
        let d = diff(&have, &want);
        assert_eq!(d.have.len(), 1);
        assert_eq!(d.need.len(), 1);
        assert_eq!(d.need[0].offset, 128);
    }
}
