//! Fixed-size block hashing for driftsync.
//!
//! Files are replicated as ordered lists of 128 KiB blocks, each identified
//! by its blake3 digest. This crate produces those lists from readers and
//! computes the reusable/needed partition the puller uses to avoid
//! re-fetching content it already holds.

pub mod blocks;
pub mod errors;

pub use blocks::{diff, hash_blocks, Block, BlockDiff, BLOCK_SIZE};
pub use errors::{BlockError, Result};
