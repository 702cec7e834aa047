//! Error types for the replication model

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    /// No connected peer holds the version of the file we need.
    #[error("{0}: no connected peer has the needed version")]
    NoSource(String),

    /// The assembled file does not hash to the expected block list.
    #[error("{0}: content differs from announced blocks")]
    HashMismatch(String),

    #[error(transparent)]
    Blocks(#[from] drift_blocks::BlockError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
