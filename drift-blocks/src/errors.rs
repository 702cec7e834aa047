//! Error types for block operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid block size: {0}")]
    InvalidBlockSize(usize),
}

pub type Result<T> = std::result::Result<T, BlockError>;
