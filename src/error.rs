//! Error types for batchq.

use thiserror::Error;

use crate::codec::CodecError;
use crate::runner::RunnerFailure;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("serialization failure: {0}")]
    Codec(#[from] CodecError),

    #[error("runner failure: {0}")]
    Runner(#[from] RunnerFailure),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid file path: {0}")]
    InvalidPath(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
