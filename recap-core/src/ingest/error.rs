use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no staged chunks for recording {recording_id}")]
    EmptyMerge { recording_id: String },
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type IngestResult<T> = Result<T, IngestError>;
