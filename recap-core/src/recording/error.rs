use std::path::PathBuf;

use thiserror::Error;

use super::models::RecordingStatus;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("recording {recording_id} not found")]
    NotFound { recording_id: String },
    #[error("recording {recording_id} already exists")]
    Duplicate { recording_id: String },
    #[error("recording {recording_id} cannot move from {from} to {to}")]
    InvalidTransition {
        recording_id: String,
        from: RecordingStatus,
        to: RecordingStatus,
    },
    #[error("recording store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type RecordingResult<T> = std::result::Result<T, RecordingError>;
