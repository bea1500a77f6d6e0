use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::recording::RecordingError;

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("transcription service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transcription timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed transcription response: {0}")]
    Malformed(String),
    #[error("transcription api key is not configured")]
    MissingApiKey,
    #[error("invalid endpoint {endpoint}: {source}")]
    Endpoint {
        endpoint: String,
        source: url::ParseError,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type TranscriptionResult<T> = Result<T, TranscriptionError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("command `{command}` exited with {status:?}: {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("invalid input media: {0}")]
    InvalidInput(String),
    #[error("transcription failed: {0}")]
    Transcription(#[from] TranscriptionError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("recording store error: {0}")]
    Store(#[from] RecordingError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
