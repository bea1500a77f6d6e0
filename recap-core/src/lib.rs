pub mod config;
pub mod error;
pub mod ident;
pub mod ingest;
pub mod pipeline;
pub mod recording;
pub mod service;
pub mod sqlite;

pub use config::{load_recap_config, RecapConfig, TranscriptFormat};
pub use error::{ConfigError, Result};
pub use ident::{generate_id, DEFAULT_ID_LENGTH};
pub use ingest::{ChunkStore, IngestError, IngestResult, MediaLayout, MergeOutcome, Merger};
pub use pipeline::{
    CommandExecutor, DeepgramTranscriber, FfmpegTools, PipelineError, PipelineReport,
    PipelineResult, PipelineRunner, Stage, StageOutcome, SystemCommandExecutor, Transcriber,
    Transcript, TranscriptWord, TranscriptionError,
};
pub use recording::{
    ArtifactLocations, Recording, RecordingError, RecordingResult, RecordingStatus,
    RecordingTransition, SqliteRecordingStore, SqliteRecordingStoreBuilder,
};
pub use service::{
    Actor, ChunkReceipt, PipelineHandle, RecordingService, ServiceError, ServiceResult,
    SweepReport,
};
