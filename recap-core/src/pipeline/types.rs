use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::recording::{ArtifactLocations, RecordingStatus};

/// Post-processing stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AudioExtraction,
    Transcription,
    Compression,
    Thumbnail,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::AudioExtraction,
        Stage::Transcription,
        Stage::Compression,
        Stage::Thumbnail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AudioExtraction => "audio_extraction",
            Stage::Transcription => "transcription",
            Stage::Compression => "compression",
            Stage::Thumbnail => "thumbnail",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single stage. Failures carry the rendered cause so the runner
/// can persist it without holding on to the error value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded { stage: Stage, output: PathBuf },
    Failed { stage: Stage, cause: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub recording_id: String,
    pub status: RecordingStatus,
    pub artifacts: ArtifactLocations,
    pub manifest: Option<PathBuf>,
    pub failed_stage: Option<Stage>,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.status == RecordingStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactManifest {
    pub recording_id: String,
    pub generated_at: DateTime<Utc>,
    pub artifacts: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub kind: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}
