mod error;
mod tools;
mod transcribe;
mod types;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hex::encode as hex_encode;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{RecapConfig, TranscriptFormat};
use crate::ingest::MediaLayout;
use crate::recording::{ArtifactLocations, RecordingStatus, SqliteRecordingStore};

pub use error::{PipelineError, PipelineResult, TranscriptionError, TranscriptionResult};
pub use tools::{CommandExecutor, FfmpegTools, SystemCommandExecutor};
pub use transcribe::{DeepgramTranscriber, Transcriber, Transcript, TranscriptWord};
pub use types::{ArtifactManifest, ManifestEntry, PipelineReport, Stage, StageOutcome};

pub const FAILURE_LOG_NAME: &str = "pipeline_failures.log";

/// Drives a merged recording through audio extraction, transcription,
/// compression and thumbnailing, then settles its lifecycle status.
#[derive(Clone)]
pub struct PipelineRunner {
    store: SqliteRecordingStore,
    layout: MediaLayout,
    tools: FfmpegTools,
    transcriber: Arc<dyn Transcriber>,
    transcript_format: TranscriptFormat,
    transcription_timeout: Duration,
    probe_input: bool,
    failure_log: PathBuf,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("layout", &self.layout)
            .field("tools", &self.tools)
            .field("transcript_format", &self.transcript_format)
            .field("transcription_timeout", &self.transcription_timeout)
            .field("failure_log", &self.failure_log)
            .finish()
    }
}

impl PipelineRunner {
    pub fn new(config: &RecapConfig, store: SqliteRecordingStore, layout: MediaLayout) -> Self {
        Self {
            store,
            layout,
            tools: FfmpegTools::from_config(&config.pipeline),
            transcriber: Arc::new(DeepgramTranscriber::from_config(&config.transcription)),
            transcript_format: config.transcription.format,
            transcription_timeout: config.transcription.timeout(),
            probe_input: config.pipeline.probe_input,
            failure_log: config.logs_dir().join(FAILURE_LOG_NAME),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.tools = self.tools.with_executor(executor);
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = transcriber;
        self
    }

    /// Runs every stage in order. A stage failure marks the recording `failed`
    /// and is reported through the returned report, not as an `Err`; `Err` is
    /// reserved for the store refusing the final update.
    pub async fn run(
        &self,
        recording_id: &str,
        merged: &Path,
        owner: &str,
    ) -> PipelineResult<PipelineReport> {
        let started_at = Utc::now();
        info!(target: "pipeline", recording_id, owner, "pipeline started");

        let mut artifacts = ArtifactLocations::default();
        for stage in Stage::ALL {
            match self.run_stage(stage, recording_id, merged, &artifacts).await {
                StageOutcome::Succeeded { stage, output } => {
                    info!(target: "pipeline", recording_id, %stage, output = %output.display(), "stage finished");
                    match stage {
                        Stage::AudioExtraction => artifacts.audio = Some(output),
                        Stage::Transcription => artifacts.transcript = Some(output),
                        Stage::Compression => artifacts.compressed = Some(output),
                        Stage::Thumbnail => artifacts.thumbnail = Some(output),
                    }
                }
                StageOutcome::Failed { stage, cause } => {
                    return self.fail(recording_id, stage, cause, started_at).await;
                }
            }
        }

        let manifest = match self.write_manifest(recording_id, merged, &artifacts).await {
            Ok(path) => path,
            Err(err) => {
                return self
                    .fail(recording_id, Stage::Thumbnail, format!("manifest: {err}"), started_at)
                    .await;
            }
        };
        self.store.mark_completed(recording_id, &artifacts)?;
        info!(target: "pipeline", recording_id, "pipeline completed");

        Ok(PipelineReport {
            recording_id: recording_id.to_string(),
            status: RecordingStatus::Completed,
            artifacts,
            manifest: Some(manifest),
            failed_stage: None,
            failure_reason: None,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn run_stage(
        &self,
        stage: Stage,
        recording_id: &str,
        merged: &Path,
        artifacts: &ArtifactLocations,
    ) -> StageOutcome {
        let result = match stage {
            Stage::AudioExtraction => self.extract_audio(recording_id, merged).await,
            Stage::Transcription => match &artifacts.audio {
                Some(audio) => self.transcribe(recording_id, audio).await,
                None => Err(PipelineError::InvalidInput("no audio artifact".into())),
            },
            Stage::Compression => {
                let output = self.layout.compressed_path(recording_id);
                self.tools.compress(merged, &output).await.map(|_| output)
            }
            Stage::Thumbnail => match &artifacts.compressed {
                Some(compressed) => {
                    let output = self.layout.thumbnail_path(recording_id);
                    self.tools.thumbnail(compressed, &output).await.map(|_| output)
                }
                None => Err(PipelineError::InvalidInput("no compressed artifact".into())),
            },
        };
        match result {
            Ok(output) => StageOutcome::Succeeded { stage, output },
            Err(err) => StageOutcome::Failed {
                stage,
                cause: err.to_string(),
            },
        }
    }

    async fn extract_audio(&self, recording_id: &str, merged: &Path) -> PipelineResult<PathBuf> {
        if self.probe_input {
            self.tools.probe(merged).await?;
        }
        let output = self.layout.audio_path(recording_id);
        self.tools.extract_audio(merged, &output).await?;
        Ok(output)
    }

    async fn transcribe(&self, recording_id: &str, audio: &Path) -> PipelineResult<PathBuf> {
        let transcript = timeout(self.transcription_timeout, self.transcriber.transcribe(audio))
            .await
            .map_err(|_| TranscriptionError::Timeout(self.transcription_timeout))??;
        let rendered = transcript.render(self.transcript_format)?;
        let output = self
            .layout
            .transcript_path(recording_id, self.transcript_format);
        fs::write(&output, rendered)
            .await
            .map_err(|source| PipelineError::Io {
                path: output.clone(),
                source,
            })?;
        Ok(output)
    }

    async fn write_manifest(
        &self,
        recording_id: &str,
        merged: &Path,
        artifacts: &ArtifactLocations,
    ) -> PipelineResult<PathBuf> {
        let candidates = [
            ("original", Some(merged)),
            ("audio", artifacts.audio.as_deref()),
            ("transcript", artifacts.transcript.as_deref()),
            ("compressed", artifacts.compressed.as_deref()),
            ("thumbnail", artifacts.thumbnail.as_deref()),
        ];
        let mut entries = Vec::new();
        for (kind, path) in candidates {
            let Some(path) = path else { continue };
            let (bytes, sha256) = compute_sha256(path).await?;
            entries.push(ManifestEntry {
                kind: kind.to_string(),
                path: path.to_path_buf(),
                bytes,
                sha256,
            });
        }
        let manifest = ArtifactManifest {
            recording_id: recording_id.to_string(),
            generated_at: Utc::now(),
            artifacts: entries,
        };
        let path = self.layout.manifest_path(recording_id);
        let body = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&path, body)
            .await
            .map_err(|source| PipelineError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    async fn fail(
        &self,
        recording_id: &str,
        stage: Stage,
        cause: String,
        started_at: chrono::DateTime<Utc>,
    ) -> PipelineResult<PipelineReport> {
        let reason = format!("{stage}: {cause}");
        warn!(target: "pipeline", recording_id, %stage, error = %cause, "pipeline stage failed");
        self.log_failure(recording_id, stage, &cause);
        self.store.mark_failed(recording_id, &reason)?;
        Ok(PipelineReport {
            recording_id: recording_id.to_string(),
            status: RecordingStatus::Failed,
            artifacts: ArtifactLocations::default(),
            manifest: None,
            failed_stage: Some(stage),
            failure_reason: Some(reason),
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn log_failure(&self, recording_id: &str, stage: Stage, cause: &str) {
        if let Some(parent) = self.failure_log.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.failure_log)
        {
            let _ = writeln!(
                file,
                "{} [{}] {} {}",
                Utc::now().to_rfc3339(),
                stage,
                recording_id,
                cause
            );
        }
    }
}

async fn compute_sha256(path: &Path) -> PipelineResult<(u64, String)> {
    let bytes = fs::read(path).await.map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok((bytes.len() as u64, hex_encode(hasher.finalize())))
}
