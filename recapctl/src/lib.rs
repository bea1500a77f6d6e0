use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use recap_core::{
    load_recap_config, Actor, ChunkReceipt, PipelineReport, RecapConfig, Recording,
    RecordingService, RecordingStatus, RecordingTransition, SweepReport,
};

pub type Result<T> = std::result::Result<T, AppError>;

const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
const STALLED_SCAN_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] recap_core::ConfigError),
    #[error("{0}")]
    Service(#[from] recap_core::ServiceError),
    #[error("database error: {0}")]
    Database(#[from] recap_core::RecordingError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("recording {recording_id} failed post-processing: {reason}")]
    PipelineFailed { recording_id: String, reason: String },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Recap recording control interface", long_about = None)]
pub struct Cli {
    /// Path to recap.toml
    #[arg(long, default_value = "configs/recap.toml")]
    pub config: PathBuf,
    /// Alternative path to recordings.sqlite
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Summarize recordings by status
    Status,
    /// Open a new recording session
    Start(OwnerArgs),
    /// Upload a file as a chunked recording and wait for post-processing
    Upload(UploadArgs),
    /// Show a recording, its staged chunks and its transitions
    Show(IdArgs),
    /// List an owner's recordings
    List(ListArgs),
    /// Change a recording's title
    Rename(RenameArgs),
    /// Delete a recording and every file belonging to it
    Delete(IdArgs),
    /// Run the pipeline again for a merged recording that never settled
    Rerun(IdArgs),
    /// Remove stale staging directories and fail abandoned uploads
    Sweep(SweepArgs),
}

#[derive(Args, Debug)]
pub struct OwnerArgs {
    #[arg(long)]
    pub owner: String,
}

#[derive(Args, Debug)]
pub struct IdArgs {
    pub recording_id: String,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    #[arg(long)]
    pub owner: String,
    /// Existing session to upload into; a new one is opened when omitted
    #[arg(long)]
    pub id: Option<String>,
    #[arg(long)]
    pub file: PathBuf,
    /// Chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
    /// Deliver the non-terminal chunks in random order
    #[arg(long, default_value_t = false)]
    pub shuffle: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    pub owner: String,
    /// Filter by status (processing, completed, failed)
    #[arg(long)]
    pub status: Option<RecordingStatus>,
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct RenameArgs {
    #[arg(long)]
    pub owner: String,
    pub recording_id: String,
    pub title: String,
}

#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Age threshold; defaults to ingest.staging_retention_hours
    #[arg(long)]
    pub max_age_hours: Option<u64>,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(&context, &cli))
}

async fn dispatch(context: &AppContext, cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Status => render(&context.status()?, cli.format),
        Commands::Start(args) => render(&context.start(args)?, cli.format),
        Commands::Upload(args) => {
            let report = context.upload(args).await?;
            render(&report, cli.format)?;
            if report.status == RecordingStatus::Failed {
                return Err(AppError::PipelineFailed {
                    recording_id: report.recording_id.clone(),
                    reason: report.failure_reason.clone().unwrap_or_default(),
                });
            }
            Ok(())
        }
        Commands::Show(args) => render(&context.show(&args.recording_id).await?, cli.format),
        Commands::List(args) => render(&context.list(args)?, cli.format),
        Commands::Rename(args) => render(&context.rename(args)?, cli.format),
        Commands::Delete(args) => render(&context.delete(&args.recording_id).await?, cli.format),
        Commands::Rerun(args) => render(&context.rerun(&args.recording_id).await?, cli.format),
        Commands::Sweep(args) => render(&context.sweep(args).await?, cli.format),
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: RecapConfig,
    service: RecordingService,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_recap_config(&cli.config)?;
        let service = match &cli.db {
            Some(db_path) => RecordingService::open(&config, db_path)?,
            None => RecordingService::new(&config)?,
        };
        Ok(Self { config, service })
    }

    fn status(&self) -> Result<StatusReport> {
        let counts = self.service.status_counts()?;
        let stalled = self.service.store().list_stalled(STALLED_SCAN_LIMIT)?.len();
        Ok(StatusReport {
            node_name: self.config.system.node_name.clone(),
            environment: self.config.system.environment.clone(),
            database: self.service.store().path().to_path_buf(),
            media_dir: self.service.layout().root().to_path_buf(),
            counts: counts.into_iter().collect(),
            stalled,
        })
    }

    fn start(&self, args: &OwnerArgs) -> Result<SessionStarted> {
        let actor = Actor::new(&args.owner)?;
        let recording_id = self.service.start_session(&actor)?;
        Ok(SessionStarted {
            recording_id,
            owner: args.owner.clone(),
        })
    }

    async fn upload(&self, args: &UploadArgs) -> Result<UploadReport> {
        if args.chunk_size == 0 {
            return Err(AppError::InvalidArgument("chunk size must be positive".into()));
        }
        let actor = Actor::new(&args.owner)?;
        let data = tokio::fs::read(&args.file).await?;
        if data.is_empty() {
            return Err(AppError::InvalidArgument(format!(
                "{} is empty",
                args.file.display()
            )));
        }
        let recording_id = match &args.id {
            Some(id) => id.clone(),
            None => self.service.start_session(&actor)?,
        };
        let order = delivery_order(data.len(), args.chunk_size, args.shuffle);
        let total = order.len();
        info!(recording_id = %recording_id, chunks = total, bytes = data.len(), "uploading");

        let mut handle = None;
        for (position, index) in order.into_iter().enumerate() {
            let start = index as usize * args.chunk_size;
            let end = (start + args.chunk_size).min(data.len());
            let is_last = position + 1 == total;
            let receipt = self
                .service
                .submit_chunk(&actor, &recording_id, index, &data[start..end], is_last)
                .await?;
            if let ChunkReceipt::Finalized { pipeline, .. } = receipt {
                handle = Some(pipeline);
            }
        }
        let Some(handle) = handle else {
            return Err(AppError::InvalidArgument(
                "terminal chunk did not finalize the recording".into(),
            ));
        };
        let report = handle.wait().await?;
        Ok(UploadReport::new(total, data.len(), report))
    }

    async fn show(&self, recording_id: &str) -> Result<RecordingDetail> {
        let recording = self.service.get_recording(recording_id)?;
        let staged_indices = self.service.staged_indices(recording_id).await?;
        let transitions = self.service.transitions(recording_id)?;
        Ok(RecordingDetail {
            recording,
            staged_indices,
            transitions,
        })
    }

    fn list(&self, args: &ListArgs) -> Result<RecordingList> {
        let actor = Actor::new(&args.owner)?;
        let rows = self
            .service
            .list_recordings(&actor, args.status, args.limit)?;
        Ok(RecordingList { rows })
    }

    fn rename(&self, args: &RenameArgs) -> Result<RecordingList> {
        let actor = Actor::new(&args.owner)?;
        self.service
            .rename_recording(&actor, &args.recording_id, &args.title)?;
        Ok(RecordingList {
            rows: vec![self.service.get_recording(&args.recording_id)?],
        })
    }

    async fn delete(&self, recording_id: &str) -> Result<RecordingList> {
        let deleted = self.service.delete_recording(recording_id).await?;
        Ok(RecordingList {
            rows: vec![deleted],
        })
    }

    async fn rerun(&self, recording_id: &str) -> Result<UploadReport> {
        let report = self.service.rerun_pipeline(recording_id)?.wait().await?;
        Ok(UploadReport::new(0, 0, report))
    }

    async fn sweep(&self, args: &SweepArgs) -> Result<SweepReport> {
        let max_age = args
            .max_age_hours
            .map(hours)
            .unwrap_or_else(|| self.config.staging_retention());
        Ok(self.service.sweep_abandoned(max_age).await?)
    }
}

fn hours(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(3600))
}

/// Chunk indices in submission order. The highest index always goes last so it
/// can carry the terminal flag.
fn delivery_order(len: usize, chunk_size: usize, shuffle: bool) -> Vec<u32> {
    let count = len.div_ceil(chunk_size) as u32;
    let mut order: Vec<u32> = (0..count).collect();
    if shuffle && count > 1 {
        let last = count as usize - 1;
        order[..last].shuffle(&mut rand::thread_rng());
    }
    order
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub node_name: String,
    pub environment: String,
    pub database: PathBuf,
    pub media_dir: PathBuf,
    pub counts: BTreeMap<String, usize>,
    pub stalled: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionStarted {
    pub recording_id: String,
    pub owner: String,
}

#[derive(Debug, Serialize)]
pub struct UploadReport {
    pub recording_id: String,
    pub chunks: usize,
    pub bytes: usize,
    pub status: RecordingStatus,
    pub failure_reason: Option<String>,
    pub pipeline: PipelineReport,
}

impl UploadReport {
    fn new(chunks: usize, bytes: usize, pipeline: PipelineReport) -> Self {
        Self {
            recording_id: pipeline.recording_id.clone(),
            chunks,
            bytes,
            status: pipeline.status,
            failure_reason: pipeline.failure_reason.clone(),
            pipeline,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordingDetail {
    pub recording: Recording,
    pub staged_indices: Vec<u32>,
    pub transitions: Vec<RecordingTransition>,
}

#[derive(Debug, Serialize)]
pub struct RecordingList {
    pub rows: Vec<Recording>,
}

fn location(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Node: {} (env: {})", self.node_name, self.environment),
            format!("Database: {}", self.database.display()),
            format!("Media: {}", self.media_dir.display()),
        ];
        if !self.counts.is_empty() {
            lines.push("Recordings:".to_string());
            for (status, count) in &self.counts {
                lines.push(format!("  - {status}: {count}"));
            }
        }
        if self.stalled > 0 {
            lines.push(format!("Stalled pipelines: {}", self.stalled));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SessionStarted {
    fn display(&self) -> String {
        self.recording_id.clone()
    }
}

impl DisplayFallback for UploadReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} | status={} | chunks={} | bytes={}",
            self.recording_id, self.status, self.chunks, self.bytes
        )];
        if let Some(reason) = &self.failure_reason {
            lines.push(format!("  failure: {reason}"));
        }
        let artifacts = &self.pipeline.artifacts;
        for (name, path) in [
            ("audio", &artifacts.audio),
            ("transcript", &artifacts.transcript),
            ("compressed", &artifacts.compressed),
            ("thumbnail", &artifacts.thumbnail),
        ] {
            if path.is_some() {
                lines.push(format!("  {name}: {}", location(path)));
            }
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Recording {
    fn display(&self) -> String {
        format!(
            "{} | {} | owner={} | status={}",
            self.recording_id, self.title, self.owner, self.status
        )
    }
}

impl DisplayFallback for RecordingDetail {
    fn display(&self) -> String {
        let r = &self.recording;
        let mut lines = vec![
            r.display(),
            format!("  original: {}", location(&r.original_location)),
            format!("  audio: {}", location(&r.audio_location)),
            format!("  transcript: {}", location(&r.transcript_location)),
            format!("  compressed: {}", location(&r.compressed_location)),
            format!("  thumbnail: {}", location(&r.thumbnail_location)),
        ];
        if let Some(reason) = &r.failure_reason {
            lines.push(format!("  failure: {reason}"));
        }
        if !self.staged_indices.is_empty() {
            lines.push(format!("  staged chunks: {:?}", self.staged_indices));
        }
        for transition in &self.transitions {
            let from = transition
                .status_from
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "  {from} -> {} {}",
                transition.status_to,
                transition.note.as_deref().unwrap_or("")
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for RecordingList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No recordings found".to_string();
        }
        self.rows
            .iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for SweepReport {
    fn display(&self) -> String {
        let mut line = format!(
            "Removed {} staging dirs ({} bytes)",
            self.directories_removed, self.bytes_freed
        );
        if !self.recordings_failed.is_empty() {
            line.push_str(&format!(
                "; abandoned: {}",
                self.recordings_failed.join(", ")
            ));
        }
        line
    }
}
