use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RecapConfig;
use crate::ident::generate_id;
use crate::ingest::{
    self, ChunkStore, IngestError, MediaLayout, MergeOutcome, Merger, StagedSession,
};
use crate::pipeline::{
    CommandExecutor, PipelineError, PipelineReport, PipelineResult, PipelineRunner, Transcriber,
};
use crate::recording::{
    Recording, RecordingError, RecordingStatus, RecordingTransition, SqliteRecordingStore,
};

const MAX_ID_ATTEMPTS: usize = 5;
const ABANDONED_REASON: &str = "upload abandoned";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("recording {recording_id} not found")]
    NotFound { recording_id: String },
    #[error("recording {recording_id}: {reason}")]
    Conflict {
        recording_id: String,
        reason: String,
    },
    #[error("no staged chunks for recording {recording_id}")]
    EmptyMerge { recording_id: String },
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("invalid owner key `{0}`")]
    InvalidActor(String),
    #[error("invalid recording id `{0}`")]
    InvalidRecordingId(String),
    #[error("invalid title: {0}")]
    InvalidTitle(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("database error: {0}")]
    Database(#[source] RecordingError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("pipeline task aborted: {0}")]
    TaskAborted(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<RecordingError> for ServiceError {
    fn from(error: RecordingError) -> Self {
        match error {
            RecordingError::NotFound { recording_id } => ServiceError::NotFound { recording_id },
            RecordingError::InvalidTransition {
                recording_id,
                from,
                to,
            } => ServiceError::Conflict {
                recording_id,
                reason: format!("cannot move from {from} to {to}"),
            },
            other => ServiceError::Database(other),
        }
    }
}

impl From<IngestError> for ServiceError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::EmptyMerge { recording_id } => ServiceError::EmptyMerge { recording_id },
            IngestError::InvalidChunk(reason) => ServiceError::InvalidChunk(reason),
            IngestError::Io { source, path } => ServiceError::Io { source, path },
        }
    }
}

fn owner_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$").expect("valid regex"))
}

fn recording_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9A-Za-z]{1,64}$").expect("valid regex"))
}

fn validate_recording_id(recording_id: &str) -> ServiceResult<()> {
    if recording_id_pattern().is_match(recording_id) {
        Ok(())
    } else {
        Err(ServiceError::InvalidRecordingId(recording_id.to_string()))
    }
}

/// The caller on whose behalf an operation runs. The owner key doubles as a
/// directory name under the staging root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Actor {
    owner: String,
}

impl Actor {
    pub fn new(owner: impl Into<String>) -> ServiceResult<Self> {
        let owner = owner.into();
        if owner == "." || owner == ".." || !owner_pattern().is_match(&owner) {
            return Err(ServiceError::InvalidActor(owner));
        }
        Ok(Self { owner })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[derive(Debug)]
pub enum ChunkReceipt {
    Accepted {
        index: u32,
    },
    /// The terminal chunk was merged and the pipeline dispatched.
    Finalized {
        merge: MergeOutcome,
        pipeline: PipelineHandle,
    },
}

/// A dispatched pipeline run. Dropping the handle detaches the run; it keeps
/// going in the background.
#[derive(Debug)]
pub struct PipelineHandle {
    recording_id: String,
    task: JoinHandle<PipelineResult<PipelineReport>>,
}

impl PipelineHandle {
    pub fn recording_id(&self) -> &str {
        &self.recording_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> ServiceResult<PipelineReport> {
        match self.task.await {
            Ok(result) => Ok(result?),
            Err(err) => Err(ServiceError::TaskAborted(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub directories_removed: usize,
    pub bytes_freed: u64,
    pub recordings_failed: Vec<String>,
}

type LockMap = Mutex<HashMap<String, Arc<RwLock<()>>>>;
type RunningSet = Arc<Mutex<HashSet<String>>>;

/// Shared use of one recording's lock. The map entry is dropped together with
/// the last lease, so only recordings with an operation in flight hold one.
struct LockLease<'a> {
    locks: &'a LockMap,
    recording_id: String,
    lock: Arc<RwLock<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // one reference in the map, one here
        if Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.recording_id)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock))
        {
            locks.remove(&self.recording_id);
        }
    }
}

/// Marks a recording as having a pipeline run in flight until dropped.
struct PipelineClaim {
    running: RunningSet,
    recording_id: String,
}

impl Drop for PipelineClaim {
    fn drop(&mut self) {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        running.remove(&self.recording_id);
    }
}

/// Entry point for every recording operation.
#[derive(Debug)]
pub struct RecordingService {
    store: SqliteRecordingStore,
    chunks: ChunkStore,
    merger: Merger,
    runner: Arc<PipelineRunner>,
    locks: LockMap,
    running: RunningSet,
    id_length: usize,
}

impl RecordingService {
    /// Opens (and migrates) the recording store named by the config.
    pub fn new(config: &RecapConfig) -> ServiceResult<Self> {
        Self::open(config, config.database_path())
    }

    /// Like `new`, with the recording store at `database` instead of the
    /// configured location.
    pub fn open(config: &RecapConfig, database: impl AsRef<Path>) -> ServiceResult<Self> {
        let store = SqliteRecordingStore::builder()
            .path(database)
            .create_if_missing(true)
            .build()?;
        store.initialize()?;
        let layout = MediaLayout::new(config.media_dir());
        let runner = PipelineRunner::new(config, store.clone(), layout.clone());
        Ok(Self::from_parts(store, layout, runner, config.ingest.id_length))
    }

    pub fn from_parts(
        store: SqliteRecordingStore,
        layout: MediaLayout,
        runner: PipelineRunner,
        id_length: usize,
    ) -> Self {
        Self {
            store,
            chunks: ChunkStore::new(layout.clone()),
            merger: Merger::new(layout),
            runner: Arc::new(runner),
            locks: Mutex::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashSet::new())),
            id_length,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.runner = Arc::new(self.runner.as_ref().clone().with_executor(executor));
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.runner = Arc::new(self.runner.as_ref().clone().with_transcriber(transcriber));
        self
    }

    pub fn store(&self) -> &SqliteRecordingStore {
        &self.store
    }

    pub fn layout(&self) -> &MediaLayout {
        self.chunks.layout()
    }

    pub fn start_session(&self, actor: &Actor) -> ServiceResult<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let recording_id = generate_id(self.id_length);
            match self.store.create(&Recording::new(&recording_id, actor.owner())) {
                Ok(()) => {
                    info!(recording_id = %recording_id, owner = actor.owner(), "session started");
                    return Ok(recording_id);
                }
                Err(RecordingError::Duplicate { recording_id }) => {
                    warn!(recording_id = %recording_id, "identifier collision, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ServiceError::Conflict {
            recording_id: String::new(),
            reason: format!("no unique identifier after {MAX_ID_ATTEMPTS} attempts"),
        })
    }

    /// Stages one chunk. Non-terminal chunks must carry data; a terminal chunk may
    /// be empty, acting as a bare end-of-stream marker.
    pub async fn submit_chunk(
        &self,
        actor: &Actor,
        recording_id: &str,
        index: u32,
        payload: &[u8],
        is_last: bool,
    ) -> ServiceResult<ChunkReceipt> {
        validate_recording_id(recording_id)?;
        self.accepting(actor, recording_id)?;
        let lease = self.lease(recording_id);

        if !is_last {
            let _shared = lease.lock.read().await;
            self.accepting(actor, recording_id)?;
            self.chunks
                .write_chunk(actor.owner(), recording_id, index, payload)
                .await?;
            return Ok(ChunkReceipt::Accepted { index });
        }

        let (merge, claim) = {
            let _exclusive = lease.lock.write().await;
            self.accepting(actor, recording_id)?;
            let claim = self.claim_pipeline(recording_id)?;
            if !payload.is_empty() {
                self.chunks
                    .write_chunk(actor.owner(), recording_id, index, payload)
                    .await?;
            }
            let merge = self.merger.merge(actor.owner(), recording_id).await?;
            self.store.record_original(recording_id, &merge.path)?;
            (merge, claim)
        };
        drop(lease);
        info!(
            recording_id,
            chunks = merge.chunk_count,
            bytes = merge.size_bytes,
            "recording merged"
        );
        let pipeline = self.dispatch(claim, merge.path.clone(), actor.owner());
        Ok(ChunkReceipt::Finalized { merge, pipeline })
    }

    pub fn get_recording(&self, recording_id: &str) -> ServiceResult<Recording> {
        validate_recording_id(recording_id)?;
        Ok(self.store.get(recording_id)?)
    }

    pub fn list_recordings(
        &self,
        actor: &Actor,
        status: Option<RecordingStatus>,
        limit: usize,
    ) -> ServiceResult<Vec<Recording>> {
        Ok(self.store.list_by_owner(actor.owner(), status, limit)?)
    }

    pub fn rename_recording(
        &self,
        actor: &Actor,
        recording_id: &str,
        title: &str,
    ) -> ServiceResult<()> {
        validate_recording_id(recording_id)?;
        let title = title.trim();
        if title.is_empty() {
            return Err(ServiceError::InvalidTitle("title is empty".into()));
        }
        self.owned(actor, recording_id)?;
        self.store.rename(recording_id, title)?;
        Ok(())
    }

    pub async fn staged_indices(&self, recording_id: &str) -> ServiceResult<Vec<u32>> {
        let recording = self.get_recording(recording_id)?;
        Ok(self
            .chunks
            .staged_indices(&recording.owner, recording_id)
            .await?)
    }

    pub fn transitions(&self, recording_id: &str) -> ServiceResult<Vec<RecordingTransition>> {
        validate_recording_id(recording_id)?;
        Ok(self.store.transitions(recording_id)?)
    }

    pub fn status_counts(&self) -> ServiceResult<HashMap<String, usize>> {
        Ok(self.store.count_by_status()?)
    }

    /// Removes the record together with its artifact and staging directories. A
    /// pipeline still running for it fails its final update and leaves no record.
    pub async fn delete_recording(&self, recording_id: &str) -> ServiceResult<Recording> {
        validate_recording_id(recording_id)?;
        let lease = self.lease(recording_id);
        let recording = {
            let _exclusive = lease.lock.write().await;
            let recording = self.store.delete(recording_id)?;
            ingest::remove_tree(&self.layout().artifact_dir(recording_id)).await?;
            self.chunks
                .remove_staging(&recording.owner, recording_id)
                .await?;
            recording
        };
        drop(lease);
        info!(recording_id, owner = %recording.owner, "recording deleted");
        Ok(recording)
    }

    /// Runs the pipeline again for a merged recording that never settled. Refused
    /// while a run for the same recording is still in flight.
    pub fn rerun_pipeline(&self, recording_id: &str) -> ServiceResult<PipelineHandle> {
        validate_recording_id(recording_id)?;
        let claim = self.claim_pipeline(recording_id)?;
        let recording = self.get_recording(recording_id)?;
        if recording.status.terminal() {
            return Err(ServiceError::Conflict {
                recording_id: recording_id.to_string(),
                reason: format!("already {}", recording.status),
            });
        }
        let Some(original) = recording.original_location.clone() else {
            return Err(ServiceError::Conflict {
                recording_id: recording_id.to_string(),
                reason: "not merged yet".into(),
            });
        };
        info!(recording_id, "pipeline rerun requested");
        Ok(self.dispatch(claim, original, &recording.owner))
    }

    /// Drops staging directories untouched for `max_age` and fails the uploads
    /// that never reached their terminal chunk.
    pub async fn sweep_abandoned(&self, max_age: Duration) -> ServiceResult<SweepReport> {
        let mut report = SweepReport::default();
        for listed in self.chunks.stale_sessions(max_age)? {
            self.sweep_session(listed, max_age, &mut report).await?;
        }
        Ok(report)
    }

    /// Staleness is decided again under the exclusive lock; a chunk that landed
    /// after the listing keeps the session alive.
    async fn sweep_session(
        &self,
        listed: StagedSession,
        max_age: Duration,
        report: &mut SweepReport,
    ) -> ServiceResult<()> {
        let lease = self.lease(&listed.recording_id);
        let _exclusive = lease.lock.write().await;
        let Some(session) = self.chunks.recheck_stale(&listed, max_age)? else {
            debug!(recording_id = %listed.recording_id, "staging active again, kept");
            return Ok(());
        };
        if let Some(recording) = self.store.fetch_by_id(&session.recording_id)? {
            if recording.status == RecordingStatus::Processing && !recording.merged() {
                self.store
                    .mark_failed(&recording.recording_id, ABANDONED_REASON)?;
                report.recordings_failed.push(recording.recording_id);
            }
        }
        report.bytes_freed += self
            .chunks
            .remove_staging(&session.owner, &session.recording_id)
            .await?;
        report.directories_removed += 1;
        info!(
            recording_id = %session.recording_id,
            owner = %session.owner,
            bytes = session.bytes,
            "stale staging removed"
        );
        Ok(())
    }

    fn dispatch(&self, claim: PipelineClaim, merged: PathBuf, owner: &str) -> PipelineHandle {
        let runner = Arc::clone(&self.runner);
        let recording_id = claim.recording_id.clone();
        let owner = owner.to_string();
        let task = tokio::spawn(async move {
            let result = runner.run(&claim.recording_id, &merged, &owner).await;
            if let Err(err) = &result {
                warn!(
                    recording_id = %claim.recording_id,
                    error = %err,
                    "pipeline could not settle recording"
                );
            }
            drop(claim);
            result
        });
        PipelineHandle { recording_id, task }
    }

    fn claim_pipeline(&self, recording_id: &str) -> ServiceResult<PipelineClaim> {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !running.insert(recording_id.to_string()) {
            return Err(ServiceError::Conflict {
                recording_id: recording_id.to_string(),
                reason: "pipeline already running".into(),
            });
        }
        Ok(PipelineClaim {
            running: Arc::clone(&self.running),
            recording_id: recording_id.to_string(),
        })
    }

    /// Loads the recording if it belongs to `actor`; someone else's recording is
    /// reported as missing.
    fn owned(&self, actor: &Actor, recording_id: &str) -> ServiceResult<Recording> {
        match self.store.fetch_by_id(recording_id)? {
            Some(recording) if recording.owner == actor.owner() => Ok(recording),
            _ => Err(ServiceError::NotFound {
                recording_id: recording_id.to_string(),
            }),
        }
    }

    fn accepting(&self, actor: &Actor, recording_id: &str) -> ServiceResult<Recording> {
        let recording = self.owned(actor, recording_id)?;
        if recording.status.terminal() {
            return Err(ServiceError::Conflict {
                recording_id: recording_id.to_string(),
                reason: format!("already {}", recording.status),
            });
        }
        if recording.merged() {
            return Err(ServiceError::Conflict {
                recording_id: recording_id.to_string(),
                reason: "already merged".into(),
            });
        }
        Ok(recording)
    }

    fn lease(&self, recording_id: &str) -> LockLease<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = Arc::clone(locks.entry(recording_id.to_string()).or_default());
        LockLease {
            locks: &self.locks,
            recording_id: recording_id.to_string(),
            lock,
        }
    }
}
