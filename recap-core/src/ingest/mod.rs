mod error;
mod layout;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub use error::{IngestError, IngestResult};
pub use layout::{MediaLayout, CHUNK_EXTENSION};

/// Writes uploaded chunks into the per-recording staging area.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    layout: MediaLayout,
}

impl ChunkStore {
    pub fn new(layout: MediaLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &MediaLayout {
        &self.layout
    }

    /// Stores `payload` in slot `index`. A repeated index replaces the earlier
    /// delivery; the rename keeps the slot from ever holding a torn write.
    pub async fn write_chunk(
        &self,
        owner: &str,
        recording_id: &str,
        index: u32,
        payload: &[u8],
    ) -> IngestResult<PathBuf> {
        if payload.is_empty() {
            return Err(IngestError::InvalidChunk(format!(
                "chunk {index} of {recording_id} has an empty payload"
            )));
        }
        let dir = self.layout.staging_dir(owner, recording_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| IngestError::Io {
                path: dir.clone(),
                source,
            })?;

        let target = self.layout.chunk_path(owner, recording_id, index);
        let nonce: u64 = rand::thread_rng().gen();
        let temp = dir.join(format!(".{index}.{nonce:016x}.tmp"));
        fs::write(&temp, payload)
            .await
            .map_err(|source| IngestError::Io {
                path: temp.clone(),
                source,
            })?;
        if let Err(source) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(IngestError::Io {
                path: target,
                source,
            });
        }
        debug!(recording_id, index, bytes = payload.len(), "chunk staged");
        Ok(target)
    }

    /// Indices currently staged for a recording, in numeric order.
    pub async fn staged_indices(&self, owner: &str, recording_id: &str) -> IngestResult<Vec<u32>> {
        let chunks = list_chunks(&self.layout.staging_dir(owner, recording_id)).await?;
        Ok(chunks.into_iter().map(|(index, _)| index).collect())
    }

    pub async fn remove_staging(&self, owner: &str, recording_id: &str) -> IngestResult<u64> {
        let dir = self.layout.staging_dir(owner, recording_id);
        remove_tree(&dir).await
    }

    /// Staging directories whose newest entry is older than `max_age`.
    pub fn stale_sessions(&self, max_age: Duration) -> IngestResult<Vec<StagedSession>> {
        let root = self.layout.staging_root();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let now = SystemTime::now();
        let mut sessions = Vec::new();
        for entry in WalkDir::new(&root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|err| IngestError::Io {
                path: err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.clone()),
                source: err
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walkdir loop detected")),
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(session) = StagedSession::inspect(entry.path())? else {
                continue;
            };
            if idle_for(now, session.newest) >= max_age {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Re-reads a session returned by `stale_sessions`. `None` when the directory
    /// is gone or took any delivery since it was listed.
    pub fn recheck_stale(
        &self,
        listed: &StagedSession,
        max_age: Duration,
    ) -> IngestResult<Option<StagedSession>> {
        if !listed.path.is_dir() {
            return Ok(None);
        }
        let Some(current) = StagedSession::inspect(&listed.path)? else {
            return Ok(None);
        };
        let untouched = current.newest <= listed.newest
            && current.chunk_count == listed.chunk_count
            && current.bytes == listed.bytes;
        if untouched && idle_for(SystemTime::now(), current.newest) >= max_age {
            Ok(Some(current))
        } else {
            Ok(None)
        }
    }
}

fn idle_for(now: SystemTime, newest: SystemTime) -> Duration {
    now.duration_since(newest).unwrap_or_default()
}

/// One staging directory as found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct StagedSession {
    pub owner: String,
    pub recording_id: String,
    pub path: PathBuf,
    pub chunk_count: usize,
    pub bytes: u64,
    #[serde(skip)]
    pub newest: SystemTime,
}

impl StagedSession {
    fn inspect(dir: &Path) -> IngestResult<Option<Self>> {
        let recording_id = dir.file_name().map(|n| n.to_string_lossy().into_owned());
        let owner = dir
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned());
        let (Some(owner), Some(recording_id)) = (owner, recording_id) else {
            return Ok(None);
        };
        let io_err = |source| IngestError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut newest = std::fs::metadata(dir).and_then(|m| m.modified()).map_err(io_err)?;
        let mut chunk_count = 0;
        let mut bytes = 0;
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let metadata = entry.metadata().map_err(io_err)?;
            if !metadata.is_file() {
                continue;
            }
            bytes += metadata.len();
            if chunk_index(&entry.path()).is_some() {
                chunk_count += 1;
            }
            if let Ok(modified) = metadata.modified() {
                newest = newest.max(modified);
            }
        }
        Ok(Some(Self {
            owner,
            recording_id,
            path: dir.to_path_buf(),
            chunk_count,
            bytes,
            newest,
        }))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MergeOutcome {
    pub recording_id: String,
    pub path: PathBuf,
    pub chunk_count: usize,
    pub size_bytes: u64,
    /// Indices below the highest staged one that never arrived.
    pub missing_indices: Vec<u32>,
}

/// Concatenates staged chunks into the original artifact.
#[derive(Debug, Clone)]
pub struct Merger {
    layout: MediaLayout,
}

impl Merger {
    pub fn new(layout: MediaLayout) -> Self {
        Self { layout }
    }

    /// Joins every staged chunk in numeric index order. Staging files are left in
    /// place.
    pub async fn merge(&self, owner: &str, recording_id: &str) -> IngestResult<MergeOutcome> {
        let staging = self.layout.staging_dir(owner, recording_id);
        let chunks = list_chunks(&staging).await?;
        if chunks.is_empty() {
            return Err(IngestError::EmptyMerge {
                recording_id: recording_id.to_string(),
            });
        }

        let artifact_dir = self.layout.artifact_dir(recording_id);
        fs::create_dir_all(&artifact_dir)
            .await
            .map_err(|source| IngestError::Io {
                path: artifact_dir.clone(),
                source,
            })?;
        let output = self.layout.original_path(recording_id);
        let file = fs::File::create(&output)
            .await
            .map_err(|source| IngestError::Io {
                path: output.clone(),
                source,
            })?;
        let mut writer = BufWriter::new(file);
        let mut size_bytes = 0u64;
        for (_, chunk) in &chunks {
            let mut reader = fs::File::open(chunk)
                .await
                .map_err(|source| IngestError::Io {
                    path: chunk.clone(),
                    source,
                })?;
            size_bytes += tokio::io::copy(&mut reader, &mut writer)
                .await
                .map_err(|source| IngestError::Io {
                    path: output.clone(),
                    source,
                })?;
        }
        writer.flush().await.map_err(|source| IngestError::Io {
            path: output.clone(),
            source,
        })?;

        let missing_indices = missing_indices(chunks.iter().map(|(index, _)| *index));
        if !missing_indices.is_empty() {
            warn!(
                recording_id,
                missing = ?missing_indices,
                "merged recording has gaps in its chunk sequence"
            );
        }
        debug!(recording_id, chunks = chunks.len(), size_bytes, "chunks merged");
        Ok(MergeOutcome {
            recording_id: recording_id.to_string(),
            path: output,
            chunk_count: chunks.len(),
            size_bytes,
            missing_indices,
        })
    }
}

/// Staged chunk files sorted by numeric index, so `10.part` follows `9.part`.
async fn list_chunks(dir: &Path) -> IngestResult<Vec<(u32, PathBuf)>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(IngestError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    let mut chunks = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| IngestError::Io {
            path: dir.to_path_buf(),
            source,
        })?
    {
        let path = entry.path();
        if let Some(index) = chunk_index(&path) {
            chunks.push((index, path));
        }
    }
    chunks.sort_by_key(|(index, _)| *index);
    Ok(chunks)
}

fn chunk_index(path: &Path) -> Option<u32> {
    if path.extension()? != CHUNK_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn missing_indices(sorted: impl Iterator<Item = u32>) -> Vec<u32> {
    let mut missing = Vec::new();
    let mut expected = 0u32;
    for index in sorted {
        missing.extend(expected..index);
        expected = index.saturating_add(1);
    }
    missing
}

pub(crate) async fn remove_tree(dir: &Path) -> IngestResult<u64> {
    let bytes = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum();
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(IngestError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}
