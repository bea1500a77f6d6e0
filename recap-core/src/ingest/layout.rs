use std::path::{Path, PathBuf};

use crate::config::TranscriptFormat;

/// Filesystem layout under the media root.
///
/// ```text
/// <root>/staging/<owner>/<recording>/<index>.part
/// <root>/recordings/<recording>/<recording>.mp4
/// <root>/recordings/<recording>/audio_<recording>.mp3
/// ```
#[derive(Debug, Clone)]
pub struct MediaLayout {
    root: PathBuf,
}

impl MediaLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn staging_dir(&self, owner: &str, recording_id: &str) -> PathBuf {
        self.staging_root().join(owner).join(recording_id)
    }

    pub fn chunk_path(&self, owner: &str, recording_id: &str, index: u32) -> PathBuf {
        self.staging_dir(owner, recording_id)
            .join(format!("{index}.{CHUNK_EXTENSION}"))
    }

    pub fn artifact_dir(&self, recording_id: &str) -> PathBuf {
        self.root.join("recordings").join(recording_id)
    }

    pub fn original_path(&self, recording_id: &str) -> PathBuf {
        self.artifact_dir(recording_id)
            .join(format!("{recording_id}.mp4"))
    }

    pub fn audio_path(&self, recording_id: &str) -> PathBuf {
        self.artifact_dir(recording_id)
            .join(format!("audio_{recording_id}.mp3"))
    }

    pub fn transcript_path(&self, recording_id: &str, format: TranscriptFormat) -> PathBuf {
        self.artifact_dir(recording_id).join(format!(
            "transcript_{recording_id}.{}",
            format.extension()
        ))
    }

    pub fn compressed_path(&self, recording_id: &str) -> PathBuf {
        self.artifact_dir(recording_id)
            .join(format!("compressed_{recording_id}.mp4"))
    }

    pub fn thumbnail_path(&self, recording_id: &str) -> PathBuf {
        self.artifact_dir(recording_id)
            .join(format!("thumbnail_{recording_id}.jpg"))
    }

    pub fn manifest_path(&self, recording_id: &str) -> PathBuf {
        self.artifact_dir(recording_id).join("manifest.json")
    }
}

pub const CHUNK_EXTENSION: &str = "part";
