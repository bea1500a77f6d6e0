use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Processing,
    Completed,
    Failed,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Processing => "processing",
            RecordingStatus::Completed => "completed",
            RecordingStatus::Failed => "failed",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, RecordingStatus::Completed | RecordingStatus::Failed)
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(RecordingStatus::Processing),
            "completed" => Ok(RecordingStatus::Completed),
            "failed" => Ok(RecordingStatus::Failed),
            other => Err(format!("unknown recording status: {other}")),
        }
    }
}

impl FromSql for RecordingStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err: String| FromSqlError::Other(err.into()))
    }
}

/// One capture session and the locations of everything derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recording {
    pub recording_id: String,
    pub owner: String,
    pub title: String,
    pub status: RecordingStatus,
    pub original_location: Option<PathBuf>,
    pub audio_location: Option<PathBuf>,
    pub transcript_location: Option<PathBuf>,
    pub compressed_location: Option<PathBuf>,
    pub thumbnail_location: Option<PathBuf>,
    pub failure_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Recording {
    pub fn new(recording_id: impl Into<String>, owner: impl Into<String>) -> Self {
        let recording_id = recording_id.into();
        Self {
            title: format!("Untitled Video {recording_id}"),
            recording_id,
            owner: owner.into(),
            status: RecordingStatus::Processing,
            original_location: None,
            audio_location: None,
            transcript_location: None,
            compressed_location: None,
            thumbnail_location: None,
            failure_reason: None,
            created_at: None,
            updated_at: None,
            merged_at: None,
            completed_at: None,
        }
    }

    /// True once the terminal chunk has been merged into the original artifact.
    pub fn merged(&self) -> bool {
        self.original_location.is_some()
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            recording_id: row.get("recording_id")?,
            owner: row.get("owner")?,
            title: row.get("title")?,
            status: row.get("status")?,
            original_location: path_column(row, "original_location")?,
            audio_location: path_column(row, "audio_location")?,
            transcript_location: path_column(row, "transcript_location")?,
            compressed_location: path_column(row, "compressed_location")?,
            thumbnail_location: path_column(row, "thumbnail_location")?,
            failure_reason: row.get("failure_reason")?,
            created_at: time_column(row, "created_at")?,
            updated_at: time_column(row, "updated_at")?,
            merged_at: time_column(row, "merged_at")?,
            completed_at: time_column(row, "completed_at")?,
        })
    }
}

fn path_column(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<PathBuf>> {
    Ok(row.get::<_, Option<String>>(name)?.map(PathBuf::from))
}

fn time_column(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<NaiveDateTime> = row.get(name)?;
    Ok(value.map(|dt| Utc.from_utc_datetime(&dt)))
}

/// Derived artifact locations written by the pipeline on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtifactLocations {
    pub audio: Option<PathBuf>,
    pub transcript: Option<PathBuf>,
    pub compressed: Option<PathBuf>,
    pub thumbnail: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingTransition {
    pub recording_id: String,
    pub status_from: Option<RecordingStatus>,
    pub status_to: RecordingStatus,
    pub note: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}
