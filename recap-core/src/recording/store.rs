use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Transaction};

use crate::sqlite::configure_connection;

use super::models::{ArtifactLocations, Recording, RecordingStatus, RecordingTransition};
use super::{RecordingError, RecordingResult};

const RECORDING_SCHEMA: &str = include_str!("../../../sql/recordings.sql");

#[derive(Debug, Clone)]
pub struct SqliteRecordingStoreBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for SqliteRecordingStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl SqliteRecordingStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> RecordingResult<SqliteRecordingStore> {
        let path = self.path.ok_or(RecordingError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteRecordingStore { path, flags })
    }
}

/// Lifecycle tracker backed by SQLite.
///
/// Every status change is a single guarded `UPDATE ... WHERE status = 'processing'`,
/// so a recording that reached `completed` or `failed` can never be moved again.
/// Artifact columns are only ever written through `COALESCE`, never cleared.
#[derive(Debug, Clone)]
pub struct SqliteRecordingStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteRecordingStore {
    pub fn builder() -> SqliteRecordingStoreBuilder {
        SqliteRecordingStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> RecordingResult<Self> {
        SqliteRecordingStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> RecordingResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            RecordingError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| RecordingError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> RecordingResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(RECORDING_SCHEMA)?;
        Ok(())
    }

    pub fn create(&self, recording: &Recording) -> RecordingResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let now = Utc::now().naive_utc();
        let inserted = tx.execute(
            "INSERT INTO recordings (recording_id, owner, title, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'processing', ?4, ?4)",
            params![&recording.recording_id, &recording.owner, &recording.title, now],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(RecordingError::Duplicate {
                    recording_id: recording.recording_id.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        }
        log_transition(
            &tx,
            &recording.recording_id,
            None,
            RecordingStatus::Processing,
            Some("session started"),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn fetch_by_id(&self, recording_id: &str) -> RecordingResult<Option<Recording>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM recordings WHERE recording_id = ?1")?;
        let recording = stmt
            .query_row([recording_id], |row| Recording::from_row(row))
            .optional()?;
        Ok(recording)
    }

    pub fn get(&self, recording_id: &str) -> RecordingResult<Recording> {
        self.fetch_by_id(recording_id)?
            .ok_or_else(|| RecordingError::NotFound {
                recording_id: recording_id.to_string(),
            })
    }

    pub fn list_by_owner(
        &self,
        owner: &str,
        status: Option<RecordingStatus>,
        limit: usize,
    ) -> RecordingResult<Vec<Recording>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM recordings
             WHERE owner = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, recording_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![owner, status.as_ref().map(RecordingStatus::as_str), limit as i64],
                |row| Recording::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Merged recordings whose pipeline never reached a terminal state.
    pub fn list_stalled(&self, limit: usize) -> RecordingResult<Vec<Recording>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM recordings
             WHERE status = 'processing' AND original_location IS NOT NULL
             ORDER BY merged_at ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| Recording::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_by_status(&self) -> RecordingResult<HashMap<String, usize>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM recordings GROUP BY status")?;
        let mut map = HashMap::new();
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (status, count) = row?;
            map.insert(status, count as usize);
        }
        Ok(map)
    }

    /// Confirms the recording is still processing. Terminal recordings are rejected.
    pub fn mark_processing(&self, recording_id: &str) -> RecordingResult<()> {
        let recording = self.get(recording_id)?;
        if recording.status.terminal() {
            return Err(RecordingError::InvalidTransition {
                recording_id: recording_id.to_string(),
                from: recording.status,
                to: RecordingStatus::Processing,
            });
        }
        Ok(())
    }

    /// Stores the merged artifact location. Status stays `processing` until the
    /// pipeline settles it. Flipping to `completed` here would contradict the
    /// forward-only rule: a later stage failure must still land as `failed`,
    /// and `completed -> failed` is never allowed.
    pub fn record_original(&self, recording_id: &str, location: &Path) -> RecordingResult<()> {
        let conn = self.open()?;
        let now = Utc::now().naive_utc();
        let affected = conn.execute(
            "UPDATE recordings
             SET original_location = ?2,
                 merged_at = ?3,
                 updated_at = ?3
             WHERE recording_id = ?1 AND status = 'processing'",
            params![recording_id, path_text(location), now],
        )?;
        if affected == 0 {
            return Err(self.rejection(&conn, recording_id, RecordingStatus::Processing)?);
        }
        Ok(())
    }

    pub fn mark_completed(
        &self,
        recording_id: &str,
        artifacts: &ArtifactLocations,
    ) -> RecordingResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let now = Utc::now().naive_utc();
        let affected = tx.execute(
            "UPDATE recordings
             SET status = 'completed',
                 audio_location = COALESCE(?2, audio_location),
                 transcript_location = COALESCE(?3, transcript_location),
                 compressed_location = COALESCE(?4, compressed_location),
                 thumbnail_location = COALESCE(?5, thumbnail_location),
                 updated_at = ?6,
                 completed_at = ?6
             WHERE recording_id = ?1 AND status = 'processing'",
            params![
                recording_id,
                artifacts.audio.as_deref().map(path_text),
                artifacts.transcript.as_deref().map(path_text),
                artifacts.compressed.as_deref().map(path_text),
                artifacts.thumbnail.as_deref().map(path_text),
                now,
            ],
        )?;
        if affected == 0 {
            return Err(self.rejection(&tx, recording_id, RecordingStatus::Completed)?);
        }
        log_transition(
            &tx,
            recording_id,
            Some(RecordingStatus::Processing),
            RecordingStatus::Completed,
            Some("pipeline completed"),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn mark_failed(&self, recording_id: &str, reason: impl AsRef<str>) -> RecordingResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let now = Utc::now().naive_utc();
        let affected = tx.execute(
            "UPDATE recordings
             SET status = 'failed',
                 failure_reason = ?2,
                 updated_at = ?3
             WHERE recording_id = ?1 AND status = 'processing'",
            params![recording_id, reason.as_ref(), now],
        )?;
        if affected == 0 {
            return Err(self.rejection(&tx, recording_id, RecordingStatus::Failed)?);
        }
        log_transition(
            &tx,
            recording_id,
            Some(RecordingStatus::Processing),
            RecordingStatus::Failed,
            Some(reason.as_ref()),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn rename(&self, recording_id: &str, title: &str) -> RecordingResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE recordings SET title = ?2, updated_at = ?3 WHERE recording_id = ?1",
            params![recording_id, title, Utc::now().naive_utc()],
        )?;
        if affected == 0 {
            return Err(RecordingError::NotFound {
                recording_id: recording_id.to_string(),
            });
        }
        Ok(())
    }

    /// Removes the record and its transition log, returning what was deleted so the
    /// caller can clean up backing files.
    pub fn delete(&self, recording_id: &str) -> RecordingResult<Recording> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let recording = tx
            .query_row(
                "SELECT * FROM recordings WHERE recording_id = ?1",
                [recording_id],
                |row| Recording::from_row(row),
            )
            .optional()?
            .ok_or_else(|| RecordingError::NotFound {
                recording_id: recording_id.to_string(),
            })?;
        tx.execute(
            "DELETE FROM recording_transitions WHERE recording_id = ?1",
            [recording_id],
        )?;
        tx.execute("DELETE FROM recordings WHERE recording_id = ?1", [recording_id])?;
        tx.commit()?;
        Ok(recording)
    }

    pub fn transitions(&self, recording_id: &str) -> RecordingResult<Vec<RecordingTransition>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT recording_id, status_from, status_to, note, created_at
             FROM recording_transitions
             WHERE recording_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([recording_id], |row| {
                let created_at: Option<NaiveDateTime> = row.get(4)?;
                Ok(RecordingTransition {
                    recording_id: row.get(0)?,
                    status_from: row.get(1)?,
                    status_to: row.get(2)?,
                    note: row.get(3)?,
                    created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn rejection(
        &self,
        conn: &Connection,
        recording_id: &str,
        to: RecordingStatus,
    ) -> RecordingResult<RecordingError> {
        let current = conn
            .query_row(
                "SELECT status FROM recordings WHERE recording_id = ?1",
                [recording_id],
                |row| row.get::<_, RecordingStatus>(0),
            )
            .optional()?;
        Ok(match current {
            None => RecordingError::NotFound {
                recording_id: recording_id.to_string(),
            },
            Some(status) => RecordingError::InvalidTransition {
                recording_id: recording_id.to_string(),
                from: status,
                to,
            },
        })
    }
}

fn log_transition(
    tx: &Transaction<'_>,
    recording_id: &str,
    from: Option<RecordingStatus>,
    to: RecordingStatus,
    note: Option<&str>,
) -> RecordingResult<()> {
    tx.execute(
        "INSERT INTO recording_transitions(recording_id, status_from, status_to, note, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            recording_id,
            from.map(|status| status.as_str()),
            to.as_str(),
            note,
            Utc::now().naive_utc(),
        ],
    )?;
    Ok(())
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SqliteRecordingStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteRecordingStore::builder()
            .path(dir.path().join("data/recordings.sqlite"))
            .build()
            .unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    #[test]
    fn create_rejects_duplicate_ids() {
        let (_dir, store) = store();
        let recording = Recording::new("dup0000001", "alice");
        store.create(&recording).unwrap();
        let err = store.create(&recording).unwrap_err();
        assert!(matches!(err, RecordingError::Duplicate { .. }));
    }

    #[test]
    fn record_original_keeps_processing() {
        let (_dir, store) = store();
        store.create(&Recording::new("rec0000001", "alice")).unwrap();
        store
            .record_original("rec0000001", Path::new("/media/rec0000001.mp4"))
            .unwrap();
        let stored = store.get("rec0000001").unwrap();
        assert_eq!(stored.status, RecordingStatus::Processing);
        assert!(stored.merged());
        assert!(stored.merged_at.is_some());
        assert_eq!(store.list_stalled(10).unwrap().len(), 1);
    }

    #[test]
    fn completed_merges_locations_without_clearing() {
        let (_dir, store) = store();
        store.create(&Recording::new("rec0000002", "alice")).unwrap();
        store
            .record_original("rec0000002", Path::new("/media/rec0000002.mp4"))
            .unwrap();
        let artifacts = ArtifactLocations {
            audio: Some("/media/audio.mp3".into()),
            transcript: None,
            compressed: Some("/media/compressed.mp4".into()),
            thumbnail: Some("/media/thumb.jpg".into()),
        };
        store.mark_completed("rec0000002", &artifacts).unwrap();
        let stored = store.get("rec0000002").unwrap();
        assert_eq!(stored.status, RecordingStatus::Completed);
        assert_eq!(
            stored.original_location,
            Some(PathBuf::from("/media/rec0000002.mp4"))
        );
        assert_eq!(stored.transcript_location, None);
        assert!(stored.completed_at.is_some());

        let transitions = store.transitions("rec0000002").unwrap();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[1].status_to, RecordingStatus::Completed);
    }

    #[test]
    fn unknown_recording_is_not_found() {
        let (_dir, store) = store();
        let err = store
            .mark_failed("missing000", "ffmpeg exploded")
            .unwrap_err();
        assert!(matches!(err, RecordingError::NotFound { .. }));
        assert!(matches!(
            store.delete("missing000"),
            Err(RecordingError::NotFound { .. })
        ));
    }

    #[test]
    fn list_by_owner_filters_status() {
        let (_dir, store) = store();
        store.create(&Recording::new("own0000001", "alice")).unwrap();
        store.create(&Recording::new("own0000002", "alice")).unwrap();
        store.create(&Recording::new("own0000003", "bob")).unwrap();
        store.mark_failed("own0000002", "boom").unwrap();

        assert_eq!(store.list_by_owner("alice", None, 10).unwrap().len(), 2);
        let failed = store
            .list_by_owner("alice", Some(RecordingStatus::Failed), 10)
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure_reason.as_deref(), Some("boom"));

        let counts = store.count_by_status().unwrap();
        assert_eq!(counts.get("processing"), Some(&2));
        assert_eq!(counts.get("failed"), Some(&1));
    }

    #[test]
    fn rename_and_delete() {
        let (_dir, store) = store();
        store.create(&Recording::new("ren0000001", "alice")).unwrap();
        store.rename("ren0000001", "Demo walkthrough").unwrap();
        assert_eq!(store.get("ren0000001").unwrap().title, "Demo walkthrough");
        let deleted = store.delete("ren0000001").unwrap();
        assert_eq!(deleted.title, "Demo walkthrough");
        assert!(store.fetch_by_id("ren0000001").unwrap().is_none());
        assert!(store.transitions("ren0000001").unwrap().is_empty());
    }

    #[test]
    fn unknown_transition_status_is_an_error() {
        let (_dir, store) = store();
        store.create(&Recording::new("odd0000001", "alice")).unwrap();
        store
            .open()
            .unwrap()
            .execute(
                "INSERT INTO recording_transitions(recording_id, status_from, status_to)
                 VALUES ('odd0000001', 'processing', 'archived')",
                [],
            )
            .unwrap();
        assert!(matches!(
            store.transitions("odd0000001"),
            Err(RecordingError::Database(
                rusqlite::Error::FromSqlConversionFailure(..)
            ))
        ));
    }
}
