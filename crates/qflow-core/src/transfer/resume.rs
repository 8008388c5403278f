//! Session persistence across restarts.
//!
//! Each unfinished upload is written to `<state_dir>/sessions/<task_id>.session`
//! as JSON. On startup the coordinator reloads the records whose staging file
//! still exists, so clients can query the covered ranges and send only what is
//! missing.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

use super::range::ReceivedRangeSet;
use super::session::SessionInner;
use super::{TaskState, TransferTask};

/// File extension of session records.
pub const SESSION_FILE_EXTENSION: &str = "session";

/// Persisted form of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Task metadata
    pub task: TransferTask,
    /// State when saved
    pub state: TaskState,
    /// Coverage when saved
    pub ranges: ReceivedRangeSet,
    /// Highest sequence number seen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<u64>,
    /// Time of the last change
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Capture a session.
    #[must_use]
    pub fn capture(task: &TransferTask, inner: &SessionInner) -> Self {
        Self {
            task: task.clone(),
            state: inner.state,
            ranges: inner.ranges.clone(),
            last_sequence: inner.last_sequence,
            updated_at: inner.updated_at,
        }
    }
}

/// Directory of [`SessionRecord`] files.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open the store, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "Failed to create session directory {}: {e}",
                dir.display()
            )))
        })?;
        Ok(Self { dir })
    }

    fn record_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.{SESSION_FILE_EXTENSION}"))
    }

    /// Write a record, replacing the previous one atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub async fn save(&self, record: &SessionRecord) -> Result<()> {
        let path = self.record_path(&record.task.task_id);
        let json = serde_json::to_vec_pretty(record)?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;

        tracing::debug!(
            task_id = %record.task.task_id,
            covered = record.ranges.covered(),
            "Saved session"
        );
        Ok(())
    }

    /// Load one record.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing record cannot be read or parsed.
    pub async fn load(&self, task_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.record_path(task_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::load_from_path(&path).await.map(Some)
    }

    async fn load_from_path(path: &Path) -> Result<SessionRecord> {
        let bytes = fs::read(path).await?;
        let record: SessionRecord = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Serialization(format!(
                "Failed to parse session record {}: {e}",
                path.display()
            ))
        })?;
        Ok(record)
    }

    /// All readable records, most recently updated first.
    ///
    /// Unreadable files are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .extension()
                .is_none_or(|ext| ext != SESSION_FILE_EXTENSION)
            {
                continue;
            }

            match Self::load_from_path(&path).await {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable session record"
                ),
            }
        }

        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    /// Remove a record; a missing one is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        match fs::remove_file(self.record_path(task_id)).await {
            Ok(()) => {
                tracing::debug!(task_id, "Deleted session record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove records not updated within `max_age`. Returns how many went.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn cleanup_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut cleaned = 0;

        for record in self.list().await? {
            if record.updated_at >= cutoff {
                continue;
            }
            if let Err(e) = self.delete(&record.task.task_id).await {
                tracing::warn!(
                    task_id = %record.task.task_id,
                    error = %e,
                    "Failed to delete stale session record"
                );
            } else {
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            tracing::info!(count = cleaned, "Cleaned up stale session records");
        }
        Ok(cleaned)
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{Direction, TransferOptions};
    use tempfile::TempDir;

    fn record(id: &str) -> SessionRecord {
        let mut ranges = ReceivedRangeSet::new();
        ranges.insert(0, 1024);
        ranges.insert(4096, 8192);

        SessionRecord {
            task: TransferTask {
                task_id: id.into(),
                direction: Direction::Upload,
                file_name: "movie.mkv".into(),
                total_size: 16384,
                chunk_size: 1024,
                checksum: None,
                options: TransferOptions::default(),
                content_type: Some("video/x-matroska".into()),
                path: "/srv/files/movie.mkv".into(),
                staging_path: Some(format!("/srv/tmp/{id}.part").into()),
                file_id: None,
                created_at: Utc::now(),
            },
            state: TaskState::Active,
            ranges,
            last_sequence: Some(4),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().join("sessions")).await.unwrap();

        let saved = record("abc");
        store.save(&saved).await.unwrap();

        let loaded = store.load("abc").await.unwrap().expect("record exists");
        assert_eq!(loaded, saved);
        assert_eq!(loaded.ranges.covered(), 1024 + 4096);
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();

        store.save(&record("a")).await.unwrap();
        store.save(&record("b")).await.unwrap();
        std::fs::write(dir.path().join("broken.session"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();

        let mut stale = record("stale");
        stale.updated_at = Utc::now() - chrono::Duration::hours(3);
        store.save(&stale).await.unwrap();
        store.save(&record("fresh")).await.unwrap();

        let cleaned = store
            .cleanup_older_than(chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(cleaned, 1);
        assert!(store.load("stale").await.unwrap().is_none());

        store.delete("fresh").await.unwrap();
        store.delete("fresh").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
