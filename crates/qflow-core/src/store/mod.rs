//! Durable chunk storage.
//!
//! Each upload owns a sparse staging file pre-sized to the full length.
//! Chunks land at their offsets independently of each other; the file is only
//! moved to its final name once it is complete and verified.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::checksum::{self, Checksum, ChecksumAlgorithm};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Extension of staging files.
pub const STAGING_EXTENSION: &str = "part";

/// Offset-addressed storage for in-progress transfers.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    temp_dir: PathBuf,
    io_retry: RetryPolicy,
}

impl ChunkStore {
    /// Create a store that stages files in `temp_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn new(temp_dir: impl Into<PathBuf>, io_retry: RetryPolicy) -> Result<Self> {
        let temp_dir = temp_dir.into();
        fs::create_dir_all(&temp_dir).await?;
        Ok(Self { temp_dir, io_retry })
    }

    /// Directory holding staging files.
    #[must_use]
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Staging path of a task.
    #[must_use]
    pub fn staging_path(&self, task_id: &str) -> PathBuf {
        self.temp_dir.join(format!("{task_id}.{STAGING_EXTENSION}"))
    }

    /// Create (or reopen) the staging file of a task, sized to `size` bytes.
    ///
    /// Existing content is kept so a resumed task does not lose its chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or resized.
    pub async fn allocate(&self, task_id: &str, size: u64) -> Result<PathBuf> {
        let path = self.staging_path(task_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.set_len(size).await?;

        tracing::debug!(task_id, size, path = %path.display(), "Allocated staging file");
        Ok(path)
    }

    /// Write `data` at `offset` of an allocated staging file.
    ///
    /// Never creates the file, so a write racing a release fails with
    /// [`Error::TaskNotFound`]. Transient I/O is retried; exhaustion becomes
    /// [`Error::StorageError`].
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails permanently.
    pub async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        self.io_retry
            .run(|| write_once(path, offset, data), is_transient)
            .await
            .map_err(|e| classify(path, e))
    }

    /// Read `length` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is shorter than requested.
    pub async fn read_range(&self, path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.io_retry
            .run(|| read_once(path, offset, length), is_transient)
            .await
            .map_err(|e| classify(path, e))
    }

    /// Digest the whole file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn digest(&self, path: &Path, algorithm: ChecksumAlgorithm) -> Result<Checksum> {
        checksum::digest_file(path, algorithm).await
    }

    /// Move a complete staging file to `dest`.
    ///
    /// Parent directories are created. With `overwrite` false an existing
    /// destination is left alone and [`Error::AlreadyExists`] is returned.
    /// A rename across filesystems falls back to copying into a sibling
    /// temporary file that is then renamed, so `dest` never shows partial
    /// content.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination exists or the move fails.
    pub async fn publish(&self, staged: &Path, dest: &Path, overwrite: bool) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        if !overwrite && fs::try_exists(dest).await? {
            return Err(Error::AlreadyExists(dest.display().to_string()));
        }

        if let Err(e) = fs::rename(staged, dest).await {
            tracing::debug!(error = %e, "Rename failed, copying into place");

            let file_name = dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let sibling = dest.with_file_name(format!(".{file_name}.{STAGING_EXTENSION}"));

            fs::copy(staged, &sibling).await?;
            fs::File::open(&sibling).await?.sync_all().await?;
            fs::rename(&sibling, dest).await?;
            self.release(staged).await;
        }

        tracing::debug!(dest = %dest.display(), "Published file");
        Ok(())
    }

    /// Remove a staging file, ignoring one that is already gone.
    pub async fn release(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Released staging file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to release staging file"
            ),
        }
    }
}

async fn write_once(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.sync_data().await
}

async fn read_once(path: &Path, offset: u64, length: u64) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let len = usize::try_from(length).map_err(|_| std::io::Error::from(ErrorKind::InvalidInput))?;
    let mut buffer = vec![0u8; len];
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

fn classify(path: &Path, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        let task = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Error::TaskNotFound(task)
    } else if is_transient(&e) {
        Error::StorageError(format!("{}: {e}", path.display()))
    } else {
        Error::Io(e)
    }
}
