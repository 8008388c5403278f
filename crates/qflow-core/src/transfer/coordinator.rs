//! Public entry point of the transfer engine.
//!
//! [`TransferCoordinator`] validates requests, creates and looks up sessions,
//! moves bytes through the [`ChunkStore`] and drives every session through its
//! state machine. The HTTP layer and the tests talk to nothing else.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::{FileCatalog, FileInfo};
use crate::checksum::{self, Checksum, ChecksumAlgorithm};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::store::ChunkStore;

use super::messages::{
    ChunkAck, ChunkUpload, CompleteUpload, CompletedUpload, DownloadChunk, DownloadLimits,
    DownloadRequest, DownloadTicket, FileList, FileQuery, InitUpload, QuotaFormatted, QuotaInfo,
    RangeReport, ServerLimits, StorageLimits, TransferDetail, TransferList, TransferQuery,
    TransferStats, UploadLimits, UploadTicket,
};
use super::progress::{format_bytes, ProgressSnapshot};
use super::range::ReceivedRangeSet;
use super::registry::SessionRegistry;
use super::resume::{SessionRecord, SessionStore};
use super::session::{SessionInner, TransferSession};
use super::{negotiate_chunk_size, Direction, TaskState, TransferTask};

/// Name of the session record directory inside `state_dir`.
const SESSIONS_DIR: &str = "sessions";

/// What a sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks failed for inactivity
    pub expired: usize,
    /// Finished tasks dropped from history
    pub evicted: usize,
    /// Session records refreshed
    pub persisted: usize,
    /// Catalogued files removed by retention
    pub pruned: usize,
}

/// Orchestrates uploads and downloads.
#[derive(Debug)]
pub struct TransferCoordinator {
    config: Config,
    registry: SessionRegistry,
    store: ChunkStore,
    catalog: Mutex<FileCatalog>,
    sessions: Option<SessionStore>,
    admission: Mutex<()>,
}

impl TransferCoordinator {
    /// Build a coordinator, creating its directories.
    ///
    /// Persisted sessions are not loaded; call [`TransferCoordinator::restore`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a directory
    /// cannot be created.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.storage.root).await?;
        tokio::fs::create_dir_all(&config.storage.state_dir).await?;

        let io_retry = RetryPolicy::fixed(config.transfer.io_retries, config.transfer.io_retry_delay);
        let store = ChunkStore::new(&config.storage.temp_dir, io_retry).await?;
        let catalog = FileCatalog::open(&config.storage.state_dir)?;
        let sessions = if config.session.persist {
            Some(SessionStore::open(config.storage.state_dir.join(SESSIONS_DIR)).await?)
        } else {
            None
        };

        tracing::debug!(
            root = %config.storage.root.display(),
            temp_dir = %config.storage.temp_dir.display(),
            catalogued = catalog.len(),
            "Transfer coordinator ready"
        );

        Ok(Self {
            config,
            registry: SessionRegistry::new(),
            store,
            catalog: Mutex::new(catalog),
            sessions,
            admission: Mutex::new(()),
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Number of tasks that have not finished.
    pub async fn live_tasks(&self) -> usize {
        self.registry.live_count().await
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    /// Register an upload and allocate its staging file.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for an empty file or a bad name, path or
    /// checksum; [`Error::FileTooLarge`], [`Error::TooManyTransfers`],
    /// [`Error::AlreadyExists`] and [`Error::QuotaExceeded`] for policy
    /// rejections.
    pub async fn init_upload(&self, request: InitUpload) -> Result<UploadTicket> {
        let limits = &self.config.transfer;

        if request.file_size == 0 {
            return Err(Error::InvalidRequest(
                "file_size must be greater than zero".into(),
            ));
        }
        if request.file_size > self.config.storage.max_file_size {
            return Err(Error::FileTooLarge {
                size: request.file_size,
                limit: self.config.storage.max_file_size,
            });
        }

        let file_name = sanitize_file_name(&request.filename)?;
        let dir = match request.path.as_deref() {
            Some(path) => sanitize_relative(path)?,
            None => sanitize_relative(&expand_template(&self.config.storage.path_template))?,
        };
        let dest = self.config.storage.root.join(dir).join(&file_name);
        let checksum = request.checksum.as_deref().map(Checksum::parse).transpose()?;
        let options = request.options.resolve(limits);

        let _admission = self.admission.lock().await;

        let live = self.registry.live_count().await;
        if live >= limits.max_concurrent_transfers {
            return Err(Error::TooManyTransfers(limits.max_concurrent_transfers));
        }

        if !options.overwrite
            && (tokio::fs::try_exists(&dest).await? || self.registry.upload_targets(&dest).await)
        {
            return Err(Error::AlreadyExists(dest.display().to_string()));
        }

        self.check_quota(request.file_size).await?;

        let task_id = uuid::Uuid::new_v4().to_string();
        let chunk_size = negotiate_chunk_size(request.file_size, limits);
        let staging = self.store.allocate(&task_id, request.file_size).await?;

        let task = TransferTask {
            task_id: task_id.clone(),
            direction: Direction::Upload,
            content_type: Some(
                request
                    .content_type
                    .unwrap_or_else(|| guess_content_type(&file_name)),
            ),
            file_name,
            total_size: request.file_size,
            chunk_size,
            checksum,
            options,
            path: dest,
            staging_path: Some(staging),
            file_id: None,
            created_at: Utc::now(),
        };

        let session = Arc::new(TransferSession::new(
            task,
            ReceivedRangeSet::new(),
            limits.speed_window,
        ));
        {
            let mut inner = session.lock().await;
            session.transition(&mut inner, TaskState::Active)?;
            self.persist(&session, &inner).await;
        }
        self.registry.insert(Arc::clone(&session)).await;

        let task = session.task();
        tracing::info!(
            task_id = %task.task_id,
            file = %task.file_name,
            size = task.total_size,
            chunk_size,
            "Upload initialized"
        );

        Ok(UploadTicket {
            transport_endpoint: self.transport_endpoint(Direction::Upload, &task.task_id),
            task_id: task.task_id.clone(),
            chunk_size,
            max_retries: limits.max_retries,
            timeout: limits.timeout.as_secs(),
            threads: task.options.threads(),
            status: TaskState::Active,
            created_at: task.created_at,
        })
    }

    /// Persist one chunk and record its range.
    ///
    /// Re-delivering a covered range succeeds without writing and reports
    /// `duplicate`.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown or finished tasks,
    /// [`Error::TaskPaused`], [`Error::Busy`] past the admission limit,
    /// [`Error::InvalidRange`] and [`Error::ChecksumMismatch`] for bad chunks.
    pub async fn upload_chunk(&self, chunk: ChunkUpload<'_>) -> Result<ChunkAck> {
        let session = self.registry.get_live(chunk.task_id, Direction::Upload).await?;
        let _permit = session.try_admit()?;
        let task = session.task();

        let len = chunk.payload.len() as u64;
        let end = chunk.offset.saturating_add(len);
        if len == 0 || len > task.chunk_size || end > task.total_size {
            return Err(Error::InvalidRange {
                offset: chunk.offset,
                length: len,
                total: task.total_size,
            });
        }

        if let Some(expected) = chunk.checksum {
            Checksum::parse(expected)?.verify(chunk.payload)?;
        }

        {
            let mut inner = session.lock().await;
            session.ensure_accepting(&inner)?;
            TransferSession::touch(&mut inner);
            if inner.ranges.contains(chunk.offset, end) {
                tracing::debug!(
                    task_id = %task.task_id,
                    offset = chunk.offset,
                    len,
                    "Duplicate chunk"
                );
                return Ok(session.ack(&inner, chunk.sequence, len, true));
            }
        }

        let staging = staging_path(task)?;
        self.store
            .write_at(staging, chunk.offset, chunk.payload)
            .await
            .map_err(|e| match e {
                Error::TaskNotFound(_) => Error::TaskNotFound(task.task_id.clone()),
                other => other,
            })?;

        let mut inner = session.lock().await;
        let ack = session.record_range(&mut inner, chunk.offset, len, chunk.sequence)?;

        tracing::debug!(
            task_id = %task.task_id,
            offset = chunk.offset,
            len,
            sequence = chunk.sequence,
            total_received = ack.total_received,
            "Chunk stored"
        );
        Ok(ack)
    }

    /// Verify and publish a fully covered upload.
    ///
    /// Waits for in-flight chunk writes first. An incomplete task stays
    /// active; a whole-file mismatch fails it and discards the staged bytes.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`], [`Error::TaskPaused`], [`Error::Incomplete`],
    /// [`Error::ChecksumMismatch`] or a publication failure.
    pub async fn complete_upload(&self, request: CompleteUpload) -> Result<CompletedUpload> {
        let session = self.registry.get_live(&request.task_id, Direction::Upload).await?;
        session.ensure_accepting(&*session.lock().await)?;

        let _all = session.drain().await?;
        let task = session.task();

        {
            let inner = session.lock().await;
            session.ensure_accepting(&inner)?;
            if !inner.ranges.is_complete(task.total_size) {
                return Err(Error::Incomplete {
                    received: inner.ranges.covered(),
                    total: task.total_size,
                });
            }
        }

        let staging = staging_path(task)?.to_path_buf();
        let supplied = request.checksum.as_deref().map(Checksum::parse).transpose()?;
        let expected = supplied.clone().or_else(|| task.checksum.clone());
        let verify = task.options.verify() || supplied.is_some();

        let digest = match (&expected, verify) {
            (Some(expected), true) => {
                let actual = self.digest_staged(&session, &staging, expected.algorithm()).await?;
                if let Err(e) = expected.ensure_matches(&actual) {
                    tracing::warn!(task_id = %task.task_id, error = %e, "Upload failed verification");
                    self.fail_upload(&session, e.to_string()).await;
                    return Err(e);
                }
                actual
            }
            (Some(expected), false) => expected.clone(),
            (None, _) => {
                self.digest_staged(&session, &staging, ChecksumAlgorithm::default())
                    .await?
            }
        };

        // Held until the task is Completed so cancel cannot interleave with publishing.
        let mut inner = session.lock().await;
        session.ensure_accepting(&inner)?;

        if let Err(e) = self
            .store
            .publish(&staging, &task.path, task.options.overwrite)
            .await
        {
            drop(inner);
            self.fail_upload(&session, e.to_string()).await;
            return Err(e);
        }

        let info = FileInfo {
            file_id: None,
            file_name: task.file_name.clone(),
            file_path: self.relative_to_root(&task.path),
            file_size: task.total_size,
            content_type: task.content_type.clone(),
            checksum: Some(digest),
            metadata: request.metadata,
            created_at: Utc::now(),
        };
        let file_info = match self.catalog.lock().await.insert(info.clone()) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, error = %e, "Failed to catalog upload");
                info
            }
        };

        session.transition(&mut inner, TaskState::Completed)?;
        let stats = TransferStats {
            duration_ms: u64::try_from(inner.tracker.elapsed().as_millis()).unwrap_or(u64::MAX),
            average_speed: inner.tracker.average_speed(),
            peak_speed: inner.tracker.peak_speed(),
            total_bytes: task.total_size,
        };
        drop(inner);
        self.forget(&task.task_id).await;

        tracing::info!(
            task_id = %task.task_id,
            path = %task.path.display(),
            duration_ms = stats.duration_ms,
            "Upload completed"
        );

        Ok(CompletedUpload {
            task_id: task.task_id.clone(),
            status: TaskState::Completed,
            file_info,
            transfer_stats: stats,
            completed_at: Utc::now(),
        })
    }

    /// Cancel an upload and discard its staged bytes.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown or already cancelled tasks.
    pub async fn cancel_upload(&self, task_id: &str) -> Result<()> {
        self.cancel(task_id, Direction::Upload).await
    }

    /// Cancel a download.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown or already cancelled tasks.
    pub async fn cancel_download(&self, task_id: &str) -> Result<()> {
        self.cancel(task_id, Direction::Download).await
    }

    async fn cancel(&self, task_id: &str, direction: Direction) -> Result<()> {
        let session = self.registry.get(task_id).await?;
        if session.direction() != direction {
            return Err(Error::TaskNotFound(task_id.to_string()));
        }

        {
            let mut inner = session.lock().await;
            if inner.state.is_terminal() {
                return Ok(());
            }
            session.transition(&mut inner, TaskState::Cancelled)?;
        }

        self.registry.remove(task_id).await;
        if let Some(staging) = &session.task().staging_path {
            self.store.release(staging).await;
        }
        self.forget(task_id).await;

        tracing::info!(task_id, %direction, "Task cancelled");
        Ok(())
    }

    async fn digest_staged(
        &self,
        session: &TransferSession,
        staging: &Path,
        algorithm: ChecksumAlgorithm,
    ) -> Result<Checksum> {
        match self.store.digest(staging, algorithm).await {
            Ok(digest) => Ok(digest),
            Err(_) if session.state().await.is_terminal() => {
                Err(Error::TaskNotFound(session.id().to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn fail_upload(&self, session: &TransferSession, reason: String) {
        {
            let mut inner = session.lock().await;
            inner.failure = Some(reason);
            if session.transition(&mut inner, TaskState::Failed).is_err() {
                return;
            }
        }
        if let Some(staging) = &session.task().staging_path {
            self.store.release(staging).await;
        }
        self.forget(session.id()).await;
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// Register a download of a catalogued or stored file.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] without a file reference or with resume
    /// disabled, [`Error::FileNotFound`] for a missing source,
    /// [`Error::InvalidRange`] for an offset past the end and
    /// [`Error::TooManyTransfers`].
    pub async fn request_download(&self, request: DownloadRequest) -> Result<DownloadTicket> {
        let limits = &self.config.transfer;
        let (source, catalogued) = self.resolve_source(&request).await?;

        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|_| Error::FileNotFound(source.display().to_string()))?;
        if !meta.is_file() {
            return Err(Error::FileNotFound(source.display().to_string()));
        }
        let size = meta.len();

        let options = request.options.resolve(limits);
        let offset = if options.resume {
            if !limits.resume_support {
                return Err(Error::InvalidRequest("resume is disabled on this server".into()));
            }
            request.offset.unwrap_or(0)
        } else {
            0
        };
        if offset > size {
            return Err(Error::InvalidRange {
                offset,
                length: 0,
                total: size,
            });
        }

        let _admission = self.admission.lock().await;
        if self.registry.live_count().await >= limits.max_concurrent_transfers {
            return Err(Error::TooManyTransfers(limits.max_concurrent_transfers));
        }

        let digest = checksum::digest_file(&source, ChecksumAlgorithm::default()).await?;
        let file_info = match catalogued {
            Some(mut info) => {
                info.file_size = size;
                info.checksum = Some(digest.clone());
                info
            }
            None => {
                let file_name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                FileInfo {
                    file_id: None,
                    content_type: Some(guess_content_type(&file_name)),
                    file_name,
                    file_path: self.relative_to_root(&source),
                    file_size: size,
                    checksum: Some(digest.clone()),
                    metadata: std::collections::HashMap::new(),
                    created_at: Utc::now(),
                }
            }
        };

        let mut ranges = ReceivedRangeSet::new();
        ranges.insert(0, offset);

        let chunk_size = negotiate_chunk_size(size, limits);
        let task = TransferTask {
            task_id: uuid::Uuid::new_v4().to_string(),
            direction: Direction::Download,
            file_name: file_info.file_name.clone(),
            total_size: size,
            chunk_size,
            checksum: Some(digest),
            options,
            content_type: file_info.content_type.clone(),
            path: source,
            staging_path: None,
            file_id: file_info.file_id.clone(),
            created_at: Utc::now(),
        };

        let session = Arc::new(TransferSession::new(task, ranges, limits.speed_window));
        {
            let mut inner = session.lock().await;
            session.transition(&mut inner, TaskState::Active)?;
        }
        self.registry.insert(Arc::clone(&session)).await;

        let task = session.task();
        tracing::info!(
            task_id = %task.task_id,
            path = %task.path.display(),
            size,
            offset,
            "Download requested"
        );

        Ok(DownloadTicket {
            transport_endpoint: self.transport_endpoint(Direction::Download, &task.task_id),
            task_id: task.task_id.clone(),
            file_info,
            chunk_size,
            timeout: limits.download_timeout.as_secs(),
            offset,
            local_path: request.local_path,
            status: TaskState::Active,
            created_at: task.created_at,
        })
    }

    async fn resolve_source(&self, request: &DownloadRequest) -> Result<(PathBuf, Option<FileInfo>)> {
        let root = &self.config.storage.root;

        if let Some(file_id) = &request.file_id {
            let info = self
                .catalog
                .lock()
                .await
                .get(file_id)
                .cloned()
                .ok_or_else(|| Error::FileNotFound(file_id.clone()))?;
            let path = root.join(sanitize_relative(&info.file_path)?);
            return Ok((path, Some(info)));
        }

        if let Some(file_path) = &request.file_path {
            let relative = sanitize_relative(file_path)?;
            if relative.as_os_str().is_empty() {
                return Err(Error::InvalidRequest("file_path is empty".into()));
            }
            let path = root.join(relative);
            let info = self
                .catalog
                .lock()
                .await
                .find_by_path(&self.relative_to_root(&path))
                .cloned();
            return Ok((path, info));
        }

        Err(Error::InvalidRequest(
            "either file_id or file_path is required".into(),
        ))
    }

    /// Read one bounded range of a download and record it as delivered.
    ///
    /// `length` is capped at `max_chunk_size` and at the end of the file.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`], [`Error::TaskPaused`], [`Error::Busy`] or
    /// [`Error::InvalidRange`] for an offset at or past the end.
    pub async fn read_download(&self, task_id: &str, offset: u64, length: u64) -> Result<DownloadChunk> {
        let session = self.registry.get_live(task_id, Direction::Download).await?;
        let _permit = session.try_admit()?;
        let task = session.task();

        if length == 0 || offset >= task.total_size {
            return Err(Error::InvalidRange {
                offset,
                length,
                total: task.total_size,
            });
        }
        let len = length
            .min(self.config.transfer.max_chunk_size)
            .min(task.total_size - offset);

        session.ensure_accepting(&*session.lock().await)?;

        let data = self
            .store
            .read_range(&task.path, offset, len)
            .await
            .map_err(|e| match e {
                Error::TaskNotFound(_) => Error::FileNotFound(task.path.display().to_string()),
                other => other,
            })?;
        let checksum = Checksum::sha256(&data);

        record_delivery(&session, offset, len).await?;

        Ok(DownloadChunk {
            offset,
            data,
            checksum,
        })
    }

    /// Open a cursor streaming a download from `offset` to the end.
    ///
    /// The cursor holds one admission permit for as long as it lives.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`], [`Error::TaskPaused`], [`Error::Busy`],
    /// [`Error::InvalidRange`] or [`Error::FileNotFound`].
    pub async fn open_download(&self, task_id: &str, offset: u64) -> Result<DownloadCursor> {
        let session = self.registry.get_live(task_id, Direction::Download).await?;
        let permit = session.try_admit()?;
        let task = session.task();

        if offset > task.total_size {
            return Err(Error::InvalidRange {
                offset,
                length: 0,
                total: task.total_size,
            });
        }
        session.ensure_accepting(&*session.lock().await)?;

        let mut file = tokio::fs::File::open(&task.path)
            .await
            .map_err(|_| Error::FileNotFound(task.path.display().to_string()))?;
        file.seek(SeekFrom::Start(offset)).await?;

        let chunk_size = usize::try_from(task.chunk_size).unwrap_or(crate::IO_BUFFER_SIZE);
        let end = task.total_size;

        Ok(DownloadCursor {
            session,
            file,
            position: offset,
            end,
            chunk_size,
            _permit: permit,
        })
    }

    // ========================================================================
    // Task control and queries
    // ========================================================================

    /// Pause a live task.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] or [`Error::InvalidRequest`] if it is not active.
    pub async fn pause(&self, task_id: &str) -> Result<ProgressSnapshot> {
        self.set_paused(task_id, TaskState::Paused).await
    }

    /// Resume a paused task.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] or [`Error::InvalidRequest`] if it is not paused.
    pub async fn resume(&self, task_id: &str) -> Result<ProgressSnapshot> {
        self.set_paused(task_id, TaskState::Active).await
    }

    async fn set_paused(&self, task_id: &str, next: TaskState) -> Result<ProgressSnapshot> {
        let session = self.registry.get(task_id).await?;
        let mut inner = session.lock().await;
        session.transition(&mut inner, next)?;
        self.persist(&session, &inner).await;

        tracing::info!(task_id, state = %next, "Task state changed");
        Ok(session.snapshot_of(&inner))
    }

    /// Current progress of a task, live or recently finished.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown, cancelled or evicted tasks.
    pub async fn progress(&self, task_id: &str) -> Result<ProgressSnapshot> {
        Ok(self.registry.get(task_id).await?.snapshot().await)
    }

    /// Progress of several tasks; unknown ids are left out.
    pub async fn batch_status(&self, task_ids: &[String]) -> Vec<ProgressSnapshot> {
        let mut snapshots = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            if let Ok(session) = self.registry.get(id).await {
                snapshots.push(session.snapshot().await);
            }
        }
        snapshots
    }

    /// Covered and missing intervals of a task.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`].
    pub async fn ranges(&self, task_id: &str) -> Result<RangeReport> {
        let session = self.registry.get(task_id).await?;
        let task = session.task();
        let inner = session.lock().await;

        Ok(RangeReport {
            task_id: task.task_id.clone(),
            state: inner.state,
            total: task.total_size,
            chunk_size: task.chunk_size,
            received: inner.ranges.iter().map(|r| (r.start, r.end)).collect(),
            missing: inner
                .ranges
                .missing(task.total_size)
                .into_iter()
                .map(|r| (r.start, r.end))
                .collect(),
        })
    }

    /// Subscribe to progress updates of a task.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`].
    pub async fn subscribe(&self, task_id: &str) -> Result<watch::Receiver<ProgressSnapshot>> {
        Ok(self.registry.get(task_id).await?.subscribe())
    }

    /// Catalog entry of a published file.
    ///
    /// # Errors
    ///
    /// [`Error::FileNotFound`].
    pub async fn file_info(&self, file_id: &str) -> Result<FileInfo> {
        self.catalog
            .lock()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))
    }

    // ========================================================================
    // Inventory
    // ========================================================================

    /// Registered tasks matching `query`, newest first.
    ///
    /// Finished tasks stay listed until history retention evicts them.
    pub async fn list_transfers(&self, query: &TransferQuery) -> TransferList {
        let mut tasks = Vec::new();
        for session in self.registry.all().await {
            if query.direction.is_some_and(|d| d != session.direction()) {
                continue;
            }
            let detail = self.detail_of(&session).await;
            if query.status.is_some_and(|s| s != detail.progress.state) {
                continue;
            }
            tasks.push(detail);
        }
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.progress.task_id.cmp(&b.progress.task_id))
        });

        let total = tasks.len();
        let tasks = tasks
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        TransferList { tasks, total }
    }

    /// Description and progress of one task.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown, cancelled, expired or evicted tasks.
    pub async fn transfer_detail(&self, task_id: &str) -> Result<TransferDetail> {
        let session = self.registry.get(task_id).await?;
        Ok(self.detail_of(&session).await)
    }

    async fn detail_of(&self, session: &TransferSession) -> TransferDetail {
        let task = session.task();
        let inner = session.lock().await;
        TransferDetail {
            progress: session.snapshot_of(&inner),
            file_name: task.file_name.clone(),
            file_path: self.relative_to_root(&task.path),
            file_id: task.file_id.clone(),
            chunk_size: task.chunk_size,
            checksum: task.checksum.clone(),
            options: task.options.clone(),
            content_type: task.content_type.clone(),
            error: inner.failure.clone(),
            created_at: task.created_at,
        }
    }

    /// Catalogued files under `query.path`, newest first.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if the path leaves the storage root.
    pub async fn list_files(&self, query: &FileQuery) -> Result<FileList> {
        let prefix = match query.path.as_deref() {
            Some(path) => {
                let dir = self.config.storage.root.join(sanitize_relative(path)?);
                self.relative_to_root(&dir)
            }
            None => String::new(),
        };

        let catalog = self.catalog.lock().await;
        let matching: Vec<&FileInfo> = catalog
            .list()
            .into_iter()
            .filter(|info| is_under(&info.file_path, &prefix))
            .collect();

        let total = matching.len();
        let files = matching
            .into_iter()
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(FileList { files, total })
    }

    /// Remove a published file from the storage root and the catalog.
    ///
    /// # Errors
    ///
    /// [`Error::FileNotFound`] for unknown ids; [`Error::InvalidRequest`]
    /// while a live task reads or writes the file.
    pub async fn delete_file(&self, file_id: &str) -> Result<FileInfo> {
        let info = self.file_info(file_id).await?;
        let path = self.config.storage.root.join(sanitize_relative(&info.file_path)?);

        // The catalog stays unlocked across the scan: completion locks a
        // session before the catalog.
        if let Some(task_id) = self.registry.live_on(&path).await {
            return Err(Error::InvalidRequest(format!(
                "file {file_id} is in use by task {task_id}"
            )));
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Catalogued file was already gone");
            }
            Err(e) => return Err(e.into()),
        }
        self.catalog.lock().await.remove(file_id)?;

        tracing::info!(file_id, path = %path.display(), "Deleted file");
        Ok(info)
    }

    /// Storage quota and its current use.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be scanned.
    pub async fn quota(&self) -> Result<QuotaInfo> {
        let total = self.config.storage.quota;
        let used = self.used_bytes().await?;
        let reserved = self.registry.reserved_bytes().await;
        let available = total.saturating_sub(used).saturating_sub(reserved);
        let usage_percentage = if total == 0 {
            100.0
        } else {
            used.saturating_add(reserved) as f64 / total as f64 * 100.0
        };

        Ok(QuotaInfo {
            total,
            used,
            reserved,
            available,
            usage_percentage,
            formatted: QuotaFormatted {
                total: format_bytes(total),
                used: format_bytes(used),
                available: format_bytes(available),
            },
        })
    }

    /// Limits clients negotiate against.
    #[must_use]
    pub fn limits(&self) -> ServerLimits {
        let storage = &self.config.storage;
        let transfer = &self.config.transfer;
        ServerLimits {
            upload: UploadLimits {
                max_file_size: storage.max_file_size,
                max_concurrent_transfers: transfer.max_concurrent_transfers,
                chunk_size: transfer.chunk_size,
                min_chunk_size: transfer.min_chunk_size,
                max_chunk_size: transfer.max_chunk_size,
                checksum_required: transfer.verify_checksum,
            },
            download: DownloadLimits {
                chunk_size: transfer.chunk_size,
                max_chunk_size: transfer.max_chunk_size,
                resume_support: transfer.resume_support,
                threads: transfer.threads,
                max_threads: transfer.max_threads,
            },
            storage: StorageLimits {
                quota: storage.quota,
                retention_days: storage.retention_days,
            },
        }
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// Expire idle tasks, evict old history, refresh session records and
    /// apply file retention.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for session in self.registry.expire_idle(self.config.session.ttl).await {
            if let Some(staging) = &session.task().staging_path {
                self.store.release(staging).await;
            }
            self.forget(session.id()).await;
            report.expired += 1;
        }

        report.evicted = self
            .registry
            .evict_finished(self.config.session.history_retention)
            .await;

        report.persisted = self.persist_all().await;
        report.pruned = self.prune_catalog().await;

        if report != SweepReport::default() {
            tracing::debug!(?report, "Sweep finished");
        }
        report
    }

    /// Run [`TransferCoordinator::sweep`] every `sweep_interval` until `token`
    /// is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let period = coordinator.config.session.sweep_interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        coordinator.sweep().await;
                    }
                }
            }
            tracing::debug!("Sweeper stopped");
        })
    }

    /// Re-register persisted uploads whose staging file survived.
    ///
    /// # Errors
    ///
    /// Returns an error if the session directory cannot be read.
    pub async fn restore(&self) -> Result<usize> {
        let Some(sessions) = &self.sessions else {
            return Ok(0);
        };

        let mut restored = 0;
        for record in sessions.list().await? {
            let task_id = record.task.task_id.clone();
            let usable = record.task.direction == Direction::Upload
                && !record.state.is_terminal()
                && match &record.task.staging_path {
                    Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
                    None => false,
                };

            if !usable || self.registry.get(&task_id).await.is_ok() {
                if !usable {
                    tracing::debug!(task_id = %task_id, "Discarding stale session record");
                    if let Err(e) = sessions.delete(&task_id).await {
                        tracing::warn!(task_id = %task_id, error = %e, "Failed to delete session record");
                    }
                }
                continue;
            }

            let session = Arc::new(TransferSession::new(
                record.task,
                record.ranges,
                self.config.transfer.speed_window,
            ));
            {
                let mut inner = session.lock().await;
                inner.last_sequence = record.last_sequence;
                session.transition(&mut inner, TaskState::Active)?;
                if record.state == TaskState::Paused {
                    session.transition(&mut inner, TaskState::Paused)?;
                }
            }
            self.registry.insert(session).await;
            restored += 1;
        }

        if restored > 0 {
            tracing::info!(count = restored, "Restored upload sessions");
        }
        Ok(restored)
    }

    /// Save a record of every live upload. Returns how many were written.
    pub async fn persist_all(&self) -> usize {
        if self.sessions.is_none() {
            return 0;
        }

        let mut written = 0;
        for session in self.registry.live().await {
            let inner = session.lock().await;
            if self.persist(&session, &inner).await {
                written += 1;
            }
        }
        written
    }

    async fn persist(&self, session: &TransferSession, inner: &SessionInner) -> bool {
        let Some(sessions) = &self.sessions else {
            return false;
        };
        if session.direction() != Direction::Upload || inner.state.is_terminal() {
            return false;
        }

        match sessions
            .save(&SessionRecord::capture(session.task(), inner))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(task_id = %session.id(), error = %e, "Failed to persist session");
                false
            }
        }
    }

    async fn forget(&self, task_id: &str) {
        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.delete(task_id).await {
                tracing::warn!(task_id, error = %e, "Failed to delete session record");
            }
        }
    }

    async fn prune_catalog(&self) -> usize {
        let days = self.config.storage.retention_days;
        if days == 0 {
            return 0;
        }

        let drained = match self
            .catalog
            .lock()
            .await
            .drain_older_than(chrono::Duration::days(i64::from(days)))
        {
            Ok(drained) => drained,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to prune catalog");
                return 0;
            }
        };

        for info in &drained {
            let Ok(relative) = sanitize_relative(&info.file_path) else {
                continue;
            };
            let path = self.config.storage.root.join(relative);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::info!(path = %path.display(), "Removed expired file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove expired file"
                ),
            }
        }
        drained.len()
    }

    /// Bytes of every file under the storage root.
    async fn used_bytes(&self) -> Result<u64> {
        let root = self.config.storage.root.clone();
        tokio::task::spawn_blocking(move || {
            walkdir::WalkDir::new(root)
                .into_iter()
                .filter_map(std::result::Result::ok)
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| entry.metadata().ok())
                .map(|meta| meta.len())
                .sum::<u64>()
        })
        .await
        .map_err(|e| Error::Internal(format!("quota scan failed: {e}")))
    }

    async fn check_quota(&self, incoming: u64) -> Result<()> {
        let used = self.used_bytes().await?;
        let reserved = self.registry.reserved_bytes().await;
        let available = self
            .config
            .storage
            .quota
            .saturating_sub(used)
            .saturating_sub(reserved);

        if incoming > available {
            return Err(Error::QuotaExceeded {
                needed: incoming,
                available,
            });
        }
        Ok(())
    }

    fn transport_endpoint(&self, direction: Direction, task_id: &str) -> String {
        format!(
            "{}/{direction}/{task_id}",
            self.config.server.transport_url.trim_end_matches('/')
        )
    }

    fn relative_to_root(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.config.storage.root).unwrap_or(path);
        relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Sequential reader over the remainder of a download.
///
/// Every chunk handed out is recorded against the task; the last one
/// completes it.
#[derive(Debug)]
pub struct DownloadCursor {
    session: Arc<TransferSession>,
    file: tokio::fs::File,
    position: u64,
    end: u64,
    chunk_size: usize,
    _permit: OwnedSemaphorePermit,
}

impl DownloadCursor {
    /// The task being delivered.
    #[must_use]
    pub fn task(&self) -> &TransferTask {
        self.session.task()
    }

    /// Offset of the next byte.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left to deliver.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.end - self.position
    }

    /// Read the next chunk, or `None` at the end.
    ///
    /// # Errors
    ///
    /// Fails once the task is cancelled, paused or expired, or on I/O errors.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.position >= self.end {
            // Covers empty files and fully resumed downloads.
            settle(&self.session).await;
            return Ok(None);
        }

        self.session.ensure_accepting(&*self.session.lock().await)?;

        let len = (self.end - self.position).min(self.chunk_size as u64);
        let mut buffer = vec![0u8; len as usize];
        self.file.read_exact(&mut buffer).await?;

        record_delivery(&self.session, self.position, len).await?;
        self.position += len;
        Ok(Some(buffer))
    }
}

async fn record_delivery(session: &TransferSession, offset: u64, len: u64) -> Result<()> {
    let task = session.task();
    let mut inner = session.lock().await;
    let sequence = offset / task.chunk_size.max(1);
    session.record_range(&mut inner, offset, len, sequence)?;
    complete_if_covered(session, &mut inner);
    Ok(())
}

async fn settle(session: &TransferSession) {
    let mut inner = session.lock().await;
    complete_if_covered(session, &mut inner);
}

fn complete_if_covered(session: &TransferSession, inner: &mut SessionInner) {
    let task = session.task();
    if inner.state == TaskState::Active
        && inner.ranges.is_complete(task.total_size)
        && session.transition(inner, TaskState::Completed).is_ok()
    {
        tracing::info!(task_id = %task.task_id, "Download completed");
    }
}

fn staging_path(task: &TransferTask) -> Result<&Path> {
    task.staging_path
        .as_deref()
        .ok_or_else(|| Error::Internal(format!("upload {} has no staging file", task.task_id)))
}

fn guess_content_type(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn expand_template(template: &str) -> String {
    template.replace("{date}", &Utc::now().format("%Y-%m-%d").to_string())
}

/// Validate a bare file name.
fn sanitize_file_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control)
    {
        return Err(Error::InvalidRequest(format!("invalid file name: {name:?}")));
    }
    Ok(name.to_string())
}

/// Whether the `/`-separated `path` lies in directory `dir` ("" is the root).
fn is_under(path: &str, dir: &str) -> bool {
    dir.is_empty()
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Turn a `/`-separated relative path into a `PathBuf` without parent components.
fn sanitize_relative(path: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                return Err(Error::InvalidRequest(format!(
                    "path may not leave the storage root: {path}"
                )))
            }
            part if part.contains('\0') || part.contains(':') => {
                return Err(Error::InvalidRequest(format!("invalid path: {path}")))
            }
            part => out.push(part),
        }
    }
    Ok(out)
}
