//! HTTP client for the transfer API.
//!
//! Every call takes explicit [`Credentials`]; the client itself holds no
//! per-user state and can be shared freely.
//!
//! Besides one method per endpoint, the client drives whole transfers:
//!
//! - [`TransferClient::upload_file`] digests the file, opens a task and sends
//!   chunks concurrently, retrying recoverable failures
//! - [`TransferClient::resume_upload`] asks for the missing ranges of an
//!   interrupted upload and sends only those
//! - [`TransferClient::download_file`] fetches verified ranges into a staging
//!   file, checks the whole-file digest and moves it into place; ranges
//!   journalled by an earlier attempt are not fetched again
//! - [`TransferClient::watch`] follows the progress event stream

use std::collections::VecDeque;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::catalog::FileInfo;
use crate::checksum::{self, Checksum, ChecksumAlgorithm};
use crate::error::{Error, Result};
use crate::events::{EventStreamDecoder, SseEvent};
use crate::retry::RetryPolicy;
use crate::store::ChunkStore;
use crate::transfer::{
    BatchStatusRequest, BatchStatusResponse, ChunkAck, CompleteUpload, CompletedUpload,
    DownloadChunk, DownloadRequest, DownloadTicket, FileList, FileQuery, HealthResponse,
    InitUpload, ProgressSnapshot, QuotaInfo, RangeReport, ReceivedRangeSet, ServerLimits,
    TaskState, TransferDetail, TransferList, TransferOptions, TransferQuery, UploadTicket,
};
use crate::{CHUNK_CHECKSUM_HEADER, RANGE_OFFSET_HEADER};

/// Default server address.
pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

/// Credentials attached to a request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    token: Option<String>,
}

impl Credentials {
    /// No authentication.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Bearer token authentication.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// The bearer token, if any.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. `http://127.0.0.1:8080`
    pub server: String,
    /// Timeout of a single request, streams excluded
    pub request_timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Retry policy for recoverable chunk failures
    pub retry: RetryPolicy,
    /// Concurrent chunk requests; `None` uses the value the server advertises
    pub threads: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            request_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default().with_jitter(),
            threads: None,
        }
    }
}

impl ClientConfig {
    /// Settings for `server` with defaults otherwise.
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }
}

/// Options of [`TransferClient::upload_file`].
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Name on the server; defaults to the local file name
    pub file_name: Option<String>,
    /// Directory under the server's storage root
    pub remote_dir: Option<String>,
    /// Task options sent on init
    pub transfer: TransferOptions,
    /// Metadata stored with the published file
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
}

/// Result of [`TransferClient::download_file`].
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Task identifier
    pub task_id: String,
    /// Where the file was written
    pub path: PathBuf,
    /// File size
    pub size: u64,
    /// Bytes already present before this run
    pub resumed_from: u64,
    /// Verified digest
    pub checksum: Option<Checksum>,
}

/// Verified coverage of a download staging file, kept beside it as
/// `<staging>.json`.
///
/// The staging file is sized to the whole download up front, so its length
/// says nothing about which bytes arrived. Only ranges recorded here are
/// trusted when a download resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJournal {
    /// Size of the source file
    pub file_size: u64,
    /// Whole-file digest of the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    /// Ranges written to the staging file
    pub ranges: ReceivedRangeSet,
    /// Time of the last change
    pub updated_at: DateTime<Utc>,
}

impl DownloadJournal {
    /// Empty journal for a download of `info`.
    #[must_use]
    pub fn new(info: &FileInfo) -> Self {
        Self {
            file_size: info.file_size,
            checksum: info.checksum.clone(),
            ranges: ReceivedRangeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Journal path of the staging file `staged`.
    #[must_use]
    pub fn path_for(staged: &Path) -> PathBuf {
        let mut path = staged.as_os_str().to_owned();
        path.push(".json");
        PathBuf::from(path)
    }

    /// Whether the journal was written for the file `info` describes.
    #[must_use]
    pub fn describes(&self, info: &FileInfo) -> bool {
        self.file_size == info.file_size
            && match (&self.checksum, &info.checksum) {
                (Some(ours), Some(theirs)) => ours == theirs,
                _ => true,
            }
    }

    /// Keep only the contiguous prefix, the part a resumed task can skip.
    #[must_use]
    pub fn into_prefix(mut self) -> Self {
        let prefix = self.ranges.contiguous_prefix();
        self.ranges = ReceivedRangeSet::new();
        self.ranges.insert(0, prefix);
        self
    }

    fn record(&mut self, range: &Range<u64>) {
        self.ranges.insert(range.start, range.end);
        self.updated_at = Utc::now();
    }

    /// Read a journal. A missing or unreadable one yields `None`.
    pub async fn load(path: &Path) -> Option<Self> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read download journal");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(journal) => Some(journal),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable download journal");
                None
            }
        }
    }

    /// Write the journal, replacing the previous one atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        let temp_path = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn discard(path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove download journal");
            }
        }
    }
}

/// An event from [`TransferClient::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// `progress`, `complete` or `error`
    pub kind: String,
    /// Progress at the time of the event
    pub snapshot: ProgressSnapshot,
    /// Reason of an `error` event
    pub message: Option<String>,
}

#[derive(Deserialize)]
struct EventPayload {
    #[serde(flatten)]
    snapshot: ProgressSnapshot,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Client of the transfer API.
#[derive(Debug, Clone)]
pub struct TransferClient {
    http: reqwest::Client,
    base_url: String,
    config: ClientConfig,
}

impl TransferClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(format!("qflow/{}", crate::VERSION))
            .build()
            .map_err(transport)?;
        let base_url = format!(
            "{}{}",
            config.server.trim_end_matches('/'),
            crate::API_PREFIX
        );

        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    /// Client settings.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn request(&self, credentials: &Credentials, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let builder = self.http.request(method, url);
        match credentials.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn call<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(transport)?;
        let response = check(response).await?;
        response.json().await.map_err(transport)
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    /// `GET health`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable.
    pub async fn health(&self, credentials: &Credentials) -> Result<HealthResponse> {
        self.call(self.request(credentials, Method::GET, "/health"))
            .await
    }

    /// `POST upload/init`.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection, e.g. [`Error::AlreadyExists`].
    pub async fn init_upload(
        &self,
        credentials: &Credentials,
        request: &InitUpload,
    ) -> Result<UploadTicket> {
        self.call(
            self.request(credentials, Method::POST, "/upload/init")
                .json(request),
        )
        .await
    }

    /// `POST upload/chunk`.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection, e.g. [`Error::ChecksumMismatch`].
    pub async fn upload_chunk(
        &self,
        credentials: &Credentials,
        task_id: &str,
        offset: u64,
        sequence: u64,
        data: Vec<u8>,
        checksum: Option<&Checksum>,
    ) -> Result<ChunkAck> {
        let mut builder = self
            .request(credentials, Method::POST, "/upload/chunk")
            .query(&[
                ("task_id", task_id.to_string()),
                ("offset", offset.to_string()),
                ("sequence", sequence.to_string()),
            ])
            .body(data);
        if let Some(checksum) = checksum {
            builder = builder.header(CHUNK_CHECKSUM_HEADER, checksum.to_string());
        }
        self.call(builder).await
    }

    /// `POST upload/complete`.
    ///
    /// # Errors
    ///
    /// [`Error::Incomplete`] while ranges are missing, or the server's
    /// verification failure.
    pub async fn complete_upload(
        &self,
        credentials: &Credentials,
        request: &CompleteUpload,
    ) -> Result<CompletedUpload> {
        self.call(
            self.request(credentials, Method::POST, "/upload/complete")
                .json(request),
        )
        .await
    }

    /// `DELETE upload/{task_id}`.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown tasks.
    pub async fn cancel_upload(&self, credentials: &Credentials, task_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(self.request(credentials, Method::DELETE, &format!("/upload/{task_id}")))
            .await?;
        Ok(())
    }

    /// `POST download/request`.
    ///
    /// # Errors
    ///
    /// [`Error::FileNotFound`] when the source does not exist.
    pub async fn request_download(
        &self,
        credentials: &Credentials,
        request: &DownloadRequest,
    ) -> Result<DownloadTicket> {
        self.call(
            self.request(credentials, Method::POST, "/download/request")
                .json(request),
        )
        .await
    }

    /// `GET download/{task_id}?offset&length`, verified against its digest.
    ///
    /// # Errors
    ///
    /// [`Error::ChecksumMismatch`] when the bytes do not match the digest the
    /// server sent with them.
    pub async fn fetch_range(
        &self,
        credentials: &Credentials,
        task_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<DownloadChunk> {
        let response = self
            .request(credentials, Method::GET, &format!("/download/{task_id}"))
            .query(&[("offset", offset), ("length", length)])
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(transport)?;
        let response = check(response).await?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let checksum = header(CHUNK_CHECKSUM_HEADER)
            .ok_or_else(|| Error::InvalidRequest("range response without checksum".into()))
            .and_then(|v| Checksum::parse(&v))?;
        let range_offset = header(RANGE_OFFSET_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(offset);

        let data = response.bytes().await.map_err(transport)?.to_vec();
        checksum.verify(&data)?;

        Ok(DownloadChunk {
            offset: range_offset,
            data,
            checksum,
        })
    }

    /// `DELETE download/{task_id}`.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown tasks.
    pub async fn cancel_download(&self, credentials: &Credentials, task_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(self.request(credentials, Method::DELETE, &format!("/download/{task_id}")))
            .await?;
        Ok(())
    }

    /// `GET transfer/{task_id}/progress`.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown tasks.
    pub async fn progress(
        &self,
        credentials: &Credentials,
        task_id: &str,
    ) -> Result<ProgressSnapshot> {
        self.call(self.request(
            credentials,
            Method::GET,
            &format!("/transfer/{task_id}/progress"),
        ))
        .await
    }

    /// `POST transfer/batch-status`. Unknown ids are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn batch_status(
        &self,
        credentials: &Credentials,
        task_ids: &[String],
    ) -> Result<Vec<ProgressSnapshot>> {
        let body = BatchStatusRequest {
            task_ids: task_ids.to_vec(),
        };
        let response: BatchStatusResponse = self
            .call(
                self.request(credentials, Method::POST, "/transfer/batch-status")
                    .json(&body),
            )
            .await?;
        Ok(response.tasks)
    }

    /// `GET transfer/{task_id}/ranges`.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown tasks.
    pub async fn ranges(&self, credentials: &Credentials, task_id: &str) -> Result<RangeReport> {
        self.call(self.request(
            credentials,
            Method::GET,
            &format!("/transfer/{task_id}/ranges"),
        ))
        .await
    }

    /// `POST transfer/{task_id}/pause`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] when the task cannot be paused.
    pub async fn pause(&self, credentials: &Credentials, task_id: &str) -> Result<ProgressSnapshot> {
        self.call(self.request(
            credentials,
            Method::POST,
            &format!("/transfer/{task_id}/pause"),
        ))
        .await
    }

    /// `POST transfer/{task_id}/resume`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] when the task is not paused.
    pub async fn resume(
        &self,
        credentials: &Credentials,
        task_id: &str,
    ) -> Result<ProgressSnapshot> {
        self.call(self.request(
            credentials,
            Method::POST,
            &format!("/transfer/{task_id}/resume"),
        ))
        .await
    }

    /// `GET files/{file_id}`.
    ///
    /// # Errors
    ///
    /// [`Error::FileNotFound`] for unknown ids.
    pub async fn file_info(&self, credentials: &Credentials, file_id: &str) -> Result<FileInfo> {
        self.call(self.request(credentials, Method::GET, &format!("/files/{file_id}")))
            .await
    }

    /// `GET transfers`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable.
    pub async fn list_transfers(
        &self,
        credentials: &Credentials,
        query: &TransferQuery,
    ) -> Result<TransferList> {
        self.call(self.request(credentials, Method::GET, "/transfers").query(query))
            .await
    }

    /// `GET transfer/{task_id}`.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown tasks.
    pub async fn transfer_detail(
        &self,
        credentials: &Credentials,
        task_id: &str,
    ) -> Result<TransferDetail> {
        self.call(self.request(credentials, Method::GET, &format!("/transfer/{task_id}")))
            .await
    }

    /// `GET list`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for a path outside the storage root.
    pub async fn list_files(&self, credentials: &Credentials, query: &FileQuery) -> Result<FileList> {
        self.call(self.request(credentials, Method::GET, "/list").query(query))
            .await
    }

    /// `DELETE {file_id}`. Returns the removed entry.
    ///
    /// # Errors
    ///
    /// [`Error::FileNotFound`] for unknown ids; [`Error::InvalidRequest`]
    /// while a transfer uses the file.
    pub async fn delete_file(&self, credentials: &Credentials, file_id: &str) -> Result<FileInfo> {
        self.call(self.request(credentials, Method::DELETE, &format!("/{file_id}")))
            .await
    }

    /// `GET quota`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable.
    pub async fn quota(&self, credentials: &Credentials) -> Result<QuotaInfo> {
        self.call(self.request(credentials, Method::GET, "/quota"))
            .await
    }

    /// `GET config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable.
    pub async fn limits(&self, credentials: &Credentials) -> Result<ServerLimits> {
        self.call(self.request(credentials, Method::GET, "/config"))
            .await
    }

    /// Follow `GET transfer/{task_id}/events`.
    ///
    /// The stream ends after the terminal event or when the server closes
    /// the connection.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown tasks.
    pub async fn watch(
        &self,
        credentials: &Credentials,
        task_id: &str,
    ) -> Result<impl Stream<Item = Result<WatchEvent>>> {
        let response = self
            .request(
                credentials,
                Method::GET,
                &format!("/transfer/{task_id}/events"),
            )
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(transport)?;
        let response = check(response).await?;

        let state = WatchState {
            response,
            decoder: EventStreamDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        };
        Ok(stream::unfold(state, next_watch_event))
    }

    // ------------------------------------------------------------------
    // Whole transfers
    // ------------------------------------------------------------------

    /// Upload a local file.
    ///
    /// `on_progress` sees every acknowledged chunk. When sending fails the
    /// task is left open on the server so [`Self::resume_upload`] can finish
    /// it.
    ///
    /// # Errors
    ///
    /// Returns the first chunk error that survives the retry policy, or the
    /// completion error.
    pub async fn upload_file<F>(
        &self,
        credentials: &Credentials,
        path: &Path,
        options: UploadOptions,
        on_progress: F,
    ) -> Result<CompletedUpload>
    where
        F: Fn(&ChunkAck) + Sync,
    {
        let size = local_file_size(path).await?;
        let file_name = match options.file_name {
            Some(name) => name,
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::InvalidRequest(format!("{} has no file name", path.display())))?,
        };

        let checksum = checksum::digest_file(path, ChecksumAlgorithm::Sha256).await?;
        let mut init = InitUpload::new(file_name, size)
            .with_checksum(checksum.to_string())
            .with_options(options.transfer);
        init.path = options.remote_dir;

        let ticket = self.init_upload(credentials, &init).await?;
        tracing::info!(
            task_id = %ticket.task_id,
            size,
            chunk_size = ticket.chunk_size,
            "Upload started"
        );

        let ranges = split_ranges(0..size, ticket.chunk_size);
        let threads = self.config.threads.unwrap_or(ticket.threads);
        self.send_ranges(
            credentials,
            &ticket.task_id,
            path,
            ticket.chunk_size,
            ranges,
            threads,
            &on_progress,
        )
        .await?;

        let complete = CompleteUpload {
            task_id: ticket.task_id,
            checksum: Some(checksum.to_string()),
            metadata: options.metadata,
        };
        self.complete_upload(credentials, &complete).await
    }

    /// Finish an interrupted upload of `path`.
    ///
    /// A paused task is resumed first. Only the ranges the server reports
    /// missing are sent.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if the local file no longer matches the
    /// task's size, otherwise as [`Self::upload_file`].
    pub async fn resume_upload<F>(
        &self,
        credentials: &Credentials,
        task_id: &str,
        path: &Path,
        on_progress: F,
    ) -> Result<CompletedUpload>
    where
        F: Fn(&ChunkAck) + Sync,
    {
        let report = self.ranges(credentials, task_id).await?;
        let size = local_file_size(path).await?;
        if size != report.total {
            return Err(Error::InvalidRequest(format!(
                "{} is {size} bytes but task {task_id} expects {}",
                path.display(),
                report.total
            )));
        }
        if report.state == TaskState::Paused {
            self.resume(credentials, task_id).await?;
        }

        let missing: Vec<Range<u64>> = report
            .missing
            .iter()
            .flat_map(|&(start, end)| split_ranges(start..end, report.chunk_size))
            .collect();
        tracing::info!(
            task_id,
            missing = missing.len(),
            covered = report.received.iter().map(|(s, e)| e - s).sum::<u64>(),
            "Resuming upload"
        );

        let threads = self.config.threads.unwrap_or(crate::DEFAULT_THREADS);
        self.send_ranges(
            credentials,
            task_id,
            path,
            report.chunk_size,
            missing,
            threads,
            &on_progress,
        )
        .await?;

        let checksum = checksum::digest_file(path, ChecksumAlgorithm::Sha256).await?;
        let complete = CompleteUpload {
            task_id: task_id.to_string(),
            checksum: Some(checksum.to_string()),
            metadata: std::collections::HashMap::new(),
        };
        self.complete_upload(credentials, &complete).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_ranges<F>(
        &self,
        credentials: &Credentials,
        task_id: &str,
        path: &Path,
        chunk_size: u64,
        ranges: Vec<Range<u64>>,
        threads: usize,
        on_progress: &F,
    ) -> Result<()>
    where
        F: Fn(&ChunkAck) + Sync,
    {
        let mut acks = stream::iter(ranges)
            .map(|range| async move {
                let data = read_local_range(path, range.start, range.end - range.start).await?;
                let sum = Checksum::sha256(&data);
                let sequence = range.start / chunk_size.max(1);
                self.config
                    .retry
                    .run(
                        || {
                            self.upload_chunk(
                                credentials,
                                task_id,
                                range.start,
                                sequence,
                                data.clone(),
                                Some(&sum),
                            )
                        },
                        Error::is_recoverable,
                    )
                    .await
            })
            .buffer_unordered(threads.max(1));

        while let Some(ack) = acks.next().await {
            let ack = ack?;
            on_progress(&ack);
        }
        Ok(())
    }

    /// Download a file to `dest`.
    ///
    /// Bytes are staged in `<dest>.part` and every verified range is recorded
    /// in a [`DownloadJournal`] next to it. With `request.options.resume` set
    /// and a journal left by an earlier attempt for the same source, the
    /// journalled prefix is skipped; a staging file without a journal is
    /// overwritten from scratch. `on_progress` receives `(bytes_present, total)`.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] if `dest` exists and overwrite is off;
    /// [`Error::ChecksumMismatch`] when the assembled file fails verification.
    pub async fn download_file<F>(
        &self,
        credentials: &Credentials,
        mut request: DownloadRequest,
        dest: &Path,
        on_progress: F,
    ) -> Result<DownloadOutcome>
    where
        F: Fn(u64, u64) + Sync,
    {
        let overwrite = request.options.overwrite;
        if !overwrite && tokio::fs::try_exists(dest).await? {
            return Err(Error::AlreadyExists(dest.display().to_string()));
        }

        let (dir, key) = staging_location(dest)?;
        let store = ChunkStore::new(dir, RetryPolicy::fixed(3, Duration::from_millis(50))).await?;
        let staged = store.staging_path(&key);
        let journal_path = DownloadJournal::path_for(&staged);

        let recovered = if request.options.resume && tokio::fs::try_exists(&staged).await? {
            DownloadJournal::load(&journal_path)
                .await
                .map(DownloadJournal::into_prefix)
        } else {
            None
        };
        let prefix = recovered
            .as_ref()
            .map_or(0, |journal| journal.ranges.covered());
        if prefix > 0 {
            request = request.resume_from(prefix);
        }

        let mut ticket = self.request_download(credentials, &request).await?;
        let mut journal = match recovered {
            Some(journal) if journal.describes(&ticket.file_info) => journal,
            stale => {
                if stale.is_some() {
                    tracing::info!(
                        task_id = %ticket.task_id,
                        "Source changed since the last attempt, starting over"
                    );
                }
                if ticket.offset > 0 {
                    // The server counts the stale prefix as delivered.
                    if let Err(e) = self.cancel_download(credentials, &ticket.task_id).await {
                        tracing::debug!(task_id = %ticket.task_id, error = %e, "Cancel failed");
                    }
                    request.offset = None;
                    ticket = self.request_download(credentials, &request).await?;
                }
                DownloadJournal::new(&ticket.file_info)
            }
        };
        let total = ticket.file_info.file_size;
        let start = journal.ranges.covered();
        tracing::info!(
            task_id = %ticket.task_id,
            total,
            resumed_from = start,
            "Download started"
        );

        journal.save(&journal_path).await?;
        store.allocate(&key, total).await?;
        on_progress(start, total);

        let threads = self.config.threads.unwrap_or(crate::DEFAULT_THREADS);
        let fetched = self
            .fetch_ranges(
                credentials,
                &ticket,
                &store,
                &staged,
                &mut journal,
                &journal_path,
                threads,
                &on_progress,
            )
            .await;

        if let Err(e) = fetched {
            tracing::warn!(
                task_id = %ticket.task_id,
                kept = journal.ranges.covered(),
                error = %e,
                "Download interrupted"
            );
            return Err(e);
        }

        let checksum = match &ticket.file_info.checksum {
            Some(expected) => {
                let actual = store.digest(&staged, expected.algorithm()).await?;
                if let Err(e) = expected.ensure_matches(&actual) {
                    store.release(&staged).await;
                    DownloadJournal::discard(&journal_path).await;
                    return Err(e);
                }
                Some(actual)
            }
            None => None,
        };

        store.publish(&staged, dest, overwrite).await?;
        DownloadJournal::discard(&journal_path).await;
        tracing::info!(task_id = %ticket.task_id, path = %dest.display(), "Download completed");

        Ok(DownloadOutcome {
            task_id: ticket.task_id,
            path: dest.to_path_buf(),
            size: total,
            resumed_from: start,
            checksum,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_ranges<F>(
        &self,
        credentials: &Credentials,
        ticket: &DownloadTicket,
        store: &ChunkStore,
        staged: &Path,
        journal: &mut DownloadJournal,
        journal_path: &Path,
        threads: usize,
        on_progress: &F,
    ) -> Result<()>
    where
        F: Fn(u64, u64) + Sync,
    {
        let total = ticket.file_info.file_size;
        let wanted: Vec<Range<u64>> = journal
            .ranges
            .missing(total)
            .into_iter()
            .flat_map(|r| split_ranges(r, ticket.chunk_size))
            .collect();

        let mut chunks = stream::iter(wanted)
            .map(|range| async move {
                let length = range.end - range.start;
                let chunk = self
                    .config
                    .retry
                    .run(
                        || self.fetch_range(credentials, &ticket.task_id, range.start, length),
                        Error::is_recoverable,
                    )
                    .await?;
                if chunk.data.len() as u64 != length {
                    return Err(Error::InvalidRange {
                        offset: range.start,
                        length: chunk.data.len() as u64,
                        total,
                    });
                }
                store.write_at(staged, chunk.offset, &chunk.data).await?;
                Ok::<_, Error>(range)
            })
            .buffer_unordered(threads.max(1));

        while let Some(range) = chunks.next().await {
            let range = range?;
            journal.record(&range);
            if let Err(e) = journal.save(journal_path).await {
                tracing::warn!(error = %e, "Failed to update download journal");
            }
            on_progress(journal.ranges.covered(), total);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

struct WatchState {
    response: Response,
    decoder: EventStreamDecoder,
    pending: VecDeque<SseEvent>,
    done: bool,
}

async fn next_watch_event(mut state: WatchState) -> Option<(Result<WatchEvent>, WatchState)> {
    loop {
        if let Some(event) = state.pending.pop_front() {
            let item = event.json::<EventPayload>().map(|payload| WatchEvent {
                kind: event.event,
                snapshot: payload.snapshot,
                message: payload.message,
            });
            return Some((item, state));
        }
        if state.done {
            return None;
        }

        match state.response.chunk().await {
            Ok(Some(bytes)) => {
                let events = state.decoder.feed(&bytes);
                state.pending.extend(events);
            }
            Ok(None) => {
                if state.decoder.finish() {
                    tracing::debug!("Event stream ended mid-event");
                }
                state.done = true;
            }
            Err(e) => {
                state.done = true;
                return Some((Err(transport(e)), state));
            }
        }
    }
}

/// Turn a non-success response into the error the server raised.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let text = response.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ErrorBody>(&text) {
        Ok(ErrorBody {
            code: Some(wire), message,
        }) => Error::from_code(&wire, code, message),
        Ok(ErrorBody { message, .. }) => Error::Remote {
            status: code,
            message,
        },
        Err(_) => Error::Remote {
            status: code,
            message: if text.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                text
            },
        },
    })
}

fn transport(err: reqwest::Error) -> Error {
    Error::Remote {
        status: err.status().map_or(0, |s| s.as_u16()),
        message: err.to_string(),
    }
}

/// Split `range` into pieces of at most `chunk_size` bytes.
fn split_ranges(range: Range<u64>, chunk_size: u64) -> Vec<Range<u64>> {
    let step = chunk_size.max(1);
    let mut pieces = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let end = (start + step).min(range.end);
        pieces.push(start..end);
        start = end;
    }
    pieces
}

async fn local_file_size(path: &Path) -> Result<u64> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
    if !meta.is_file() {
        return Err(Error::InvalidRequest(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    Ok(meta.len())
}

async fn read_local_range(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; usize::try_from(length).unwrap_or(usize::MAX)];
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}

fn staging_location(dest: &Path) -> Result<(PathBuf, String)> {
    let key = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidRequest(format!("{} has no file name", dest.display())))?;
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ranges() {
        assert_eq!(split_ranges(0..10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(split_ranges(5..5, 4), Vec::<Range<u64>>::new());
        assert_eq!(split_ranges(3..7, 0), vec![3..4, 4..5, 5..6, 6..7]);
    }

    #[test]
    fn test_credentials_debug_redacts_token() {
        let creds = Credentials::bearer("secret-token");
        assert_eq!(creds.token(), Some("secret-token"));
        assert!(!format!("{creds:?}").contains("secret"));
        assert_eq!(Credentials::anonymous().token(), None);
    }

    #[test]
    fn test_staging_location() {
        let (dir, key) = staging_location(Path::new("/tmp/out/movie.mkv")).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/out"));
        assert_eq!(key, "movie.mkv");

        let (dir, _) = staging_location(Path::new("movie.mkv")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
    }

    fn info(size: u64, checksum: Option<Checksum>) -> FileInfo {
        FileInfo {
            file_id: None,
            file_name: "movie.mkv".to_string(),
            file_path: "movie.mkv".to_string(),
            file_size: size,
            content_type: None,
            checksum,
            metadata: std::collections::HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_journal_sits_beside_staging_file() {
        assert_eq!(
            DownloadJournal::path_for(Path::new("/tmp/out/movie.mkv.part")),
            PathBuf::from("/tmp/out/movie.mkv.part.json")
        );
    }

    #[test]
    fn test_journal_describes_only_its_source() {
        let journal = DownloadJournal::new(&info(100, Some(Checksum::sha256(b"a"))));
        assert!(journal.describes(&info(100, Some(Checksum::sha256(b"a")))));
        assert!(journal.describes(&info(100, None)));
        assert!(!journal.describes(&info(100, Some(Checksum::sha256(b"b")))));
        assert!(!journal.describes(&info(99, Some(Checksum::sha256(b"a")))));
    }

    #[test]
    fn test_journal_prefix_drops_detached_ranges() {
        let mut journal = DownloadJournal::new(&info(100, None));
        journal.record(&(0..30));
        journal.record(&(50..80));
        let journal = journal.into_prefix();
        assert_eq!(journal.ranges.covered(), 30);
        assert_eq!(journal.ranges.missing(100), vec![30..100]);
    }

    #[tokio::test]
    async fn test_unreadable_journal_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mkv.part.json");
        assert!(DownloadJournal::load(&path).await.is_none());

        std::fs::write(&path, b"{not json").unwrap();
        assert!(DownloadJournal::load(&path).await.is_none());

        let mut journal = DownloadJournal::new(&info(100, None));
        journal.record(&(0..40));
        journal.save(&path).await.unwrap();
        let loaded = DownloadJournal::load(&path).await.unwrap();
        assert_eq!(loaded.ranges.contiguous_prefix(), 40);
    }

    #[test]
    fn test_client_base_url() {
        let client = TransferClient::new(ClientConfig::new("http://localhost:9000/")).unwrap();
        assert_eq!(client.base_url, "http://localhost:9000/api/file");
    }

    #[test]
    fn test_event_payload_ignores_type_field() {
        let json = r#"{"type":"error","task_id":"t","direction":"upload","state":"cancelled",
            "transferred":1,"total":2,"progress":50,"speed":0,"speed_human":"0 B/s",
            "updated_at":"2024-01-01T00:00:00Z","message":"Transfer cancelled"}"#;
        let payload: EventPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.snapshot.state, TaskState::Cancelled);
        assert_eq!(payload.message.as_deref(), Some("Transfer cancelled"));
    }
}
