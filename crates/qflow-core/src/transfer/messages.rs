//! Request and response types of the transfer protocol.
//!
//! These are shared by the coordinator, the HTTP layer and the client, so they
//! all (de)serialize as the JSON bodies exchanged on the wire.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::FileInfo;
use crate::checksum::Checksum;

use super::{Direction, ProgressSnapshot, TaskState, TransferOptions};

/// Body of `POST upload/init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitUpload {
    /// File name, without directories
    pub filename: String,
    /// Total size in bytes
    pub file_size: u64,
    /// Expected whole-file digest, `"<alg>:<hex>"` or bare SHA-256 hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Content type, guessed from the name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Relative directory under the storage root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Transfer options
    #[serde(default)]
    pub options: TransferOptions,
}

impl InitUpload {
    /// Minimal request for `filename` of `file_size` bytes.
    #[must_use]
    pub fn new(filename: impl Into<String>, file_size: u64) -> Self {
        Self {
            filename: filename.into(),
            file_size,
            checksum: None,
            content_type: None,
            path: None,
            options: TransferOptions::default(),
        }
    }

    /// Attach the expected whole-file digest.
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }
}

/// Response of `POST upload/init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTicket {
    /// Task identifier
    pub task_id: String,
    /// Where the byte transport expects this task
    pub transport_endpoint: String,
    /// Negotiated chunk size
    pub chunk_size: u64,
    /// Retries per chunk the client should attempt
    pub max_retries: u32,
    /// Transfer timeout in seconds
    pub timeout: u64,
    /// Concurrent chunk operations admitted
    pub threads: usize,
    /// Task state after init
    pub status: TaskState,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// One chunk of an upload.
#[derive(Debug, Clone, Copy)]
pub struct ChunkUpload<'a> {
    /// Task identifier
    pub task_id: &'a str,
    /// Byte offset of the payload
    pub offset: u64,
    /// Sequence number assigned by the sender
    pub sequence: u64,
    /// Raw bytes
    pub payload: &'a [u8],
    /// Optional digest of the payload
    pub checksum: Option<&'a str>,
}

impl<'a> ChunkUpload<'a> {
    /// Chunk without a per-chunk digest.
    #[must_use]
    pub const fn new(task_id: &'a str, offset: u64, sequence: u64, payload: &'a [u8]) -> Self {
        Self {
            task_id,
            offset,
            sequence,
            payload,
            checksum: None,
        }
    }

    /// Attach a per-chunk digest.
    #[must_use]
    pub const fn with_checksum(mut self, checksum: &'a str) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

/// Response of `POST upload/chunk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    /// Always true on success
    pub ack: bool,
    /// Task identifier
    pub task_id: String,
    /// Sequence number of the acknowledged chunk
    pub sequence: u64,
    /// Bytes in this chunk
    pub received: u64,
    /// Bytes covered by the task after this chunk
    pub total_received: u64,
    /// Integer percentage after this chunk
    pub progress: u8,
    /// The range had already been covered, nothing was written
    pub duplicate: bool,
}

/// Body of `POST upload/complete`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompleteUpload {
    /// Task identifier
    pub task_id: String,
    /// Whole-file digest to verify against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Free-form metadata stored with the file
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompleteUpload {
    /// Completion without digest or metadata.
    #[must_use]
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Self::default()
        }
    }
}

/// Throughput figures of a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Wall time from init to completion
    pub duration_ms: u64,
    /// Bytes per second over the whole run
    pub average_speed: u64,
    /// Highest windowed speed
    pub peak_speed: u64,
    /// Bytes transferred
    pub total_bytes: u64,
}

/// Response of `POST upload/complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedUpload {
    /// Task identifier
    pub task_id: String,
    /// Always `completed`
    pub status: TaskState,
    /// The published file
    pub file_info: FileInfo,
    /// Throughput figures
    pub transfer_stats: TransferStats,
    /// Completion time
    pub completed_at: DateTime<Utc>,
}

/// Body of `POST download/request`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Catalog identifier of the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Path relative to the storage root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Where the client intends to write, echoed back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Bytes the client already has
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Transfer options
    #[serde(default)]
    pub options: TransferOptions,
}

impl DownloadRequest {
    /// Request a catalogued file by id.
    #[must_use]
    pub fn by_id(file_id: impl Into<String>) -> Self {
        Self {
            file_id: Some(file_id.into()),
            ..Self::default()
        }
    }

    /// Request a file by its path under the storage root.
    #[must_use]
    pub fn by_path(file_path: impl Into<String>) -> Self {
        Self {
            file_path: Some(file_path.into()),
            ..Self::default()
        }
    }

    /// Resume from `offset` bytes already held locally.
    #[must_use]
    pub fn resume_from(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self.options.resume = true;
        self
    }
}

/// Response of `POST download/request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTicket {
    /// Task identifier
    pub task_id: String,
    /// Where the byte transport serves this task
    pub transport_endpoint: String,
    /// The file being downloaded, with its whole-file digest
    pub file_info: FileInfo,
    /// Negotiated chunk size
    pub chunk_size: u64,
    /// Transfer timeout in seconds
    pub timeout: u64,
    /// Offset the task starts from
    pub offset: u64,
    /// Echo of the client's local path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Task state after the request
    pub status: TaskState,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A delivered download range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadChunk {
    /// Offset of the first byte
    pub offset: u64,
    /// Bytes of the range
    pub data: Vec<u8>,
    /// Digest of `data`
    pub checksum: crate::checksum::Checksum,
}

/// Response of `GET transfer/{task_id}/ranges`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeReport {
    /// Task identifier
    pub task_id: String,
    /// Task state
    pub state: TaskState,
    /// Total size in bytes
    pub total: u64,
    /// Negotiated chunk size
    pub chunk_size: u64,
    /// Covered `[start, end)` intervals
    pub received: Vec<(u64, u64)>,
    /// Missing `[start, end)` intervals
    pub missing: Vec<(u64, u64)>,
}

/// Body of `POST transfer/batch-status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatusRequest {
    /// Tasks to look up
    pub task_ids: Vec<String>,
}

/// Response of `POST transfer/batch-status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatusResponse {
    /// Snapshots of the known tasks, in request order
    pub tasks: Vec<ProgressSnapshot>,
}

/// Response of the cancel endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Task identifier
    pub task_id: String,
    /// Always `cancelled`
    pub status: TaskState,
}

/// Response of `GET health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: String,
    /// Server version
    pub version: String,
    /// Seconds since the server started
    pub uptime_secs: u64,
    /// Tasks that are pending, active or paused
    pub live_tasks: usize,
}

/// Query of `GET transfers`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferQuery {
    /// Only tasks of this direction
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Only tasks in this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskState>,
    /// Page size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Entries to skip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

/// A registered task with its progress, as `GET transfer/{task_id}` reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDetail {
    /// Current progress, including id, direction and state
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
    /// File name, without directories
    pub file_name: String,
    /// Path relative to the storage root
    pub file_path: String,
    /// Catalog identifier of the source file (downloads)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Negotiated chunk size
    pub chunk_size: u64,
    /// Expected whole-file digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    /// Resolved options
    pub options: TransferOptions,
    /// Content type of the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Why the task failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Response of `GET transfers`, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferList {
    /// Tasks of the requested page
    pub tasks: Vec<TransferDetail>,
    /// Matching tasks before paging
    pub total: usize,
}

/// Query of `GET list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileQuery {
    /// Only files under this directory of the storage root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Page size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Response of `GET list`, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileList {
    /// Catalogued files
    pub files: Vec<FileInfo>,
    /// Matching files before the limit
    pub total: usize,
}

/// Response of `GET quota`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaInfo {
    /// Configured quota in bytes
    pub total: u64,
    /// Bytes under the storage root
    pub used: u64,
    /// Bytes reserved by live uploads
    pub reserved: u64,
    /// Bytes a new upload may still claim
    pub available: u64,
    /// `used + reserved` as a percentage of `total`
    pub usage_percentage: f64,
    /// The same figures for humans
    pub formatted: QuotaFormatted,
}

/// Human-readable quota figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaFormatted {
    /// Configured quota
    pub total: String,
    /// Bytes in use
    pub used: String,
    /// Bytes still available
    pub available: String,
}

/// Response of `GET config`: the limits a client negotiates against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLimits {
    /// Upload limits
    pub upload: UploadLimits,
    /// Download limits
    pub download: DownloadLimits,
    /// Storage policy
    pub storage: StorageLimits,
}

/// Limits applied to uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadLimits {
    /// Largest single file accepted
    pub max_file_size: u64,
    /// Active tasks allowed across the server
    pub max_concurrent_transfers: usize,
    /// Preferred chunk size
    pub chunk_size: u64,
    /// Smallest negotiated chunk size
    pub min_chunk_size: u64,
    /// Largest negotiated chunk size
    pub max_chunk_size: u64,
    /// Whole-file digests are verified unless a request opts out
    pub checksum_required: bool,
}

/// Limits applied to downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLimits {
    /// Preferred chunk size
    pub chunk_size: u64,
    /// Largest range served per request
    pub max_chunk_size: u64,
    /// Downloads may start from an offset
    pub resume_support: bool,
    /// Default concurrent ranges per task
    pub threads: usize,
    /// Largest per-task concurrency
    pub max_threads: usize,
}

/// Storage policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLimits {
    /// Total bytes the storage root may hold
    pub quota: u64,
    /// Days a published file is kept (0 keeps files forever)
    pub retention_days: u32,
}
