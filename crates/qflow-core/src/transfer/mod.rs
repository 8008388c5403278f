//! Transfer engine.
//!
//! A task moves one file in one [`Direction`]. Its bytes travel as
//! offset-addressed chunks that may arrive in any order, any number of times;
//! coverage is tracked by a [`ReceivedRangeSet`] and the task walks the
//! [`TaskState`] machine:
//!
//! ```text
//! Pending -> Active -> Completed
//!              |  ^
//!              v  |
//!             Paused
//! Active/Paused -> Failed | Cancelled
//! ```

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::config::TransferConfig;

pub mod coordinator;
pub mod messages;
pub mod progress;
pub mod range;
pub mod registry;
pub mod resume;
pub mod session;

pub use coordinator::{SweepReport, TransferCoordinator};
pub use messages::{
    BatchStatusRequest, BatchStatusResponse, CancelResponse, ChunkAck, ChunkUpload,
    CompleteUpload, CompletedUpload, DownloadChunk, DownloadLimits, DownloadRequest,
    DownloadTicket, FileList, FileQuery, HealthResponse, InitUpload, QuotaFormatted, QuotaInfo,
    RangeReport, ServerLimits, StorageLimits, TransferDetail, TransferList, TransferQuery,
    TransferStats, UploadLimits, UploadTicket,
};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use range::ReceivedRangeSet;
pub use registry::SessionRegistry;
pub use resume::{SessionRecord, SessionStore};
pub use session::TransferSession;

/// Direction of a transfer, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client sends bytes to the server
    Upload,
    /// Server sends bytes to the client
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Upload => "upload",
            Self::Download => "download",
        })
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Registered, backing storage not yet ready
    Pending,
    /// Accepting chunk operations
    Active,
    /// Temporarily refusing chunk operations
    Paused,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully (checksum mismatch, expiry)
    Failed,
    /// Cancelled by the client
    Cancelled,
}

impl TaskState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active | Self::Failed | Self::Cancelled)
                | (
                    Self::Active,
                    Self::Paused | Self::Completed | Self::Failed | Self::Cancelled
                )
                | (Self::Paused, Self::Active | Self::Failed | Self::Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Per-task options recognized on init and download requests.
///
/// Unknown fields are ignored. Unset fields take the server defaults
/// when the coordinator resolves them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Replace an existing file at the destination
    pub overwrite: bool,
    /// Payload is encrypted in transit (recorded, not interpreted)
    pub encryption: bool,
    /// Payload is compressed in transit (recorded, not interpreted)
    pub compression: bool,
    /// Validate the whole-file digest at completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_checksum: Option<bool>,
    /// Continue from previously recorded coverage
    pub resume: bool,
    /// Maximum concurrent chunk operations for the task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
}

impl TransferOptions {
    /// Fill unset fields from the server defaults and clamp `threads`.
    #[must_use]
    pub fn resolve(mut self, config: &TransferConfig) -> Self {
        let threads = self.threads.unwrap_or(config.threads);
        self.threads = Some(threads.clamp(1, config.max_threads.max(1)));
        self.verify_checksum = Some(self.verify_checksum.unwrap_or(config.verify_checksum));
        self
    }

    /// Effective concurrency limit.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads.unwrap_or(crate::DEFAULT_THREADS).max(1)
    }

    /// Effective whole-file verification flag.
    #[must_use]
    pub fn verify(&self) -> bool {
        self.verify_checksum.unwrap_or(true)
    }
}

/// Immutable description of a task, fixed at negotiation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    /// Server-generated identifier
    pub task_id: String,
    /// Transfer direction
    pub direction: Direction,
    /// File name, without directories
    pub file_name: String,
    /// Total size in bytes
    pub total_size: u64,
    /// Negotiated chunk size in bytes
    pub chunk_size: u64,
    /// Expected whole-file digest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    /// Resolved options
    pub options: TransferOptions,
    /// Content type of the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Upload: final destination. Download: source file.
    pub path: PathBuf,
    /// Upload: sparse staging file. Download: unused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_path: Option<PathBuf>,
    /// Catalog identifier of the source file (downloads)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Pick a chunk size for a file of `total` bytes.
///
/// Small files are split into about four chunks so progress stays meaningful;
/// huge files grow their chunks so the count stays under `max_chunks`.
/// The result is always within `[min_chunk_size, max_chunk_size]`.
#[must_use]
pub fn negotiate_chunk_size(total: u64, config: &TransferConfig) -> u64 {
    let base = config.chunk_size;
    let size = if total < base.saturating_mul(4) {
        total
            .div_ceil(4)
            .max(1)
            .next_power_of_two()
            .max(config.min_chunk_size)
            .min(base)
    } else {
        total
            .div_ceil(config.max_chunks.max(1))
            .next_power_of_two()
            .max(base)
    };
    size.clamp(config.min_chunk_size, config.max_chunk_size)
}
