//! Error types for qflow.
//!
//! This module provides a unified error type for all qflow operations.
//! Protocol-level variants carry a stable code (`E001`..`E014`) that survives
//! the trip over HTTP, so a client sees the same taxonomy as the server.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for qflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for qflow.
#[derive(Error, Debug)]
pub enum Error {
    /// Task is unknown, expired, cancelled or already finished (E001)
    #[error("no such active task: {0}")]
    TaskNotFound(String),

    /// Chunk offset or length falls outside the task (E002)
    #[error("invalid range: offset {offset} length {length} for total size {total}")]
    InvalidRange {
        /// Requested offset
        offset: u64,
        /// Requested length
        length: u64,
        /// Total size of the task
        total: u64,
    },

    /// Payload or whole-file digest does not match (E003)
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Digest supplied by the peer
        expected: String,
        /// Digest computed locally
        actual: String,
    },

    /// Destination file exists and overwrite was not requested (E004)
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// Storage quota would be exceeded (E005)
    #[error("storage quota exceeded: need {needed} bytes, {available} bytes available")]
    QuotaExceeded {
        /// Bytes needed
        needed: u64,
        /// Bytes available
        available: u64,
    },

    /// File is larger than the configured maximum (E006)
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge {
        /// Requested size
        size: u64,
        /// Configured limit
        limit: u64,
    },

    /// Completion attempted before every byte was received (E007)
    #[error("transfer incomplete: {received} of {total} bytes received")]
    Incomplete {
        /// Bytes covered so far
        received: u64,
        /// Total size of the task
        total: u64,
    },

    /// Too many chunk operations in flight for one task (E008)
    #[error("task {task_id} is busy: {limit} chunk operations already in flight")]
    Busy {
        /// Task identifier
        task_id: String,
        /// Admission limit of the task
        limit: usize,
    },

    /// Task is paused and does not accept chunk operations (E009)
    #[error("task {0} is paused")]
    TaskPaused(String),

    /// Requested source file does not exist (E010)
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Malformed or unsupported request (E011)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Server is at its concurrent transfer limit (E012)
    #[error("too many concurrent transfers (limit {0})")]
    TooManyTransfers(usize),

    /// Storage I/O kept failing after bounded retries (E013)
    #[error("storage error: {0}")]
    StorageError(String),

    /// Remote peer or HTTP transport failure (E014)
    #[error("remote error ({status}): {message}")]
    Remote {
        /// HTTP status code, 0 when no response was received
        status: u16,
        /// Error description
        message: String,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::TaskNotFound(_) => Some("E001"),
            Self::InvalidRange { .. } => Some("E002"),
            Self::ChecksumMismatch { .. } => Some("E003"),
            Self::AlreadyExists(_) => Some("E004"),
            Self::QuotaExceeded { .. } => Some("E005"),
            Self::FileTooLarge { .. } => Some("E006"),
            Self::Incomplete { .. } => Some("E007"),
            Self::Busy { .. } => Some("E008"),
            Self::TaskPaused(_) => Some("E009"),
            Self::FileNotFound(_) => Some("E010"),
            Self::InvalidRequest(_) => Some("E011"),
            Self::TooManyTransfers(_) => Some("E012"),
            Self::StorageError(_) => Some("E013"),
            Self::Remote { .. } => Some("E014"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried unchanged).
    ///
    /// `NotFound`, `InvalidRange` and `AlreadyExists` need a corrected request;
    /// digest mismatches, admission rejections and transient I/O do not.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::ChecksumMismatch { .. }
            | Self::Busy { .. }
            | Self::TooManyTransfers(_)
            | Self::StorageError(_)
            | Self::Timeout(_) => true,
            Self::Remote { status, .. } => *status == 0 || *status >= 500,
            _ => false,
        }
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::TaskNotFound(_) => Some("Start a new transfer; this task id is no longer active."),
            Self::Incomplete { .. } => Some("Keep sending the missing chunks, then complete again."),
            Self::TaskPaused(_) => Some("Resume the task before sending more chunks."),
            Self::AlreadyExists(_) => Some("Retry with the overwrite option, or pick another name."),
            Self::QuotaExceeded { .. } => Some("Free up space on the server or raise storage.quota."),
            Self::ConfigError(_) => Some("Check the configuration file with: qflow config path"),
            _ => None,
        }
    }

    /// Rebuilds an error from a wire code and message.
    ///
    /// Used by the client to turn an error response back into the variant the
    /// server raised. Structured fields that do not survive the trip are zeroed.
    #[must_use]
    pub fn from_code(code: &str, status: u16, message: String) -> Self {
        match code {
            "E001" => Self::TaskNotFound(message),
            "E002" => Self::InvalidRange {
                offset: 0,
                length: 0,
                total: 0,
            },
            "E003" => Self::ChecksumMismatch {
                expected: message,
                actual: String::new(),
            },
            "E004" => Self::AlreadyExists(message),
            "E005" => Self::QuotaExceeded {
                needed: 0,
                available: 0,
            },
            "E006" => Self::FileTooLarge { size: 0, limit: 0 },
            "E007" => Self::Incomplete {
                received: 0,
                total: 0,
            },
            "E008" => Self::Busy {
                task_id: message,
                limit: 0,
            },
            "E009" => Self::TaskPaused(message),
            "E010" => Self::FileNotFound(message),
            "E011" => Self::InvalidRequest(message),
            "E012" => Self::TooManyTransfers(0),
            "E013" => Self::StorageError(message),
            _ => Self::Remote { status, message },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
