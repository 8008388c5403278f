//! # qflow Core Library
//!
//! `qflow-core` implements a resumable, checksum-verified chunked file-transfer
//! protocol: a large file moves between a client and a server in offset-addressed
//! chunks, survives disconnects, verifies integrity and reports live progress.
//!
//! ## Features
//!
//! - **Out-of-order assembly**: chunks are written by offset, in any order
//! - **Idempotent retries**: re-delivered ranges never double-count
//! - **Integrity**: per-chunk and whole-file SHA-256 / xxHash64 digests
//! - **Resume**: received ranges survive reconnects and process restarts
//!
//! ## Modules
//!
//! - [`catalog`] - Catalog of published files
//! - [`checksum`] - Content digests for chunks and whole files
//! - [`config`] - Configuration management
//! - [`events`] - Incremental server-sent event decoder
//! - [`retry`] - Bounded retry policies with fixed or exponential delay
//! - [`store`] - Durable chunk storage backed by sparse staging files
//! - [`transfer`] - Sessions, progress tracking and the transfer coordinator
//! - [`web`] - HTTP surface of the protocol
//! - [`client`] - HTTP client for the protocol
//!
//! ## Example
//!
//! ```rust,ignore
//! use qflow_core::config::Config;
//! use qflow_core::transfer::{ChunkUpload, InitUpload, TransferCoordinator};
//!
//! let coordinator = TransferCoordinator::new(Config::default()).await?;
//! let ticket = coordinator.init_upload(InitUpload::new("report.pdf", 42)).await?;
//! coordinator
//!     .upload_chunk(ChunkUpload::new(&ticket.task_id, 0, 0, &payload))
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod catalog;
pub mod checksum;
pub mod config;
pub mod error;
pub mod events;
pub mod retry;
pub mod store;
pub mod transfer;

#[cfg(feature = "web")]
pub mod web;

#[cfg(feature = "client")]
pub mod client;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default chunk size for file transfers (1 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Smallest chunk size ever negotiated (64 KiB)
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;

/// Largest chunk size ever negotiated (8 MiB)
pub const MAX_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default number of concurrent chunk operations per task
pub const DEFAULT_THREADS: usize = 4;

/// Default HTTP port of the transfer server
pub const DEFAULT_PORT: u16 = 8080;

/// Buffer size used when streaming whole files (64 KiB)
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Path prefix of all HTTP routes.
pub const API_PREFIX: &str = "/api/file";

/// Header carrying the digest of a single chunk or delivered range.
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";

/// Header carrying the digest of the whole file on download responses.
pub const FILE_CHECKSUM_HEADER: &str = "x-file-checksum";

/// Header carrying the offset of a delivered download range.
pub const RANGE_OFFSET_HEADER: &str = "x-range-offset";
