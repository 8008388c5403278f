//! Content digests for chunks and whole files.
//!
//! Checksums travel as `"<algorithm>:<hex>"` strings (`sha256:9f86…`,
//! `xxh64:44bc2cf5ad770999`). A bare hex string is read as SHA-256.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use xxhash_rust::xxh64::Xxh64;

use crate::error::{Error, Result};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256, the default and the only cryptographic choice
    #[default]
    Sha256,
    /// xxHash64 with seed 0, fast but not collision resistant
    Xxh64,
}

impl ChecksumAlgorithm {
    /// Prefix used in the textual form.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxh64 => "xxh64",
        }
    }

    /// Number of hex characters in a digest of this algorithm.
    #[must_use]
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Xxh64 => 16,
        }
    }

    /// Start an incremental hasher for this algorithm.
    #[must_use]
    pub fn hasher(self) -> Hasher {
        match self {
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
            Self::Xxh64 => Hasher::Xxh64(Xxh64::new(0)),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "xxh64" | "xxhash64" => Ok(Self::Xxh64),
            other => Err(Error::InvalidRequest(format!(
                "unsupported checksum algorithm: {other}"
            ))),
        }
    }
}

/// Incremental hasher over one of the supported algorithms.
pub enum Hasher {
    /// SHA-256 state
    Sha256(Sha256),
    /// xxHash64 state
    Xxh64(Xxh64),
}

impl Hasher {
    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Xxh64(h) => h.update(data),
        }
    }

    /// Consume the hasher and produce the checksum.
    #[must_use]
    pub fn finish(self) -> Checksum {
        match self {
            Self::Sha256(h) => Checksum {
                algorithm: ChecksumAlgorithm::Sha256,
                value: hex::encode(h.finalize()),
            },
            Self::Xxh64(h) => Checksum {
                algorithm: ChecksumAlgorithm::Xxh64,
                value: format!("{:016x}", h.digest()),
            },
        }
    }
}

/// A digest together with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    value: String,
}

impl Checksum {
    /// Digest an in-memory buffer.
    #[must_use]
    pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finish()
    }

    /// SHA-256 of an in-memory buffer.
    #[must_use]
    pub fn sha256(data: &[u8]) -> Self {
        Self::compute(ChecksumAlgorithm::Sha256, data)
    }

    /// Parse the textual form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for unknown algorithms, non-hex
    /// characters or a digest of the wrong length.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (algorithm, value) = match s.split_once(':') {
            Some((alg, value)) => (alg.parse()?, value),
            None => (ChecksumAlgorithm::Sha256, s),
        };

        if value.len() != algorithm.hex_len() || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidRequest(format!(
                "malformed {} checksum: {s}",
                algorithm.name()
            )));
        }

        Ok(Self {
            algorithm,
            value: value.to_ascii_lowercase(),
        })
    }

    /// Algorithm of this checksum.
    #[must_use]
    pub const fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Lowercase hex digest.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Check `data` against this checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] when the digests differ.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        self.ensure_matches(&Self::compute(self.algorithm, data))
    }

    /// Compare against an already computed checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] when the digests differ.
    pub fn ensure_matches(&self, actual: &Self) -> Result<()> {
        if self == actual {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.value)
    }
}

impl FromStr for Checksum {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Checksum {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        checksum.to_string()
    }
}

/// Digest a whole file, streaming it through a fixed-size buffer.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be opened or read.
pub async fn digest_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<Checksum> {
    digest_file_range(path, algorithm, 0, None).await
}

/// Digest `length` bytes of a file starting at `offset` (to EOF when `None`).
///
/// # Errors
///
/// Returns an I/O error if the file cannot be opened, seeked or read.
pub async fn digest_file_range(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    offset: u64,
    length: Option<u64>,
) -> Result<Checksum> {
    use tokio::io::AsyncSeekExt;

    let mut file = tokio::fs::File::open(path).await?;
    if offset > 0 {
        file.seek(std::io::SeekFrom::Start(offset)).await?;
    }

    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; crate::IO_BUFFER_SIZE];
    let mut remaining = length.unwrap_or(u64::MAX);

    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(buffer.len(), |r| r.min(buffer.len()));
        let n = file.read(&mut buffer[..want]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }

    Ok(hasher.finish())
}
