//! Common test utilities for `qflow` integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use qflow_core::checksum::Checksum;
use qflow_core::config::Config;
use qflow_core::transfer::{ChunkUpload, TransferCoordinator};

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// Configuration with every directory under `base`.
pub fn test_config(base: &Path) -> Config {
    let mut config = Config::rooted_at(base);
    config.storage.path_template = String::new();
    config.server.port = 0;
    config.server.localhost_only = true;
    config
}

/// Coordinator over [`test_config`].
pub async fn coordinator(base: &Path) -> Arc<TransferCoordinator> {
    Arc::new(
        TransferCoordinator::new(test_config(base))
            .await
            .expect("Failed to create coordinator"),
    )
}

/// Send `data[range]` as one chunk with its digest.
pub async fn send(
    coordinator: &TransferCoordinator,
    task_id: &str,
    data: &[u8],
    offset: u64,
    len: u64,
) -> qflow_core::Result<qflow_core::transfer::ChunkAck> {
    let start = usize::try_from(offset).unwrap();
    let end = usize::try_from(offset + len).unwrap();
    let payload = &data[start..end];
    let checksum = Checksum::sha256(payload).to_string();
    let sequence = offset / len.max(1);
    coordinator
        .upload_chunk(ChunkUpload::new(task_id, offset, sequence, payload).with_checksum(&checksum))
        .await
}
