//! Client against a live server on an ephemeral port.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use qflow_core::checksum::Checksum;
use qflow_core::client::{
    ClientConfig, Credentials, DownloadJournal, TransferClient, UploadOptions,
};
use qflow_core::transfer::{
    DownloadRequest, FileQuery, InitUpload, ReceivedRangeSet, TaskState, TransferCoordinator,
    TransferQuery,
};
use qflow_core::web::WebServer;
use qflow_core::Error;

use common::{assert_files_equal, coordinator, create_temp_dir, create_test_file, random_bytes};

struct TestServer {
    addr: SocketAddr,
    coordinator: Arc<TransferCoordinator>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = create_temp_dir();
        let coordinator = coordinator(dir.path()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let server = WebServer::new(Arc::clone(&coordinator));
        let token = shutdown.clone();
        tokio::spawn(async move { server.run(listener, token.cancelled_owned()).await });

        Self {
            addr,
            coordinator,
            shutdown,
            _dir: dir,
        }
    }

    fn client(&self) -> TransferClient {
        TransferClient::new(ClientConfig::new(format!("http://{}", self.addr))).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start().await;
    let health = server
        .client()
        .health(&Credentials::anonymous())
        .await
        .unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, qflow_core::VERSION);
}

#[tokio::test]
async fn test_upload_then_download() {
    let server = TestServer::start().await;
    let client = server.client();
    let creds = Credentials::bearer("test-token");
    let local = create_temp_dir();
    let data = random_bytes(3 * 1024 * 1024 + 17);
    let source = create_test_file(local.path(), "source.bin", &data);

    let acked = AtomicU64::new(0);
    let completed = client
        .upload_file(&creds, &source, UploadOptions::default(), |ack| {
            acked.fetch_max(ack.total_received, Ordering::Relaxed);
        })
        .await
        .unwrap();
    assert_eq!(completed.status, TaskState::Completed);
    assert_eq!(acked.load(Ordering::Relaxed), data.len() as u64);
    assert_eq!(completed.file_info.checksum, Some(Checksum::sha256(&data)));

    let file_id = completed.file_info.file_id.clone().unwrap();
    let info = client.file_info(&creds, &file_id).await.unwrap();
    assert_eq!(info.file_size, data.len() as u64);

    let dest = local.path().join("out").join("copy.bin");
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    let outcome = client
        .download_file(&creds, DownloadRequest::by_id(&file_id), &dest, |_, _| {})
        .await
        .unwrap();
    assert_eq!(outcome.size, data.len() as u64);
    assert_eq!(outcome.resumed_from, 0);
    assert_files_equal(&source, &dest);
    assert!(!local.path().join("out").join("copy.bin.part").exists());
    assert!(!local.path().join("out").join("copy.bin.part.json").exists());

    let progress = client.progress(&creds, &outcome.task_id).await.unwrap();
    assert_eq!(progress.state, TaskState::Completed);
}

/// A staging file cut short by a killed client: the whole length is
/// allocated, the first `valid` bytes are real and the rest is zero.
fn killed_staging_file(dir: &std::path::Path, name: &str, data: &[u8], valid: usize) {
    let mut staged = vec![0u8; data.len()];
    staged[..valid].copy_from_slice(&data[..valid]);
    create_test_file(dir, name, &staged);
}

#[tokio::test]
async fn test_download_resumes_from_journal() {
    let server = TestServer::start().await;
    let client = server.client();
    let creds = Credentials::anonymous();
    let data = random_bytes(2 * 1024 * 1024);

    let root = server.coordinator.config().storage.root.clone();
    create_test_file(&root, "shared/archive.tar", &data);

    let local = create_temp_dir();
    let dest = local.path().join("archive.tar");
    let valid = 700_000;
    killed_staging_file(local.path(), "archive.tar.part", &data, valid);
    let journal_path = local.path().join("archive.tar.part.json");
    DownloadJournal {
        file_size: data.len() as u64,
        checksum: Some(Checksum::sha256(&data)),
        ranges: ReceivedRangeSet::from(vec![(0, valid as u64)]),
        updated_at: chrono::Utc::now(),
    }
    .save(&journal_path)
    .await
    .unwrap();

    let first = AtomicU64::new(u64::MAX);
    let mut request = DownloadRequest::by_path("shared/archive.tar");
    request.options.resume = true;
    let outcome = client
        .download_file(&creds, request, &dest, |present, _| {
            let _ = first.compare_exchange(u64::MAX, present, Ordering::Relaxed, Ordering::Relaxed);
        })
        .await
        .unwrap();

    assert_eq!(outcome.resumed_from, valid as u64);
    assert_eq!(first.load(Ordering::Relaxed), valid as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!journal_path.exists());
}

#[tokio::test]
async fn test_download_without_journal_ignores_staging_length() {
    let server = TestServer::start().await;
    let client = server.client();
    let creds = Credentials::anonymous();
    let data = random_bytes(2 * 1024 * 1024);

    let root = server.coordinator.config().storage.root.clone();
    create_test_file(&root, "shared/archive.tar", &data);

    // Full length on disk, but only the head was ever written.
    let local = create_temp_dir();
    let dest = local.path().join("archive.tar");
    killed_staging_file(local.path(), "archive.tar.part", &data, 700_000);

    let mut request = DownloadRequest::by_path("shared/archive.tar");
    request.options.resume = true;
    let outcome = client
        .download_file(&creds, request, &dest, |_, _| {})
        .await
        .unwrap();

    assert_eq!(outcome.resumed_from, 0);
    assert_eq!(outcome.checksum, Some(Checksum::sha256(&data)));
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn test_download_journal_of_other_source_is_discarded() {
    let server = TestServer::start().await;
    let client = server.client();
    let creds = Credentials::anonymous();
    let data = random_bytes(1024 * 1024);
    let stale = random_bytes(data.len());

    let root = server.coordinator.config().storage.root.clone();
    create_test_file(&root, "report.bin", &data);

    let local = create_temp_dir();
    let dest = local.path().join("report.bin");
    killed_staging_file(local.path(), "report.bin.part", &stale, 500_000);
    DownloadJournal {
        file_size: stale.len() as u64,
        checksum: Some(Checksum::sha256(&stale)),
        ranges: ReceivedRangeSet::from(vec![(0, 500_000)]),
        updated_at: chrono::Utc::now(),
    }
    .save(&local.path().join("report.bin.part.json"))
    .await
    .unwrap();

    let mut request = DownloadRequest::by_path("report.bin");
    request.options.resume = true;
    let outcome = client
        .download_file(&creds, request, &dest, |_, _| {})
        .await
        .unwrap();

    assert_eq!(outcome.resumed_from, 0);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn test_download_refuses_to_overwrite() {
    let server = TestServer::start().await;
    let client = server.client();
    let local = create_temp_dir();
    let dest = create_test_file(local.path(), "exists.txt", b"keep me");

    let err = client
        .download_file(
            &Credentials::anonymous(),
            DownloadRequest::by_path("whatever.txt"),
            &dest,
            |_, _| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
    assert_eq!(std::fs::read(&dest).unwrap(), b"keep me");
}

#[tokio::test]
async fn test_resume_upload_sends_missing_ranges() {
    let server = TestServer::start().await;
    let client = server.client();
    let creds = Credentials::anonymous();
    let local = create_temp_dir();
    let data = random_bytes(4 * 65_536);
    let source = create_test_file(local.path(), "partial.bin", &data);

    let ticket = client
        .init_upload(&creds, &InitUpload::new("partial.bin", data.len() as u64))
        .await
        .unwrap();
    let first = data[..65_536].to_vec();
    let sum = Checksum::sha256(&first);
    client
        .upload_chunk(&creds, &ticket.task_id, 0, 0, first, Some(&sum))
        .await
        .unwrap();
    client.pause(&creds, &ticket.task_id).await.unwrap();

    let sent = AtomicU64::new(0);
    let completed = client
        .resume_upload(&creds, &ticket.task_id, &source, |ack| {
            sent.fetch_add(ack.received, Ordering::Relaxed);
        })
        .await
        .unwrap();

    assert_eq!(sent.load(Ordering::Relaxed), 3 * 65_536);
    assert_eq!(completed.file_info.file_size, data.len() as u64);
}

#[tokio::test]
async fn test_server_errors_keep_their_code() {
    let server = TestServer::start().await;
    let client = server.client();
    let creds = Credentials::anonymous();

    let err = client.progress(&creds, "no-such-task").await.unwrap_err();
    assert!(matches!(err, Error::TaskNotFound(_)));
    assert!(!err.is_recoverable());

    let err = client
        .init_upload(&creds, &InitUpload::new("../escape", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let statuses = client
        .batch_status(&creds, &["no-such-task".to_string()])
        .await
        .unwrap();
    assert!(statuses.is_empty());
}

#[tokio::test]
async fn test_watch_reports_completion() {
    let server = TestServer::start().await;
    let client = server.client();
    let creds = Credentials::anonymous();
    let local = create_temp_dir();
    let source = create_test_file(local.path(), "watched.bin", &random_bytes(10_000));

    let completed = client
        .upload_file(&creds, &source, UploadOptions::default(), |_| {})
        .await
        .unwrap();

    let events: Vec<_> = client
        .watch(&creds, &completed.task_id)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events.len(), 1);
    let event = events.into_iter().next().unwrap().unwrap();
    assert_eq!(event.kind, "complete");
    assert_eq!(event.snapshot.state, TaskState::Completed);
    assert_eq!(event.snapshot.progress, 100);
}

#[tokio::test]
async fn test_cancel_upload_over_http() {
    let server = TestServer::start().await;
    let client = server.client();
    let creds = Credentials::anonymous();

    let ticket = client
        .init_upload(&creds, &InitUpload::new("cancel.bin", 1000))
        .await
        .unwrap();
    client.cancel_upload(&creds, &ticket.task_id).await.unwrap();

    let err = client
        .cancel_upload(&creds, &ticket.task_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TaskNotFound(_)));
    assert_eq!(server.coordinator.live_tasks().await, 0);
}

#[tokio::test]
async fn test_inventory_endpoints() {
    let server = TestServer::start().await;
    let client = server.client();
    let creds = Credentials::anonymous();
    let local = create_temp_dir();
    let data = random_bytes(200_000);
    let source = create_test_file(local.path(), "inventory.bin", &data);

    let completed = client
        .upload_file(&creds, &source, UploadOptions::default(), |_| {})
        .await
        .unwrap();
    let file_id = completed.file_info.file_id.clone().unwrap();

    let transfers = client
        .list_transfers(&creds, &TransferQuery::default())
        .await
        .unwrap();
    assert_eq!(transfers.total, 1);
    let detail = client
        .transfer_detail(&creds, &completed.task_id)
        .await
        .unwrap();
    assert_eq!(detail.progress.state, TaskState::Completed);
    assert_eq!(detail.file_name, "inventory.bin");

    let files = client.list_files(&creds, &FileQuery::default()).await.unwrap();
    assert_eq!(files.total, 1);
    assert_eq!(files.files[0].checksum, Some(Checksum::sha256(&data)));

    let quota = client.quota(&creds).await.unwrap();
    assert_eq!(quota.used, data.len() as u64);
    let limits = client.limits(&creds).await.unwrap();
    assert_eq!(
        limits.upload.max_file_size,
        server.coordinator.config().storage.max_file_size
    );

    let deleted = client.delete_file(&creds, &file_id).await.unwrap();
    assert_eq!(deleted.file_id.as_deref(), Some(file_id.as_str()));
    assert!(matches!(
        client.file_info(&creds, &file_id).await,
        Err(Error::FileNotFound(_))
    ));
    assert_eq!(client.quota(&creds).await.unwrap().used, 0);
}
