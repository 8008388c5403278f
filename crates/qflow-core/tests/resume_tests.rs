//! Tests for upload sessions surviving a server restart.

mod common;

use qflow_core::checksum::Checksum;
use qflow_core::transfer::{CompleteUpload, InitUpload, SessionStore, TaskState};
use qflow_core::Error;

use common::{coordinator, create_temp_dir, random_bytes, send};

/// Test that received ranges are restored after a restart and only the
/// missing part has to be sent again.
#[tokio::test]
async fn test_upload_resumes_after_restart() {
    let dir = create_temp_dir();
    let data = random_bytes(4 * 65_536);

    let task_id = {
        let first = coordinator(dir.path()).await;
        let ticket = first
            .init_upload(
                InitUpload::new("restart.bin", data.len() as u64)
                    .with_checksum(Checksum::sha256(&data).to_string()),
            )
            .await
            .unwrap();
        assert_eq!(ticket.chunk_size, 65_536);

        send(&first, &ticket.task_id, &data, 0, 65_536).await.unwrap();
        send(&first, &ticket.task_id, &data, 2 * 65_536, 65_536)
            .await
            .unwrap();
        assert_eq!(first.persist_all().await, 1);
        ticket.task_id
    };

    let second = coordinator(dir.path()).await;
    assert!(matches!(
        second.progress(&task_id).await,
        Err(Error::TaskNotFound(_))
    ));
    assert_eq!(second.restore().await.unwrap(), 1);

    let report = second.ranges(&task_id).await.unwrap();
    assert_eq!(report.state, TaskState::Active);
    assert_eq!(report.received, vec![(0, 65_536), (131_072, 196_608)]);
    assert_eq!(report.missing, vec![(65_536, 131_072), (196_608, 262_144)]);

    for (start, end) in report.missing {
        send(&second, &task_id, &data, start, end - start).await.unwrap();
    }
    let completed = second
        .complete_upload(CompleteUpload::new(&task_id))
        .await
        .unwrap();
    assert_eq!(completed.file_info.checksum, Some(Checksum::sha256(&data)));

    let published = dir.path().join("files").join("restart.bin");
    assert_eq!(std::fs::read(published).unwrap(), data);

    let store = SessionStore::open(dir.path().join("state").join("sessions"))
        .await
        .unwrap();
    assert!(store.load(&task_id).await.unwrap().is_none());
}

/// Test that a paused upload comes back paused.
#[tokio::test]
async fn test_paused_upload_restores_paused() {
    let dir = create_temp_dir();

    let task_id = {
        let first = coordinator(dir.path()).await;
        let ticket = first
            .init_upload(InitUpload::new("paused.bin", 1000))
            .await
            .unwrap();
        first.pause(&ticket.task_id).await.unwrap();
        ticket.task_id
    };

    let second = coordinator(dir.path()).await;
    assert_eq!(second.restore().await.unwrap(), 1);
    assert_eq!(
        second.progress(&task_id).await.unwrap().state,
        TaskState::Paused
    );
    second.resume(&task_id).await.unwrap();
}

/// Test that records whose staging file vanished are discarded.
#[tokio::test]
async fn test_restore_discards_records_without_staging_file() {
    let dir = create_temp_dir();

    let task_id = {
        let first = coordinator(dir.path()).await;
        let ticket = first
            .init_upload(InitUpload::new("gone.bin", 1000))
            .await
            .unwrap();
        first.persist_all().await;
        ticket.task_id
    };
    std::fs::remove_file(dir.path().join("tmp").join(format!("{task_id}.part"))).unwrap();

    let second = coordinator(dir.path()).await;
    assert_eq!(second.restore().await.unwrap(), 0);

    let store = SessionStore::open(dir.path().join("state").join("sessions"))
        .await
        .unwrap();
    assert!(store.list().await.unwrap().is_empty());
}

/// Test that finished uploads are not persisted.
#[tokio::test]
async fn test_completed_upload_is_not_restored() {
    let dir = create_temp_dir();
    let data = random_bytes(500);

    {
        let first = coordinator(dir.path()).await;
        let ticket = first
            .init_upload(InitUpload::new("done.bin", 500))
            .await
            .unwrap();
        send(&first, &ticket.task_id, &data, 0, 500).await.unwrap();
        first
            .complete_upload(CompleteUpload::new(&ticket.task_id))
            .await
            .unwrap();
        assert_eq!(first.persist_all().await, 0);
    }

    let second = coordinator(dir.path()).await;
    assert_eq!(second.restore().await.unwrap(), 0);
    assert_eq!(second.live_tasks().await, 0);
}
