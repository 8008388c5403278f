//! HTTP surface of the transfer protocol.
//!
//! Every route lives under [`crate::API_PREFIX`]:
//!
//! - `POST upload/init`, `POST upload/chunk`, `POST upload/complete`,
//!   `DELETE upload/{task_id}`
//! - `POST download/request`, `GET download/{task_id}`,
//!   `DELETE download/{task_id}`
//! - `GET transfer/{task_id}/progress`, `GET transfer/{task_id}/ranges`,
//!   `POST transfer/{task_id}/pause`, `POST transfer/{task_id}/resume`,
//!   `GET transfer/{task_id}/events`, `POST transfer/batch-status`,
//!   `GET transfer/{task_id}`, `GET transfers`
//! - `GET files/{file_id}`, `GET list`, `DELETE {file_id}`
//! - `GET quota`, `GET config`, `GET health`

pub mod error;
pub mod handlers;
pub mod sse;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::{Error, Result};
use crate::transfer::TransferCoordinator;

pub use error::{ApiError, ApiResult};
pub use state::{AppState, SharedState};

pub use crate::API_PREFIX;

/// Allowance on top of `max_chunk_size` for request bodies.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

/// Build the API router.
pub fn router(state: SharedState) -> Router {
    let config = state.coordinator.config();
    let body_limit = usize::try_from(config.transfer.max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);
    let cors = config.server.cors;

    let api = Router::new()
        .route("/upload/init", post(handlers::init_upload))
        .route("/upload/chunk", post(handlers::upload_chunk))
        .route("/upload/complete", post(handlers::complete_upload))
        .route("/upload/{task_id}", delete(handlers::cancel_upload))
        .route("/download/request", post(handlers::request_download))
        .route(
            "/download/{task_id}",
            get(handlers::download).delete(handlers::cancel_download),
        )
        .route("/transfers", get(handlers::list_transfers))
        .route("/transfer/batch-status", post(handlers::batch_status))
        .route("/transfer/{task_id}", get(handlers::transfer_detail))
        .route("/transfer/{task_id}/progress", get(handlers::progress))
        .route("/transfer/{task_id}/ranges", get(handlers::ranges))
        .route("/transfer/{task_id}/pause", post(handlers::pause))
        .route("/transfer/{task_id}/resume", post(handlers::resume))
        .route("/transfer/{task_id}/events", get(sse::task_events))
        .route("/files/{file_id}", get(handlers::file_info))
        .route("/list", get(handlers::list_files))
        .route("/quota", get(handlers::quota))
        .route("/config", get(handlers::limits))
        .route("/health", get(handlers::health))
        .route("/{file_id}", delete(handlers::delete_file));

    let app = Router::new()
        .nest(API_PREFIX, api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state);

    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// HTTP server around a [`TransferCoordinator`].
#[derive(Debug)]
pub struct WebServer {
    coordinator: Arc<TransferCoordinator>,
    addr: SocketAddr,
}

impl WebServer {
    /// Server bound to the configured address.
    #[must_use]
    pub fn new(coordinator: Arc<TransferCoordinator>) -> Self {
        let addr = coordinator.config().server.bind_addr();
        Self { coordinator, addr }
    }

    /// Override the bind address.
    #[must_use]
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Address the server binds to.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind and serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or serving fails.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind {}: {e}", self.addr),
            ))
        })?;
        self.run(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if serving fails.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        tracing::info!("Transfer API listening on http://{local}{API_PREFIX}");

        let app = router(AppState::new(self.coordinator));
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Transfer API stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;
    use crate::config::Config;
    use crate::transfer::{ChunkAck, CompletedUpload, ProgressSnapshot, RangeReport, UploadTicket};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let coordinator = TransferCoordinator::new(Config::rooted_at(dir.path()))
            .await
            .unwrap();
        (dir, router(AppState::new(Arc::new(coordinator))))
    }

    fn json_request(method: Method, uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn init(app: &Router, name: &str, size: u64) -> UploadTicket {
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/file/upload/init",
                &serde_json::json!({ "filename": name, "file_size": size }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        read_json(response).await
    }

    async fn send_chunk(app: &Router, task_id: &str, offset: u64, data: &[u8]) -> StatusCode {
        let uri = format!("/api/file/upload/chunk?task_id={task_id}&offset={offset}");
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(crate::CHUNK_CHECKSUM_HEADER, Checksum::sha256(data).to_string())
            .body(Body::from(data.to_vec()))
            .unwrap();
        app.clone().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app().await;
        let response = app
            .oneshot(empty_request(Method::GET, "/api/file/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: crate::transfer::HealthResponse = read_json(response).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.version, crate::VERSION);
        assert_eq!(body.live_tasks, 0);
    }

    #[tokio::test]
    async fn test_upload_round_trip() {
        let (_dir, app) = app().await;
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let ticket = init(&app, "data.bin", data.len() as u64).await;
        let chunk = usize::try_from(ticket.chunk_size).unwrap();

        for (i, piece) in data.chunks(chunk).enumerate().rev() {
            let status = send_chunk(&app, &ticket.task_id, (i * chunk) as u64, piece).await;
            assert_eq!(status, StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/file/upload/complete",
                &serde_json::json!({
                    "task_id": ticket.task_id,
                    "checksum": Checksum::sha256(&data).to_string(),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let completed: CompletedUpload = read_json(response).await;
        assert_eq!(completed.file_info.file_size, data.len() as u64);
    }

    #[tokio::test]
    async fn test_bad_chunk_checksum_is_rejected() {
        let (_dir, app) = app().await;
        let ticket = init(&app, "x.bin", 10).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!(
                "/api/file/upload/chunk?task_id={}&offset=0",
                ticket.task_id
            ))
            .header(
                crate::CHUNK_CHECKSUM_HEADER,
                Checksum::sha256(b"other").to_string(),
            )
            .body(Body::from(vec![1u8; 10]))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let err: ApiError = read_json(response).await;
        assert_eq!(err.code.as_deref(), Some("E003"));

        let response = app
            .oneshot(empty_request(
                Method::GET,
                &format!("/api/file/transfer/{}/ranges", ticket.task_id),
            ))
            .await
            .unwrap();
        let report: RangeReport = read_json(response).await;
        assert!(report.received.is_empty());
        assert_eq!(report.missing, vec![(0, 10)]);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_is_acknowledged() {
        let (_dir, app) = app().await;
        let ticket = init(&app, "dup.bin", 4).await;

        assert_eq!(send_chunk(&app, &ticket.task_id, 0, b"abcd").await, StatusCode::OK);

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!(
                "/api/file/upload/chunk?task_id={}&offset=0&sequence=0",
                ticket.task_id
            ))
            .body(Body::from("abcd"))
            .unwrap();
        let ack: ChunkAck = read_json(app.oneshot(request).await.unwrap()).await;
        assert!(ack.duplicate);
        assert_eq!(ack.total_received, 4);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let (_dir, app) = app().await;
        let response = app
            .clone()
            .oneshot(empty_request(
                Method::GET,
                "/api/file/transfer/missing/progress",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(empty_request(Method::DELETE, "/api/file/upload/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pause_blocks_chunks() {
        let (_dir, app) = app().await;
        let ticket = init(&app, "p.bin", 8).await;

        let response = app
            .clone()
            .oneshot(empty_request(
                Method::POST,
                &format!("/api/file/transfer/{}/pause", ticket.task_id),
            ))
            .await
            .unwrap();
        let snapshot: ProgressSnapshot = read_json(response).await;
        assert_eq!(snapshot.state, crate::transfer::TaskState::Paused);

        assert_eq!(
            send_chunk(&app, &ticket.task_id, 0, b"12345678").await,
            StatusCode::LOCKED
        );
    }

    #[tokio::test]
    async fn test_batch_status_skips_unknown() {
        let (_dir, app) = app().await;
        let ticket = init(&app, "b.bin", 8).await;

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/file/transfer/batch-status",
                &serde_json::json!({ "task_ids": [ticket.task_id, "nope"] }),
            ))
            .await
            .unwrap();
        let body: crate::transfer::BatchStatusResponse = read_json(response).await;
        assert_eq!(body.tasks.len(), 1);
        assert_eq!(body.tasks[0].task_id, ticket.task_id);
    }

    #[tokio::test]
    async fn test_streamed_download() {
        let (dir, app) = app().await;
        let data = vec![7u8; 300_000];
        std::fs::write(dir.path().join("files").join("big.bin"), &data).unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/file/download/request",
                &serde_json::json!({ "file_path": "big.bin" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ticket: crate::transfer::DownloadTicket = read_json(response).await;

        let response = app
            .clone()
            .oneshot(empty_request(
                Method::GET,
                &format!("/api/file/download/{}", ticket.task_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[crate::FILE_CHECKSUM_HEADER],
            Checksum::sha256(&data).to_string().as_str()
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), data.len());

        let response = app
            .oneshot(empty_request(
                Method::GET,
                &format!("/api/file/transfer/{}/progress", ticket.task_id),
            ))
            .await
            .unwrap();
        let snapshot: ProgressSnapshot = read_json(response).await;
        assert_eq!(snapshot.state, crate::transfer::TaskState::Completed);
    }

    #[tokio::test]
    async fn test_ranged_download() {
        let (dir, app) = app().await;
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(dir.path().join("files").join("r.bin"), &data).unwrap();

        let ticket: crate::transfer::DownloadTicket = read_json(
            app.clone()
                .oneshot(json_request(
                    Method::POST,
                    "/api/file/download/request",
                    &serde_json::json!({ "file_path": "r.bin" }),
                ))
                .await
                .unwrap(),
        )
        .await;

        let response = app
            .oneshot(empty_request(
                Method::GET,
                &format!("/api/file/download/{}?offset=100&length=50", ticket.task_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[crate::RANGE_OFFSET_HEADER], "100");
        let checksum = response.headers()[crate::CHUNK_CHECKSUM_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], &data[100..150]);
        Checksum::parse(&checksum).unwrap().verify(&body).unwrap();
    }

    #[tokio::test]
    async fn test_download_of_awkward_file_name() {
        let (dir, app) = app().await;
        let name = "say \"hi\"\nagain.bin";
        std::fs::write(dir.path().join("files").join(name), b"payload").unwrap();

        let ticket: crate::transfer::DownloadTicket = read_json(
            app.clone()
                .oneshot(json_request(
                    Method::POST,
                    "/api/file/download/request",
                    &serde_json::json!({ "file_path": name }),
                ))
                .await
                .unwrap(),
        )
        .await;

        let response = app
            .oneshot(empty_request(
                Method::GET,
                &format!("/api/file/download/{}", ticket.task_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response.headers()[axum::http::header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("filename=\"say _hi__again.bin\""));
        assert!(disposition.contains("filename*=UTF-8''say%20%22hi%22%0Aagain%2Ebin"));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"payload");
    }

    #[tokio::test]
    async fn test_inventory_routes() {
        let (_dir, app) = app().await;
        let data = vec![3u8; 1000];
        let ticket = init(&app, "notes.txt", data.len() as u64).await;
        assert_eq!(send_chunk(&app, &ticket.task_id, 0, &data).await, StatusCode::OK);
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/file/upload/complete",
                &serde_json::json!({ "task_id": ticket.task_id }),
            ))
            .await
            .unwrap();
        let completed: CompletedUpload = read_json(response).await;
        let file_id = completed.file_info.file_id.unwrap();

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/api/file/transfers?type=upload&status=completed"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list: crate::transfer::TransferList = read_json(response).await;
        assert_eq!(list.total, 1);
        assert_eq!(list.tasks[0].progress.task_id, ticket.task_id);

        let response = app
            .clone()
            .oneshot(empty_request(
                Method::GET,
                &format!("/api/file/transfer/{}", ticket.task_id),
            ))
            .await
            .unwrap();
        let detail: crate::transfer::TransferDetail = read_json(response).await;
        assert_eq!(detail.file_name, "notes.txt");
        assert_eq!(detail.progress.progress, 100);

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/api/file/list"))
            .await
            .unwrap();
        let files: crate::transfer::FileList = read_json(response).await;
        assert_eq!(files.total, 1);
        assert_eq!(files.files[0].file_id.as_deref(), Some(file_id.as_str()));

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/api/file/quota"))
            .await
            .unwrap();
        let quota: crate::transfer::QuotaInfo = read_json(response).await;
        assert_eq!(quota.used, 1000);

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/api/file/config"))
            .await
            .unwrap();
        let limits: crate::transfer::ServerLimits = read_json(response).await;
        assert!(limits.download.resume_support);

        let response = app
            .clone()
            .oneshot(empty_request(Method::DELETE, &format!("/api/file/{file_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(empty_request(Method::DELETE, &format!("/api/file/{file_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(empty_request(Method::GET, "/api/file/transfer/unknown"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
