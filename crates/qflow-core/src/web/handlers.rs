//! HTTP request handlers for the transfer API.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::Stream;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;

use crate::catalog::FileInfo;
use crate::transfer::coordinator::DownloadCursor;
use crate::transfer::{
    BatchStatusRequest, BatchStatusResponse, CancelResponse, ChunkAck, ChunkUpload,
    CompleteUpload, CompletedUpload, DownloadRequest, DownloadTicket, FileList, FileQuery,
    HealthResponse, InitUpload, ProgressSnapshot, QuotaInfo, RangeReport, ServerLimits, TaskState,
    TransferDetail, TransferList, TransferQuery, UploadTicket,
};
use crate::{CHUNK_CHECKSUM_HEADER, FILE_CHECKSUM_HEADER, RANGE_OFFSET_HEADER};

use super::error::{ApiError, ApiResult};
use super::state::SharedState;

const OCTET_STREAM: &str = "application/octet-stream";

// ============================================================================
// Upload Handlers
// ============================================================================

/// POST /api/file/upload/init - Open an upload task.
pub async fn init_upload(
    State(state): State<SharedState>,
    Json(request): Json<InitUpload>,
) -> ApiResult<Json<UploadTicket>> {
    let ticket = state.coordinator.init_upload(request).await?;
    Ok(Json(ticket))
}

/// Query parameters of a chunk upload.
#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    /// Task identifier
    pub task_id: String,
    /// Byte offset of the body
    pub offset: u64,
    /// Sender-assigned sequence number
    #[serde(default)]
    pub sequence: u64,
    /// Digest of the body, `alg:hex`
    pub checksum: Option<String>,
}

/// POST /api/file/upload/chunk - Write one chunk.
///
/// The body is the raw chunk. Its digest may be given as the `checksum`
/// query parameter or the `x-chunk-checksum` header.
pub async fn upload_chunk(
    State(state): State<SharedState>,
    Query(query): Query<ChunkQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ChunkAck>> {
    let header_checksum = headers
        .get(CHUNK_CHECKSUM_HEADER)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::with_code("E011", "Invalid x-chunk-checksum header"))
        })
        .transpose()?;
    let checksum = query.checksum.as_deref().or(header_checksum);

    let chunk = ChunkUpload {
        task_id: &query.task_id,
        offset: query.offset,
        sequence: query.sequence,
        payload: &body,
        checksum,
    };
    let ack = state.coordinator.upload_chunk(chunk).await?;
    Ok(Json(ack))
}

/// POST /api/file/upload/complete - Verify and publish an upload.
pub async fn complete_upload(
    State(state): State<SharedState>,
    Json(request): Json<CompleteUpload>,
) -> ApiResult<Json<CompletedUpload>> {
    let completed = state.coordinator.complete_upload(request).await?;
    Ok(Json(completed))
}

/// DELETE /api/file/upload/{task_id} - Cancel an upload.
pub async fn cancel_upload(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    state.coordinator.cancel_upload(&task_id).await?;
    Ok(Json(CancelResponse {
        task_id,
        status: TaskState::Cancelled,
    }))
}

// ============================================================================
// Download Handlers
// ============================================================================

/// POST /api/file/download/request - Open a download task.
pub async fn request_download(
    State(state): State<SharedState>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadTicket>> {
    let ticket = state.coordinator.request_download(request).await?;
    Ok(Json(ticket))
}

/// Query parameters of a byte delivery.
#[derive(Debug, Default, Deserialize)]
pub struct DeliveryQuery {
    /// First byte to deliver
    #[serde(default)]
    pub offset: u64,
    /// Number of bytes; absent streams to the end of the file
    pub length: Option<u64>,
}

/// GET /api/file/download/{task_id} - Deliver bytes of a download.
///
/// With `length` a single range is returned as `206 Partial Content` with its
/// digest in `x-chunk-checksum`. Without it the rest of the file is streamed.
pub async fn download(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
    Query(query): Query<DeliveryQuery>,
) -> ApiResult<Response> {
    if let Some(length) = query.length {
        let chunk = state
            .coordinator
            .read_download(&task_id, query.offset, length)
            .await?;
        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, OCTET_STREAM)
            .header(header::CONTENT_LENGTH, chunk.data.len())
            .header(CHUNK_CHECKSUM_HEADER, chunk.checksum.to_string())
            .header(RANGE_OFFSET_HEADER, chunk.offset)
            .body(Body::from(chunk.data))
            .map_err(|e| ApiError::internal(format!("Failed to build response: {e}")));
    }

    let cursor = state.coordinator.open_download(&task_id, query.offset).await?;
    let task = cursor.task();
    let content_type = task
        .content_type
        .clone()
        .unwrap_or_else(|| OCTET_STREAM.to_string());
    let disposition = content_disposition(&task.file_name);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, cursor.remaining())
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(RANGE_OFFSET_HEADER, cursor.position());
    if let Some(checksum) = &task.checksum {
        builder = builder.header(FILE_CHECKSUM_HEADER, checksum.to_string());
    }

    builder
        .body(Body::from_stream(cursor_stream(cursor)))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {e}")))
}

/// `Content-Disposition` value carrying `name` as an ASCII fallback plus the
/// exact UTF-8 name in `filename*`.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        utf8_percent_encode(name, NON_ALPHANUMERIC)
    )
}

fn cursor_stream(mut cursor: DownloadCursor) -> impl Stream<Item = crate::Result<Bytes>> {
    async_stream::try_stream! {
        while let Some(chunk) = cursor.next_chunk().await? {
            yield Bytes::from(chunk);
        }
    }
}

/// DELETE /api/file/download/{task_id} - Cancel a download.
pub async fn cancel_download(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    state.coordinator.cancel_download(&task_id).await?;
    Ok(Json(CancelResponse {
        task_id,
        status: TaskState::Cancelled,
    }))
}

// ============================================================================
// Transfer Handlers
// ============================================================================

/// GET /api/file/transfer/{task_id}/progress - Current progress.
pub async fn progress(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ProgressSnapshot>> {
    Ok(Json(state.coordinator.progress(&task_id).await?))
}

/// POST /api/file/transfer/batch-status - Progress of several tasks.
pub async fn batch_status(
    State(state): State<SharedState>,
    Json(request): Json<BatchStatusRequest>,
) -> Json<BatchStatusResponse> {
    let tasks = state.coordinator.batch_status(&request.task_ids).await;
    Json(BatchStatusResponse { tasks })
}

/// GET /api/file/transfer/{task_id}/ranges - Covered and missing ranges.
pub async fn ranges(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<RangeReport>> {
    Ok(Json(state.coordinator.ranges(&task_id).await?))
}

/// POST /api/file/transfer/{task_id}/pause - Pause a task.
pub async fn pause(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ProgressSnapshot>> {
    Ok(Json(state.coordinator.pause(&task_id).await?))
}

/// POST /api/file/transfer/{task_id}/resume - Resume a paused task.
pub async fn resume(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ProgressSnapshot>> {
    Ok(Json(state.coordinator.resume(&task_id).await?))
}

/// GET /api/file/transfers - Registered tasks, newest first.
pub async fn list_transfers(
    State(state): State<SharedState>,
    Query(query): Query<TransferQuery>,
) -> Json<TransferList> {
    Json(state.coordinator.list_transfers(&query).await)
}

/// GET /api/file/transfer/{task_id} - Description and progress of a task.
pub async fn transfer_detail(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TransferDetail>> {
    Ok(Json(state.coordinator.transfer_detail(&task_id).await?))
}

// ============================================================================
// Catalog and Health
// ============================================================================

/// GET /api/file/files/{file_id} - Look up a published file.
pub async fn file_info(
    State(state): State<SharedState>,
    Path(file_id): Path<String>,
) -> ApiResult<Json<FileInfo>> {
    Ok(Json(state.coordinator.file_info(&file_id).await?))
}

/// GET /api/file/list - Catalogued files, optionally under one directory.
pub async fn list_files(
    State(state): State<SharedState>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<FileList>> {
    Ok(Json(state.coordinator.list_files(&query).await?))
}

/// DELETE /api/file/{file_id} - Remove a published file.
pub async fn delete_file(
    State(state): State<SharedState>,
    Path(file_id): Path<String>,
) -> ApiResult<Json<FileInfo>> {
    Ok(Json(state.coordinator.delete_file(&file_id).await?))
}

/// GET /api/file/quota - Storage quota and its use.
pub async fn quota(State(state): State<SharedState>) -> ApiResult<Json<QuotaInfo>> {
    Ok(Json(state.coordinator.quota().await?))
}

/// GET /api/file/config - Limits clients negotiate against.
pub async fn limits(State(state): State<SharedState>) -> Json<ServerLimits> {
    Json(state.coordinator.limits())
}

/// GET /api/file/health - Liveness and version.
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        live_tasks: state.coordinator.live_tasks().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_plain_name() {
        assert_eq!(
            content_disposition("report.pdf"),
            "attachment; filename=\"report.pdf\"; filename*=UTF-8''report%2Epdf"
        );
    }

    #[test]
    fn test_content_disposition_escapes_quotes_and_unicode() {
        let value = content_disposition("say \"hi\"\\ é.txt");
        assert!(value.starts_with("attachment; filename=\"say _hi__ _.txt\";"));
        assert!(value.ends_with("filename*=UTF-8''say%20%22hi%22%5C%20%C3%A9%2Etxt"));
        assert!(header::HeaderValue::from_str(&value).is_ok());
    }

    #[test]
    fn test_content_disposition_control_characters_stay_valid() {
        let value = content_disposition("a\nb\r.bin");
        assert!(!value.chars().any(char::is_control));
        assert!(header::HeaderValue::from_str(&value).is_ok());
    }
}
