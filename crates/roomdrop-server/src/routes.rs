use std::io::SeekFrom;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::Field},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use roomdrop_store::{PolicyViolation, RoomEngine, StoreError};
use roomdrop_types::RoomId;
use roomdrop_types::api::{
    CleanupResponse, ErrorResponse, FileSummary, MessageSummary, RoomData, SendMessageRequest,
    SendMessageResponse, UploadResponse,
};

/// Room API state shared by all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RoomEngine>,
}

/// Multipart overhead allowed on top of the room cap.
const BODY_SLACK: usize = 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.engine.limits().max_room_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_SLACK);

    Router::new()
        .route("/rooms/{room}", get(room_data))
        .route("/rooms/{room}/files", post(upload))
        .route("/rooms/{room}/files/{id}", get(download).delete(delete_file))
        .route("/rooms/{room}/messages", post(send_message))
        .route("/rooms/{room}/cleanup", post(cleanup))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// An error rendered as `{"success": false, "message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StoreError::Rejected(PolicyViolation::UnsafeType) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            StoreError::Rejected(PolicyViolation::TooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
            StoreError::Rejected(PolicyViolation::RoomFull) => StatusCode::INSUFFICIENT_STORAGE,
            StoreError::NotFound => StatusCode::NOT_FOUND,
            StoreError::CipherMismatch => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::StorageFault(fault) => {
                error!("Storage fault: {:#}", fault);
                return Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "storage error".into(),
                };
            }
        };
        Self { status, message: e.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse::new(self.message))).into_response()
    }
}

fn parse_room(code: &str) -> Result<RoomId, ApiError> {
    RoomId::parse(code).map_err(|e| ApiError::bad_request(e.to_string()))
}

// ── Handlers ────────────────────────────────────────────────────────────

/// POST /rooms/{room}/files — multipart upload of one or more `files` fields.
///
/// Files are stored in order; the first rejection stops the request and
/// files stored before it are kept.
pub async fn upload(
    State(state): State<AppState>,
    Path(room): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let room = parse_room(&room)?;
    let limits = state.engine.limits();
    let mut stored = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed upload: {}", e)))?
    {
        if !matches!(field.name(), Some("files") | Some("files[]")) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();

        // Cheap checks first so a refused file is never spooled.
        if !limits.is_safe_file_type(&filename) {
            return Err(StoreError::Rejected(PolicyViolation::UnsafeType).into());
        }
        let (mut spool, size) = spool_field(&mut field, limits.max_file_size).await?;

        let record = state.engine.put_stream(&room, &filename, &mut spool, size).await?;
        stored.push(FileSummary::from(record));
    }

    if stored.is_empty() {
        return Err(ApiError::bad_request("no files were uploaded"));
    }

    info!("Room {}: {} file(s) uploaded", room, stored.len());
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse { success: true, files: stored }),
    ))
}

/// GET /rooms/{room} — files, messages and storage usage.
pub async fn room_data(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Result<Json<RoomData>, ApiError> {
    let room = parse_room(&room)?;
    let view = state.engine.snapshot(&room).await?;
    Ok(Json(RoomData::from(view)))
}

/// POST /rooms/{room}/messages
pub async fn send_message(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let room = parse_room(&room)?;
    let message = state.engine.post_message(&room, &req.message).await?;
    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse { success: true, message: MessageSummary::from(message) }),
    ))
}

/// DELETE /rooms/{room}/files/{id} — idempotent.
pub async fn delete_file(
    State(state): State<AppState>,
    Path((room, file_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let room = parse_room(&room)?;
    state.engine.delete(&room, &file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /rooms/{room}/files/{id} — decrypted bytes as an attachment.
pub async fn download(
    State(state): State<AppState>,
    Path((room, file_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let room = parse_room(&room)?;
    let file = state.engine.get(&room, &file_id).await?;

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_DISPOSITION, content_disposition(&file.name)),
        (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
        (header::PRAGMA, "no-cache".to_string()),
        (header::EXPIRES, "0".to_string()),
    ];
    Ok((headers, file.data))
}

/// POST /rooms/{room}/cleanup — reap expired records now.
pub async fn cleanup(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let room = parse_room(&room)?;
    let removed = state.engine.reap(&room).await;
    Ok(Json(CleanupResponse { success: true, removed }))
}

/// GET /health — liveness check.
pub async fn health() -> &'static str {
    "ok"
}

// ── Helpers ─────────────────────────────────────────────────────────────

/// Copy one multipart field into an anonymous temp file, refusing it as
/// soon as it passes `max_file_size`. Returns the rewound file and its size.
/// The file is unlinked on creation and vanishes when dropped.
async fn spool_field(field: &mut Field<'_>, max_file_size: u64) -> Result<(File, u64), ApiError> {
    let mut spool = File::from_std(tempfile::tempfile().map_err(spool_error)?);
    let mut size: u64 = 0;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::bad_request(format!("upload interrupted: {}", e)))?
    {
        size += chunk.len() as u64;
        if size > max_file_size {
            return Err(StoreError::Rejected(PolicyViolation::TooLarge).into());
        }
        spool.write_all(&chunk).await.map_err(spool_error)?;
    }

    spool.flush().await.map_err(spool_error)?;
    spool.seek(SeekFrom::Start(0)).await.map_err(spool_error)?;
    Ok((spool, size))
}

fn spool_error(e: std::io::Error) -> ApiError {
    StoreError::from(e).into()
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987
/// UTF-8 name. The stored name is untrusted.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut encoded = String::with_capacity(name.len() * 3);
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b) {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{:02X}", b));
        }
    }

    format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", fallback, encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_escapes_untrusted_names() {
        assert_eq!(
            content_disposition("hello.txt"),
            "attachment; filename=\"hello.txt\"; filename*=UTF-8''hello.txt"
        );
        assert_eq!(
            content_disposition("a\"b\r\n.txt"),
            "attachment; filename=\"a_b__.txt\"; filename*=UTF-8''a%22b%0D%0A.txt"
        );
        assert_eq!(
            content_disposition("报告 1.pdf"),
            "attachment; filename=\"__ 1.pdf\"; filename*=UTF-8''%E6%8A%A5%E5%91%8A%201.pdf"
        );
    }
}
