//! HTTP handlers for uploaded reference images.
//! Uploads are buffered (they must be hashed and inspected before anything is
//! written); downloads stream from disk.

use crate::{
    errors::AppError,
    models::blob::{BlobKind, StoredBlob},
    services::content_store::{Ingested, StorageError},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct Dimensions {
    pub width: Option<i64>,
    pub height: Option<i64>,
}

/// Body returned by both upload endpoints.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_id: Uuid,
    pub filename: String,
    pub content_hash: String,
    pub size: i64,
    pub mime_type: String,
    pub dimensions: Dimensions,
    pub url: String,
    pub is_duplicate: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Ingested> for UploadResponse {
    fn from(ingested: Ingested) -> Self {
        let blob = ingested.blob;
        Self {
            url: format!("/files/{}", blob.id),
            file_id: blob.id,
            filename: blob.filename,
            content_hash: blob.digest,
            size: blob.byte_size,
            mime_type: blob.media_type,
            dimensions: Dimensions {
                width: blob.width,
                height: blob.height,
            },
            is_duplicate: ingested.is_duplicate,
            created_at: blob.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub file_id: Uuid,
    pub filename: String,
    pub content_hash: String,
    pub kind: BlobKind,
    pub size: i64,
    pub mime_type: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub reference_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
}

impl From<StoredBlob> for FileInfo {
    fn from(blob: StoredBlob) -> Self {
        Self {
            file_id: blob.id,
            filename: blob.filename,
            content_hash: blob.digest,
            kind: blob.kind,
            size: blob.byte_size,
            mime_type: blob.media_type,
            width: blob.width,
            height: blob.height,
            reference_count: blob.reference_count,
            created_at: blob.created_at,
            last_touched_at: blob.last_touched_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HashCheckResponse {
    pub exists: bool,
    pub file_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteFileQuery {
    /// Hide the file even when jobs still reference it.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteFileResponse {
    pub message: String,
    pub file_id: Uuid,
    /// `removed` (row and bytes gone) or `tombstoned` (hidden, bytes kept).
    pub mode: &'static str,
}

/// `POST /upload/pose_image`
pub async fn upload_pose_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    upload(&state, multipart, BlobKind::PoseReference).await
}

/// `POST /upload/reference_image`
pub async fn upload_reference_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    upload(&state, multipart, BlobKind::StyleReference).await
}

async fn upload(
    state: &AppState,
    mut multipart: Multipart,
    kind: BlobKind,
) -> Result<Json<UploadResponse>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::new(err.status(), err.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let media_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data: Bytes = field
            .bytes()
            .await
            .map_err(|err| AppError::new(err.status(), err.body_text()))?;

        let ingested = state
            .store
            .ingest(data, &media_type, kind, &filename)
            .await?;
        info!(
            blob_id = %ingested.blob.id,
            kind = %kind,
            is_duplicate = ingested.is_duplicate,
            "upload accepted"
        );
        return Ok(Json(ingested.into()));
    }

    Err(AppError::bad_request("missing multipart field `file`"))
}

/// `GET /files/{id}`: stream the payload with its media type and filename.
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (blob, file) = state.store.retrieve(id).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &blob);
    Ok(response)
}

/// `GET /files/{id}/info`
pub async fn file_info(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FileInfo>, AppError> {
    let blob = state.store.resolve(id).await?;
    Ok(Json(blob.into()))
}

/// `GET /files/hash/{digest}`: lets clients skip uploading content the
/// store already holds.
pub async fn check_hash(
    State(state): State<AppState>,
    Path(digest): Path<String>,
) -> Result<Json<HashCheckResponse>, AppError> {
    let response = match state.store.resolve_by_digest(&digest).await {
        Ok(blob) => HashCheckResponse {
            exists: true,
            file_id: Some(blob.id),
            message: format!("File exists: {}", blob.filename),
        },
        Err(StorageError::NotFound(_)) => HashCheckResponse {
            exists: false,
            file_id: None,
            message: "File does not exist".into(),
        },
        Err(err) => return Err(err.into()),
    };
    Ok(Json(response))
}

/// `DELETE /files/{id}?force=`
///
/// Unreferenced files are removed outright. A referenced file is refused
/// with 409 unless `force` is set, in which case it is tombstoned.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeleteFileQuery>,
) -> Result<Json<DeleteFileResponse>, AppError> {
    let mode = match state.store.remove(id).await {
        Ok(true) => "removed",
        Ok(false) => return Err(AppError::not_found("File not found")),
        Err(StorageError::StillReferenced { .. }) if query.force => {
            if !state.store.tombstone(id).await? {
                return Err(AppError::not_found("File not found"));
            }
            "tombstoned"
        }
        Err(err) => return Err(err.into()),
    };

    Ok(Json(DeleteFileResponse {
        message: "File deleted successfully".into(),
        file_id: id,
        mode,
    }))
}

fn set_file_headers(headers: &mut HeaderMap, blob: &StoredBlob) {
    if let Ok(value) = HeaderValue::from_str(&blob.media_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(blob.byte_size));

    let filename = blob.filename.replace(['"', '\\'], "_");
    if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{}\"", filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", blob.digest)) {
        headers.insert(header::ETAG, value);
    }
}
