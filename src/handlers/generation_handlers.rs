//! HTTP handlers for avatar generation jobs.

use crate::{
    errors::AppError,
    models::{
        blob::BlobKind,
        job::{GenerationJob, JobStatus, OutputArtifact, PoseType},
    },
    services::job_store::{JobError, NewJob},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

const MIN_PROMPT_LEN: usize = 3;
const DEFAULT_PAGE_SIZE: i64 = 50;

/// Body accepted by every generate endpoint.
///
/// Images are referenced by uploaded file id. `pose_image` and
/// `reference_image` still accept inline base64 (optionally as a data URL);
/// those are ingested first and then referenced the same way.
#[derive(Debug, Default, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub clothing: Option<String>,
    pub style: Option<String>,
    #[serde(default)]
    pub realism: bool,
    pub pose_file_id: Option<Uuid>,
    pub reference_file_id: Option<Uuid>,
    pub pose_image: Option<String>,
    pub reference_image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerationResponse {
    pub generation_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub prompt: String,
    pub pose_type: Option<PoseType>,
    pub pose_file_id: Option<Uuid>,
    pub reference_file_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_description: Option<Value>,
    pub output_files: Option<Vec<OutputArtifact>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub backend_job_id: Option<String>,
}

impl GenerationResponse {
    fn new(job: GenerationJob, message: String) -> Self {
        Self {
            generation_id: job.id,
            status: job.status,
            message,
            prompt: job.prompt,
            pose_type: job.pose_type,
            pose_file_id: job.pose_blob_id,
            reference_file_id: job.reference_blob_id,
            job_description: None,
            output_files: job.result.map(|artifacts| artifacts.0),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.failure_reason,
            backend_job_id: job.backend_job_id,
        }
    }

    /// Same as the summary form, plus the submitted node graph.
    fn detailed(job: GenerationJob) -> Self {
        let description = job.job_description.clone().map(|graph| graph.0);
        let message = format!("Generation {}", job.status);
        Self {
            job_description: description,
            ..Self::new(job, message)
        }
    }
}

impl From<GenerationJob> for GenerationResponse {
    fn from(job: GenerationJob) -> Self {
        let message = format!("Generation {}", job.status);
        Self::new(job, message)
    }
}

#[derive(Debug, Serialize)]
pub struct GenerationListResponse {
    pub total: i64,
    pub generations: Vec<GenerationResponse>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct PoseQuery {
    pub pose: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<String>,
}

/// `POST /generate/avatar`
pub async fn generate_avatar(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, AppError> {
    let job = create_and_submit(&state, request, None).await?;
    Ok(Json(job.into()))
}

/// `POST /generate_pose?pose=front|back|side|quarter`
pub async fn generate_pose(
    State(state): State<AppState>,
    Query(query): Query<PoseQuery>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, AppError> {
    let pose = query
        .pose
        .parse::<PoseType>()
        .ok()
        .filter(|pose| *pose != PoseType::All)
        .ok_or_else(|| {
            AppError::bad_request(format!(
                "Invalid pose: {}. Must be one of: front, back, side, quarter",
                query.pose
            ))
        })?;

    let job = create_and_submit(&state, request, Some(pose)).await?;
    let message = format!("Generating {} view: {}", pose.as_str(), job.status);
    Ok(Json(GenerationResponse::new(job, message)))
}

/// `POST /generate_all_poses`
pub async fn generate_all_poses(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, AppError> {
    let job = create_and_submit(&state, request, Some(PoseType::All)).await?;
    let message = "Generating all poses (front, back, side, quarter)".to_string();
    Ok(Json(GenerationResponse::new(job, message)))
}

/// Create the job (claiming its images) and hand it to the backend.
///
/// A backend failure leaves the job `failed` and is still answered with
/// the job record; the caller can inspect `error` and create a new job.
async fn create_and_submit(
    state: &AppState,
    request: GenerationRequest,
    pose_type: Option<PoseType>,
) -> Result<GenerationJob, AppError> {
    let new = new_job(state, request, pose_type).await?;
    let job = state.jobs.create(new).await?;

    match state.jobs.submit(job.id).await {
        Ok(job) => Ok(job),
        Err(JobError::Backend { job, source }) => {
            debug!(job_id = %job.id, error = %source, "returning failed job to caller");
            Ok(*job)
        }
        Err(err) => Err(err.into()),
    }
}

async fn new_job(
    state: &AppState,
    request: GenerationRequest,
    pose_type: Option<PoseType>,
) -> Result<NewJob, AppError> {
    let prompt = request.prompt.trim().to_string();
    if prompt.chars().count() < MIN_PROMPT_LEN {
        return Err(AppError::bad_request(format!(
            "prompt must be at least {} characters",
            MIN_PROMPT_LEN
        )));
    }

    let pose_blob_id = match (request.pose_file_id, request.pose_image.as_deref()) {
        (Some(id), _) => Some(id),
        (None, Some(inline)) => Some(ingest_inline(state, inline, BlobKind::PoseReference).await?),
        (None, None) => None,
    };
    let reference_blob_id = match (request.reference_file_id, request.reference_image.as_deref())
    {
        (Some(id), _) => Some(id),
        (None, Some(inline)) => {
            Some(ingest_inline(state, inline, BlobKind::StyleReference).await?)
        }
        (None, None) => None,
    };

    Ok(NewJob {
        prompt,
        clothing: non_empty(request.clothing),
        style: non_empty(request.style),
        realism: request.realism,
        pose_type,
        pose_blob_id,
        reference_blob_id,
    })
}

/// Decode an inline image and run it through the normal ingest path.
async fn ingest_inline(state: &AppState, inline: &str, kind: BlobKind) -> Result<Uuid, AppError> {
    let (declared_type, data) = decode_inline_image(inline)?;
    let media_type = match declared_type {
        Some(media_type) => media_type,
        None => image::guess_format(&data)
            .map(|format| format.to_mime_type().to_string())
            .map_err(|_| AppError::bad_request("inline image format not recognized"))?,
    };
    let filename = format!("inline-{}", kind.as_str());
    let ingested = state
        .store
        .ingest(data, &media_type, kind, &filename)
        .await?;
    Ok(ingested.blob.id)
}

/// Split `data:<type>;base64,<payload>` (or bare base64) into the declared
/// media type and the decoded bytes.
fn decode_inline_image(inline: &str) -> Result<(Option<String>, Bytes), AppError> {
    let inline = inline.trim();
    let (media_type, payload) = match inline.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| AppError::bad_request("malformed data URL"))?;
            let Some(media_type) = header.strip_suffix(";base64") else {
                return Err(AppError::bad_request("data URL must be base64 encoded"));
            };
            let media_type = (!media_type.is_empty()).then(|| media_type.to_string());
            (media_type, payload)
        }
        None => (None, inline),
    };

    let data = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|err| AppError::bad_request(format!("invalid base64 image: {}", err)))?;
    Ok((media_type, Bytes::from(data)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `GET /generations/{id}`
pub async fn get_generation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<GenerationResponse>, AppError> {
    let job = state.jobs.get(id).await?;
    Ok(Json(GenerationResponse::detailed(job)))
}

/// `GET /generations?limit=&offset=&status=`
pub async fn list_generations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<GenerationListResponse>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(AppError::bad_request)?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    if limit < 1 || offset < 0 {
        return Err(AppError::bad_request(
            "limit must be positive and offset non-negative",
        ));
    }

    let page = state.jobs.list(limit, offset, status).await?;
    Ok(Json(GenerationListResponse {
        total: page.total,
        generations: page.jobs.into_iter().map(Into::into).collect(),
        limit: limit.min(crate::services::job_store::MAX_PAGE_SIZE),
        offset,
    }))
}

/// `DELETE /generations/{id}`: releases the job's image claims.
pub async fn delete_generation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    if !state.jobs.delete(id).await? {
        return Err(AppError::not_found("Generation not found"));
    }
    Ok(Json(json!({
        "message": "Generation deleted",
        "generation_id": id,
    })))
}

/// `POST /generations/{id}/refresh`: poll the backend once.
pub async fn refresh_generation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<GenerationResponse>, AppError> {
    let job = state.jobs.refresh(id).await?;
    Ok(Json(job.into()))
}

/// `GET /poses`
pub async fn list_poses() -> Json<Value> {
    let poses = PoseType::VIEWS
        .iter()
        .chain(std::iter::once(&PoseType::All))
        .map(|pose| {
            json!({
                "name": pose.as_str(),
                "description": pose.description(),
            })
        })
        .collect::<Vec<_>>();
    Json(json!({ "poses": poses }))
}
