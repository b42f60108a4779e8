//! Defines routes for uploads, generation jobs and operations.
//!
//! ## Structure
//! - **Files**
//!   - `POST   /upload/pose_image`      : upload a pose reference (multipart `file`)
//!   - `POST   /upload/reference_image` : upload a style reference (multipart `file`)
//!   - `GET    /files/{id}`             : download bytes
//!   - `GET    /files/{id}/info`        : metadata only
//!   - `GET    /files/hash/{digest}`    : does this content already exist?
//!   - `DELETE /files/{id}?force=`      : remove, or tombstone when forced
//!
//! - **Generations**
//!   - `POST   /generate/avatar`, `/generate_pose?pose=`, `/generate_all_poses`
//!   - `GET    /generations`, `GET|DELETE /generations/{id}`
//!   - `POST   /generations/{id}/refresh`
//!   - `GET    /poses`
//!
//! - **Operations**: `/healthz`, `/readyz`, `POST /admin/reclaim`

use crate::{
    handlers::{
        admin_handlers::reclaim,
        file_handlers::{
            check_hash, delete_file, download_file, file_info, upload_pose_image,
            upload_reference_image,
        },
        generation_handlers::{
            delete_generation, generate_all_poses, generate_avatar, generate_pose, get_generation,
            list_generations, list_poses, refresh_generation,
        },
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Multipart framing on top of the largest accepted file.
const BODY_OVERHEAD: usize = 64 * 1024;

/// Build the router. `max_upload_bytes` bounds request bodies so oversized
/// uploads are cut off before they are buffered.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // uploads and file access
        .route("/upload/pose_image", post(upload_pose_image))
        .route("/upload/reference_image", post(upload_reference_image))
        .route("/files/hash/{digest}", get(check_hash))
        .route("/files/{id}", get(download_file).delete(delete_file))
        .route("/files/{id}/info", get(file_info))
        // generation jobs
        .route("/generate/avatar", post(generate_avatar))
        .route("/generate_pose", post(generate_pose))
        .route("/generate_all_poses", post(generate_all_poses))
        .route("/generations", get(list_generations))
        .route(
            "/generations/{id}",
            get(get_generation).delete(delete_generation),
        )
        .route("/generations/{id}/refresh", post(refresh_generation))
        .route("/poses", get(list_poses))
        // operations
        .route("/admin/reclaim", post(reclaim))
        .layer(DefaultBodyLimit::max(
            max_upload_bytes.saturating_add(BODY_OVERHEAD),
        ))
}
