//! Operator endpoints.

use crate::{errors::AppError, services::content_store::ReclaimReport, state::AppState};
use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ReclaimQuery {
    /// Override the configured retention window for this run only.
    pub retention_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReclaimResponse {
    #[serde(flatten)]
    pub report: ReclaimReport,
    pub retention_days: i64,
    pub message: String,
}

/// `POST /admin/reclaim`: run an orphan sweep now, independent of the
/// daily schedule (and of whether the schedule is enabled).
pub async fn reclaim(
    State(state): State<AppState>,
    Query(query): Query<ReclaimQuery>,
) -> Result<Json<ReclaimResponse>, AppError> {
    let retention = match query.retention_days {
        Some(days) if days < 0 => {
            return Err(AppError::bad_request("retention_days must not be negative"));
        }
        Some(days) => chrono::Duration::days(days),
        None => state.scheduler.policy().retention,
    };

    info!(retention_days = retention.num_days(), "on-demand reclamation requested");
    let report = state.scheduler.run_with_retention(retention).await?;

    Ok(Json(ReclaimResponse {
        message: format!(
            "Reclaimed {} of {} orphaned file(s), purged {} released tombstone(s)",
            report.reclaimed, report.candidates, report.purged
        ),
        retention_days: retention.num_days(),
        report,
    }))
}
