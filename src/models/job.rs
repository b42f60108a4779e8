//! Represents an avatar generation job and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, types::Json};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Lifecycle state of a generation job.
///
/// `queued -> running -> {completed | failed}`; the last two are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status `{}`", other)),
        }
    }
}

/// Camera view requested for a generation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PoseType {
    Front,
    Back,
    Side,
    Quarter,
    /// All four single views in one submission.
    All,
}

impl PoseType {
    /// The single views, in the order a full-turnaround bundle renders them.
    pub const VIEWS: [PoseType; 4] = [
        PoseType::Front,
        PoseType::Back,
        PoseType::Side,
        PoseType::Quarter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoseType::Front => "front",
            PoseType::Back => "back",
            PoseType::Side => "side",
            PoseType::Quarter => "quarter",
            PoseType::All => "all",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PoseType::Front => "Front-facing view, standard proportions",
            PoseType::Back => "Back view, facing away from the camera",
            PoseType::Side => "Side profile, narrow aspect ratio",
            PoseType::Quarter => "Three-quarter view, slightly turned",
            PoseType::All => "All four views in a single submission",
        }
    }
}

impl FromStr for PoseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(PoseType::Front),
            "back" => Ok(PoseType::Back),
            "side" => Ok(PoseType::Side),
            "quarter" => Ok(PoseType::Quarter),
            "all" => Ok(PoseType::All),
            other => Err(format!(
                "invalid pose `{}`: must be one of front, back, side, quarter, all",
                other
            )),
        }
    }
}

/// One image produced by the synthesis backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OutputArtifact {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A tracked generation request.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct GenerationJob {
    pub id: Uuid,

    pub prompt: String,

    pub clothing: Option<String>,

    pub style: Option<String>,

    /// Photorealistic rather than stylized rendering.
    pub realism: bool,

    pub pose_type: Option<PoseType>,

    /// Claimed pose reference blob, if any.
    pub pose_blob_id: Option<Uuid>,

    /// Claimed style reference blob, if any.
    pub reference_blob_id: Option<Uuid>,

    pub status: JobStatus,

    /// Node graph sent to the backend; set when the job starts running.
    pub job_description: Option<Json<Value>>,

    /// Identifier assigned by the backend; absent while queued.
    pub backend_job_id: Option<String>,

    pub result: Option<Json<Vec<OutputArtifact>>>,

    /// Only populated when `status == failed`.
    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    /// Blob ids this job holds a claim on, pose first.
    pub fn blob_refs(&self) -> impl Iterator<Item = Uuid> {
        self.pose_blob_id.into_iter().chain(self.reference_blob_id)
    }
}

pub const JOB_COLUMNS: &str = "id, prompt, clothing, style, realism, pose_type, pose_blob_id, \
     reference_blob_id, status, job_description, backend_job_id, result, failure_reason, \
     created_at, started_at, completed_at";
