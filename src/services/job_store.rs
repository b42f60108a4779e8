//! src/services/job_store.rs
//!
//! JobStore: generation job lifecycle backed by the `jobs` table.
//!
//! Jobs claim the blobs they reference at creation and release them on
//! deletion, inside the same transaction as the job row itself, so a failed
//! claim never leaves a job behind and a deleted job never leaves a claim.

use crate::{
    models::job::{GenerationJob, JOB_COLUMNS, JobStatus, OutputArtifact, PoseType},
    services::{
        backend::{BackendError, PollOutcome, SynthesisBackend},
        content_store::{ContentStore, StorageError, claim_in, release_in},
        workflow::{JobInput, build_job_description},
    },
};
use chrono::Utc;
use serde::Deserialize;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite, types::Json};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("generation `{0}` not found")]
    NotFound(Uuid),
    #[error("{role} file not found: {id}")]
    BlobNotFound { role: &'static str, id: Uuid },
    #[error("generation `{id}` already {status}")]
    Conflict { id: Uuid, status: JobStatus },
    /// A backend call failed. `job` is the record as stored afterwards.
    #[error("{source}")]
    Backend {
        job: Box<GenerationJob>,
        source: BackendError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type JobResult<T> = Result<T, JobError>;

/// Parameters for a new generation job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewJob {
    pub prompt: String,
    pub clothing: Option<String>,
    pub style: Option<String>,
    #[serde(default)]
    pub realism: bool,
    pub pose_type: Option<PoseType>,
    pub pose_blob_id: Option<Uuid>,
    pub reference_blob_id: Option<Uuid>,
}

/// One page of jobs plus the total matching the filter.
#[derive(Debug)]
pub struct JobPage {
    pub jobs: Vec<GenerationJob>,
    pub total: i64,
}

pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Clone)]
pub struct JobStore {
    pub db: Arc<SqlitePool>,
    store: ContentStore,
    backend: Arc<dyn SynthesisBackend>,
}

impl JobStore {
    pub fn new(db: Arc<SqlitePool>, store: ContentStore, backend: Arc<dyn SynthesisBackend>) -> Self {
        Self { db, store, backend }
    }

    pub fn backend(&self) -> &Arc<dyn SynthesisBackend> {
        &self.backend
    }

    /// Insert a queued job, claiming its pose and reference blobs first.
    pub async fn create(&self, new: NewJob) -> JobResult<GenerationJob> {
        let mut tx = self.db.begin().await?;

        if let Some(id) = new.pose_blob_id {
            claim_in(&mut tx, id)
                .await
                .map_err(|err| blob_error("pose", id, err))?;
        }
        if let Some(id) = new.reference_blob_id {
            claim_in(&mut tx, id)
                .await
                .map_err(|err| blob_error("reference", id, err))?;
        }

        let job = sqlx::query_as::<_, GenerationJob>(&format!(
            "INSERT INTO jobs (
                id, prompt, clothing, style, realism, pose_type, pose_blob_id,
                reference_blob_id, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?)
            RETURNING {JOB_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.prompt)
        .bind(&new.clothing)
        .bind(&new.style)
        .bind(new.realism)
        .bind(new.pose_type)
        .bind(new.pose_blob_id)
        .bind(new.reference_blob_id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(job_id = %job.id, pose = ?job.pose_blob_id, reference = ?job.reference_blob_id, "created generation job");
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> JobResult<GenerationJob> {
        sqlx::query_as::<_, GenerationJob>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(JobError::NotFound(id))
    }

    /// Jobs newest first, optionally filtered by status.
    pub async fn list(
        &self,
        limit: i64,
        offset: i64,
        status: Option<JobStatus>,
    ) -> JobResult<JobPage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let offset = offset.max(0);

        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM jobs"));
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM jobs");
        if let Some(status) = status {
            builder.push(" WHERE status = ").push_bind(status);
            count.push(" WHERE status = ").push_bind(status);
        }
        builder.push(" ORDER BY created_at DESC, rowid DESC LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let jobs: Vec<GenerationJob> = builder.build_query_as().fetch_all(&*self.db).await?;
        let total: i64 = count.build_query_scalar().fetch_one(&*self.db).await?;
        Ok(JobPage { jobs, total })
    }

    /// Start a queued job and hand its description to the backend.
    ///
    /// The job moves to `running` before the backend is called. If the call
    /// fails the job is marked `failed` for good and the error carries the
    /// failed record; the caller creates a new job to retry.
    pub async fn submit(&self, id: Uuid) -> JobResult<GenerationJob> {
        let job = self.get(id).await?;
        if job.status != JobStatus::Queued {
            return Err(JobError::Conflict {
                id,
                status: job.status,
            });
        }

        let input = self.job_input(&job).await?;
        let description = build_job_description(&input);

        let started = sqlx::query_as::<_, GenerationJob>(&format!(
            "UPDATE jobs SET status = 'running', started_at = ?, job_description = ?
             WHERE id = ? AND status = 'queued'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(Json(&description))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        if started.is_none() {
            let current = self.get(id).await?;
            return Err(JobError::Conflict {
                id,
                status: current.status,
            });
        }
        info!(job_id = %id, "generation job running");

        match self.backend.submit(&description).await {
            Ok(backend_job_id) => {
                let job = sqlx::query_as::<_, GenerationJob>(&format!(
                    "UPDATE jobs SET backend_job_id = ? WHERE id = ? RETURNING {JOB_COLUMNS}"
                ))
                .bind(&backend_job_id)
                .bind(id)
                .fetch_optional(&*self.db)
                .await?
                .ok_or(JobError::NotFound(id))?;
                info!(job_id = %id, %backend_job_id, "submitted to backend");
                Ok(job)
            }
            Err(err) => {
                warn!(job_id = %id, error = %err, "backend submission failed");
                let job = self
                    .fail(id, &format!("backend submission failed: {}", err))
                    .await?;
                Err(JobError::Backend {
                    job: Box::new(job),
                    source: err,
                })
            }
        }
    }

    /// Record a successful run. Only `running` jobs can complete.
    pub async fn complete(
        &self,
        id: Uuid,
        artifacts: Vec<OutputArtifact>,
    ) -> JobResult<GenerationJob> {
        let job = sqlx::query_as::<_, GenerationJob>(&format!(
            "UPDATE jobs SET status = 'completed', result = ?, completed_at = ?
             WHERE id = ? AND status = 'running'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Json(&artifacts))
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        match job {
            Some(job) => {
                info!(job_id = %id, outputs = artifacts.len(), "generation job completed");
                Ok(job)
            }
            None => Err(self.transition_error(id).await),
        }
    }

    /// Record a failed run. Only `running` jobs can fail.
    pub async fn fail(&self, id: Uuid, reason: &str) -> JobResult<GenerationJob> {
        let job = sqlx::query_as::<_, GenerationJob>(&format!(
            "UPDATE jobs SET status = 'failed', failure_reason = ?, completed_at = ?
             WHERE id = ? AND status = 'running'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        match job {
            Some(job) => {
                info!(job_id = %id, %reason, "generation job failed");
                Ok(job)
            }
            None => Err(self.transition_error(id).await),
        }
    }

    /// Poll the backend for a running job and record a terminal outcome.
    /// Jobs that are not running are returned unchanged.
    pub async fn refresh(&self, id: Uuid) -> JobResult<GenerationJob> {
        let job = self.get(id).await?;
        let Some(backend_job_id) = job.backend_job_id.clone() else {
            return Ok(job);
        };
        if job.status != JobStatus::Running {
            return Ok(job);
        }

        match self.backend.poll(&backend_job_id).await {
            Ok(PollOutcome::Pending) => Ok(job),
            Ok(PollOutcome::Completed(artifacts)) => self.complete(id, artifacts).await,
            Ok(PollOutcome::Failed(reason)) => {
                self.fail(id, &format!("backend reported failure: {}", reason))
                    .await
            }
            Err(err) => {
                warn!(job_id = %id, error = %err, "backend poll failed");
                Err(JobError::Backend {
                    job: Box::new(job),
                    source: err,
                })
            }
        }
    }

    /// Delete a job and release every blob it claimed, purging tombstones
    /// that are left without references. Returns `false` if the job did not
    /// exist.
    pub async fn delete(&self, id: Uuid) -> JobResult<bool> {
        let mut tx = self.db.begin().await?;

        let deleted = sqlx::query_as::<_, GenerationJob>(&format!(
            "DELETE FROM jobs WHERE id = ? RETURNING {JOB_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(job) = deleted else {
            return Ok(false);
        };

        for blob_id in job.blob_refs() {
            release_in(&mut tx, blob_id).await?;
        }

        tx.commit().await?;
        info!(job_id = %id, "deleted generation job");

        // A tombstone this job was the last holder of has nothing left to
        // protect. Failures here leave it for the next sweep.
        for blob_id in job.blob_refs() {
            if let Err(err) = self.store.purge_tombstone(blob_id).await {
                warn!(job_id = %id, %blob_id, error = %err, "failed to purge released tombstone");
            }
        }
        Ok(true)
    }

    /// Typed builder input: the job's options plus the on-disk paths of the
    /// blobs it claimed. Tombstoned blobs still resolve here.
    async fn job_input(&self, job: &GenerationJob) -> JobResult<JobInput> {
        let pose_image = self.blob_path(job.id, job.pose_blob_id).await?;
        let reference_image = self.blob_path(job.id, job.reference_blob_id).await?;
        Ok(JobInput::from_job(job, pose_image, reference_image))
    }

    async fn blob_path(&self, job_id: Uuid, blob_id: Option<Uuid>) -> JobResult<Option<PathBuf>> {
        let Some(blob_id) = blob_id else {
            return Ok(None);
        };
        match self.store.locate(blob_id).await? {
            Some(blob) => Ok(Some(self.store.path_of(&blob))),
            None => {
                warn!(%job_id, %blob_id, "claimed blob has no metadata row");
                Ok(None)
            }
        }
    }

    async fn transition_error(&self, id: Uuid) -> JobError {
        match self.get(id).await {
            Ok(current) => JobError::Conflict {
                id,
                status: current.status,
            },
            Err(err) => err,
        }
    }
}

fn blob_error(role: &'static str, id: Uuid, err: StorageError) -> JobError {
    match err {
        StorageError::NotFound(_) => JobError::BlobNotFound { role, id },
        other => JobError::Storage(other),
    }
}
