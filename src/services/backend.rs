//! Client for the external image-synthesis backend (a ComfyUI-compatible
//! HTTP API).
//!
//! Submission is a single attempt bounded by a timeout; the caller decides
//! what a failure means for the job. Health probes never fail, they report.

use crate::models::job::OutputArtifact;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Unavailable(String),

    #[error("backend request timed out")]
    Timeout,

    #[error("backend rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// State of a submitted backend job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    Completed(Vec<OutputArtifact>),
    Failed(String),
}

/// Best-effort liveness report.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub ok: bool,
    pub url: String,
    pub details: Value,
}

/// The contract job submission relies on.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Submit a job description; returns the backend's job id.
    async fn submit(&self, description: &Value) -> BackendResult<String>;

    async fn poll(&self, backend_job_id: &str) -> BackendResult<PollOutcome>;

    async fn health(&self) -> BackendHealth;
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub submit_timeout: Duration,
    pub health_timeout: Duration,
    pub user_agent: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8188".to_string(),
            connect_timeout: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            user_agent: concat!("avatar-store/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// reqwest-backed [`SynthesisBackend`] speaking the ComfyUI API.
pub struct ComfyBackend {
    client: Client,
    config: BackendConfig,
}

impl ComfyBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get_json(&self, path: &str, timeout: Duration) -> BackendResult<Value> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(timeout)
            .send()
            .await
            .map_err(map_request_error)?;
        read_json(response).await
    }
}

#[async_trait]
impl SynthesisBackend for ComfyBackend {
    async fn submit(&self, description: &Value) -> BackendResult<String> {
        debug!(url = %self.config.base_url, "submitting job description");
        let response = self
            .client
            .post(self.url("/prompt"))
            .timeout(self.config.submit_timeout)
            .json(description)
            .send()
            .await
            .map_err(map_request_error)?;

        let body = read_json(response).await?;
        body.get("prompt_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::InvalidResponse(format!("missing prompt_id in {}", body)))
    }

    async fn poll(&self, backend_job_id: &str) -> BackendResult<PollOutcome> {
        let history = self
            .get_json(
                &format!("/history/{}", backend_job_id),
                self.config.submit_timeout,
            )
            .await?;
        parse_history(backend_job_id, &history)
    }

    async fn health(&self) -> BackendHealth {
        match self
            .get_json("/system_stats", self.config.health_timeout)
            .await
        {
            Ok(stats) => BackendHealth {
                ok: true,
                url: self.config.base_url.clone(),
                details: stats,
            },
            Err(err) => {
                warn!(url = %self.config.base_url, error = %err, "backend health probe failed");
                BackendHealth {
                    ok: false,
                    url: self.config.base_url.clone(),
                    details: json!({ "error": err.to_string() }),
                }
            }
        }
    }
}

fn map_request_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Unavailable(err.to_string())
    }
}

async fn read_json(response: reqwest::Response) -> BackendResult<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    response.json::<Value>().await.map_err(|e| {
        if e.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::InvalidResponse(e.to_string())
        }
    })
}

/// Interpret a `/history/{id}` document. An id absent from the document has
/// not finished yet.
fn parse_history(backend_job_id: &str, history: &Value) -> BackendResult<PollOutcome> {
    let Some(entry) = history.get(backend_job_id) else {
        return Ok(PollOutcome::Pending);
    };

    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str);
    if status_str == Some("error") {
        let reason = status
            .and_then(|s| s.get("messages"))
            .map(Value::to_string)
            .unwrap_or_else(|| "backend reported an error".to_string());
        return Ok(PollOutcome::Failed(reason));
    }

    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if !completed {
        return Ok(PollOutcome::Pending);
    }

    let mut artifacts = Vec::new();
    if let Some(outputs) = entry.get("outputs").and_then(Value::as_object) {
        for node in outputs.values() {
            if let Some(images) = node.get("images") {
                let parsed: Vec<OutputArtifact> = serde_json::from_value(images.clone())
                    .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
                artifacts.extend(parsed);
            }
        }
    }
    Ok(PollOutcome::Completed(artifacts))
}
