#![allow(dead_code)]

use async_trait::async_trait;
use avatar_store::{
    db,
    models::blob::{BlobKind, StoredBlob},
    services::{
        backend::{BackendError, BackendHealth, BackendResult, PollOutcome, SynthesisBackend},
        content_store::{ContentStore, IngestLimits},
        job_store::JobStore,
        reclamation::{ReclamationPolicy, ReclamationScheduler},
    },
    state::AppState,
};
use bytes::Bytes;
use chrono::{Duration, Utc};
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::{
    io::Cursor,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tempfile::TempDir;
use uuid::Uuid;

/// In-process stand-in for the synthesis backend.
pub struct FakeBackend {
    pub fail_submit: AtomicBool,
    pub submissions: Mutex<Vec<Value>>,
    pub poll_outcome: Mutex<PollOutcome>,
    counter: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            fail_submit: AtomicBool::new(false),
            submissions: Mutex::new(Vec::new()),
            poll_outcome: Mutex::new(PollOutcome::Pending),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        let backend = Self::new();
        backend.fail_submit.store(true, Ordering::SeqCst);
        backend
    }

    pub fn set_poll_outcome(&self, outcome: PollOutcome) {
        *self.poll_outcome.lock().unwrap() = outcome;
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl SynthesisBackend for FakeBackend {
    async fn submit(&self, description: &Value) -> BackendResult<String> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("connection refused".into()));
        }
        self.submissions.lock().unwrap().push(description.clone());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("fake-prompt-{}", n))
    }

    async fn poll(&self, _backend_job_id: &str) -> BackendResult<PollOutcome> {
        Ok(self.poll_outcome.lock().unwrap().clone())
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth {
            ok: !self.fail_submit.load(Ordering::SeqCst),
            url: "fake://backend".into(),
            details: json!({}),
        }
    }
}

/// Isolated database + storage root + services for one test.
pub struct Harness {
    pub dir: TempDir,
    pub db: Arc<SqlitePool>,
    pub store: ContentStore,
    pub jobs: JobStore,
    pub backend: Arc<FakeBackend>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_backend(FakeBackend::new()).await
    }

    pub async fn with_backend(backend: FakeBackend) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let pool = db::connect(&url, 5).await.expect("connect");
        db::run_migrations(&pool).await.expect("migrations");
        let db = Arc::new(pool);

        let store = ContentStore::new(db.clone(), dir.path().join("uploads"))
            .with_limits(IngestLimits::default());
        let backend = Arc::new(backend);
        let jobs = JobStore::new(db.clone(), store.clone(), backend.clone());

        Self {
            dir,
            db,
            store,
            jobs,
            backend,
        }
    }

    pub fn scheduler(&self, policy: ReclamationPolicy) -> ReclamationScheduler {
        ReclamationScheduler::new(self.store.clone(), policy)
    }

    pub fn app_state(&self) -> AppState {
        let policy = ReclamationPolicy {
            enabled: false,
            ..ReclamationPolicy::default()
        };
        AppState::new(
            self.store.clone(),
            self.jobs.clone(),
            Arc::new(self.scheduler(policy)),
        )
    }

    /// Ingest a fresh PNG distinguished by `seed`.
    pub async fn upload(&self, seed: u8, kind: BlobKind) -> StoredBlob {
        self.store
            .ingest(png(64, 64, seed), "image/png", kind, "pose.png")
            .await
            .expect("ingest")
            .blob
    }

    /// Backdate a blob's last touch by `days`.
    pub async fn age(&self, id: Uuid, days: i64) {
        sqlx::query("UPDATE blobs SET last_touched_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::days(days))
            .bind(id)
            .execute(&*self.db)
            .await
            .expect("age blob");
    }

    /// Reference count straight from the table, tombstones included.
    pub async fn reference_count(&self, id: Uuid) -> i64 {
        sqlx::query_scalar("SELECT reference_count FROM blobs WHERE id = ?")
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .expect("reference count")
    }

    pub async fn row_count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&*self.db)
            .await
            .expect("row count")
    }

    pub fn payload_exists(&self, blob: &StoredBlob) -> bool {
        self.store.path_of(blob).exists()
    }

    pub fn uploads_root(&self) -> &Path {
        &self.store.base_path
    }
}

/// A solid-ish PNG whose bytes depend on `seed`.
pub fn png(width: u32, height: u32, seed: u8) -> Bytes {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([seed, (x % 256) as u8, (y % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).expect("encode png");
    Bytes::from(out.into_inner())
}

/// Count regular files below `root`, recursively.
pub fn file_count(root: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                file_count(&path)
            } else {
                1
            }
        })
        .sum()
}
