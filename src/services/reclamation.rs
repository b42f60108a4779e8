//! Daily orphan reclamation.
//!
//! The scheduler is only a trigger: every run, scheduled or on demand, calls
//! [`ContentStore::reclaim_orphans`] with the configured retention window.

use crate::services::content_store::{ContentStore, ReclaimReport, StorageResult};
use chrono::{DateTime, Duration, Utc};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ReclamationPolicy {
    pub enabled: bool,
    /// Zero-reference blobs idle longer than this are reclaimed.
    pub retention: Duration,
    /// UTC hour (0-23) at which the daily sweep fires.
    pub hour: u32,
}

impl Default for ReclamationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: Duration::days(30),
            hour: 2,
        }
    }
}

/// Owns the background sweep task. Built by the composition root and shared
/// with whatever needs to trigger or stop it.
pub struct ReclamationScheduler {
    store: ContentStore,
    policy: ReclamationPolicy,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReclamationScheduler {
    pub fn new(store: ContentStore, policy: ReclamationPolicy) -> Self {
        Self {
            store,
            policy,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &ReclamationPolicy {
        &self.policy
    }

    /// Run a sweep now with the configured retention window.
    pub async fn run_now(&self) -> StorageResult<ReclaimReport> {
        self.run_with_retention(self.policy.retention).await
    }

    /// Run a sweep now with an explicit retention window.
    pub async fn run_with_retention(&self, retention: Duration) -> StorageResult<ReclaimReport> {
        self.store.reclaim_orphans(retention).await
    }

    /// Spawn the daily task. Returns `false` when disabled, already running,
    /// or already shut down.
    pub async fn start(&self) -> bool {
        if !self.policy.enabled {
            info!("reclamation scheduler disabled by configuration");
            return false;
        }
        if self.cancel.is_cancelled() {
            warn!("reclamation scheduler already shut down");
            return false;
        }

        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            warn!("reclamation scheduler already started");
            return false;
        }

        *handle = Some(tokio::spawn(run_daily(
            self.store.clone(),
            self.policy.clone(),
            self.cancel.clone(),
        )));
        info!(
            hour = self.policy.hour,
            retention_days = self.policy.retention.num_days(),
            "reclamation scheduler started"
        );
        true
    }

    /// Stop the daily task and wait for an in-flight sweep to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "reclamation task ended abnormally");
            }
            info!("reclamation scheduler shut down");
        }
    }
}

async fn run_daily(store: ContentStore, policy: ReclamationPolicy, cancel: CancellationToken) {
    loop {
        let now = Utc::now();
        let next = next_run_after(now, policy.hour);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next_run = %next, "next reclamation sweep scheduled");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        match store.reclaim_orphans(policy.retention).await {
            Ok(report) => info!(
                reclaimed = report.reclaimed,
                failed = report.failed,
                "scheduled reclamation completed"
            ),
            Err(err) => error!(error = %err, "scheduled reclamation failed"),
        }
    }
}

/// First `hour:00` UTC strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let Some(today) = now.date_naive().and_hms_opt(hour.min(23), 0, 0) else {
        return now + Duration::days(1);
    };
    let candidate = today.and_utc();
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn later_today_when_hour_not_reached() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 1, 30, 0).unwrap();
        assert_eq!(
            next_run_after(now, 2),
            Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn tomorrow_once_hour_passed() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        assert_eq!(
            next_run_after(now, 2),
            Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn rolls_over_month_end() {
        let now = Utc.with_ymd_and_hms(2026, 2, 28, 23, 0, 0).unwrap();
        assert_eq!(
            next_run_after(now, 0),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
        );
    }
}
