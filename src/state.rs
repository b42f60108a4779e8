use crate::services::{
    content_store::ContentStore, job_store::JobStore, reclamation::ReclamationScheduler,
};
use std::sync::Arc;

/// Shared handler state. Every service is constructed once by the
/// composition root; nothing here is global.
#[derive(Clone)]
pub struct AppState {
    pub store: ContentStore,
    pub jobs: JobStore,
    pub scheduler: Arc<ReclamationScheduler>,
}

impl AppState {
    pub fn new(store: ContentStore, jobs: JobStore, scheduler: Arc<ReclamationScheduler>) -> Self {
        Self {
            store,
            jobs,
            scheduler,
        }
    }
}
