pub mod backend;
pub mod content_store;
pub mod digest;
pub mod job_store;
pub mod reclamation;
pub mod workflow;
