//! Core data models for the avatar store.
//!
//! These entities map to the `blobs` and `jobs` tables via `sqlx::FromRow`
//! and serialize as JSON via `serde`.

pub mod blob;
pub mod job;
