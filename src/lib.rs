//! Avatar generation service with a deduplicating, reference-counted store
//! for uploaded reference images.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
