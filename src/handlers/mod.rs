pub mod admin_handlers;
pub mod file_handlers;
pub mod generation_handlers;
pub mod health_handlers;
