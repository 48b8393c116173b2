pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod identity;
pub mod model_router;
pub mod relay;
pub mod transcription;
pub mod usage_log;
pub mod validate;
