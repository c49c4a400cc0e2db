//! Core types shared across the crate.
//!
//! - **IDs**: `RequestId` for labelling guarded calls
//! - **Errors**: backend `Failure`s and the crate `Error`, with thiserror derives
//! - **Config**: file and environment configuration

mod config;
mod errors;
mod ids;

pub use config::{
    Config, ObservabilityConfig, ENV_MAX_QUEUE_SIZE, ENV_MAX_REQUESTS, ENV_RETRY_PRESET,
    ENV_WINDOW_MS,
};
pub use errors::{
    Error, Failure, FailureCategory, NetworkErrorKind, Result, RATE_LIMIT_STATUS,
};
pub use ids::RequestId;
