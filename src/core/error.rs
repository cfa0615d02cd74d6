//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Queue is full.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// No constructor is registered for the requested work type.
    #[error("unknown work type: {0}")]
    UnknownWorkType(String),
    /// The registered constructor rejected the spec's arguments.
    #[error("cannot construct work `{type_name}`: {reason}")]
    Construct {
        /// Work type that failed to construct.
        type_name: String,
        /// Constructor error rendered as text.
        reason: String,
    },
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
    /// The scheduler or its event bus has shut down.
    #[error("scheduler closed")]
    Closed,
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
