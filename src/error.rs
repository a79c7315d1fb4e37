//! Top-level error types for the gateway.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Infra(#[from] InfraError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors. Missing required keys are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: std::sync::Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Malformed-envelope errors. Always non-fatal: the offending event is dropped.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("unsafe path segment: {0:?}")]
    UnsafeSegment(String),

    #[error("session key {key} exceeds max sessions {max} for group {group_id}")]
    SessionKeyOutOfRange {
        key: u32,
        max: u32,
        group_id: String,
    },

    #[error("empty bot id")]
    EmptyBotId,

    #[error("empty user id")]
    EmptyUserId,
}

/// Transient infrastructure failures (KV store, queue, adapter I/O). Logged and retried
/// on the next tick or next event; never surfaced to chat.
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("key-value store operation failed: {0}")]
    Kv(String),

    #[error("adapter send failed on {platform}: {0}", platform = .platform)]
    AdapterSend { platform: String, source: String },

    #[error("session queue enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("filesystem operation failed: {0}")]
    Filesystem(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Dispatch-pipeline failures that are neither validation nor infra errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("permission denied for command {command}")]
    PermissionDenied { command: String },

    #[error("malformed management command: {0}")]
    MalformedCommand(String),

    #[error("session resolution failed: {0}")]
    SessionResolutionFailed(String),
}
