use thiserror::Error;

/// Canonical FLQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`FlqError::NotFound`]: lookup of a task id the registry has no entry for
/// - [`FlqError::InvalidArgument`]: caller-side contract violations detected synchronously
/// - [`FlqError::Execution`]: runtime coordination failures after arguments validated
/// - [`FlqError::Io`]: raw filesystem/network IO failures from std APIs
///
/// Failures reported by the execution engine for a running fragment are NOT
/// surfaced through this enum: they are captured into the owning task's error
/// field and transition the task to Failed, so that subsequent status polls
/// retrieve them.
#[derive(Debug, Error)]
pub enum FlqError {
    /// Operation referenced a task id with no registry entry.
    ///
    /// Examples:
    /// - status/info poll for a task never created on this worker
    /// - poll for a task already removed by the cleanup sweep
    #[error("task not found: {0}")]
    NotFound(String),

    /// Invalid arguments detected before any state was touched.
    ///
    /// Examples:
    /// - negative buffer token
    /// - empty base path for spill directory construction
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Runtime coordination failures after validation succeeded.
    ///
    /// Examples:
    /// - execution engine rejected a fragment start
    /// - update payload decode failures
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard FLQ result alias.
pub type Result<T> = std::result::Result<T, FlqError>;
