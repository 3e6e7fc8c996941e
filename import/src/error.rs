use thiserror::Error;

use crate::fetcher::FetchError;

/// Errors that end an import job.
///
/// Per-record parse and transform failures are not here: the
/// orchestrator counts and skips those.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid import configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Writer, manifest or object-store failure.
    #[error(transparent)]
    Store(#[from] graphlake_chunkstore::error::Error),

    /// The durable checkpoint store is unavailable. Always loud: silently
    /// dropping progress would make resume lie.
    #[error("checkpoint store failure: {0}")]
    Checkpoint(String),

    /// A checkpointed state blob does not deserialize.
    #[error("invalid state blob: {0}")]
    State(#[from] serde_json::Error),

    #[error("source stream failed: {0}")]
    Io(#[from] std::io::Error),

    /// Programmer error, e.g. running a job that already completed.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
