use thiserror::Error;

/// Unified error type for Arbor operations.
///
/// Logical conflicts (duplicate timestamps, cycle-inducing moves, moves into
/// tombstoned subtrees) are resolved inside the engine and never surface
/// here; only store, transport and framing failures do.
#[derive(Debug, Error)]
pub enum ArborError {
    /// Underlying SQLite failure. Fatal for the enclosing batch.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// General I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure on the wire.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// An operation timestamp that does not follow the sortable
    /// `{millis}-{client}` encoding.
    #[error("malformed timestamp '{0}'")]
    MalformedTimestamp(String),

    /// A frame that violates the wire protocol. Callers log and drop the
    /// frame; streams are never aborted for this.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Network-level failure (connect, push, pull, socket drop). Retryable:
    /// push payloads are idempotent on `timestamp`.
    #[error("transport error: {0}")]
    Transport(String),

    /// The materialized `nodes` table disagrees with a replay of the log.
    /// Recovery is rebuild-from-log, then discard-and-rehydrate.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Malformed hydration snapshot stream.
    #[error("hydration error: {0}")]
    Hydration(String),
}

/// Result type alias for Arbor operations.
pub type Result<T> = std::result::Result<T, ArborError>;
