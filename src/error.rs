use std::fs;
use std::path::PathBuf;

/// Errors surfaced by any pipeline component.
///
/// Variants map one-to-one onto the documented error kinds; a handful of
/// leaf-level conditions (`Io`, `Internal`, `InvalidInput`) are not named
/// kinds but are needed by real code paths that have to report something.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),

    #[error("no native watcher usable for root {0}")]
    PlatformWatcherUnavailable(PathBuf),

    #[error("watcher event queue overflowed for root {0}")]
    WatcherQueueOverflow(PathBuf),

    #[error("failed to probe attributes for {0}: {1}")]
    FilterProbeFailure(PathBuf, String),

    #[error("content parser failed for {0}: {1}")]
    ParserFailure(PathBuf, String),

    #[error("content parser timed out for {0}")]
    ParserTimeout(PathBuf),

    #[error("sink reported a retryable failure: {0}")]
    SinkRetryable(String),

    #[error("sink reported a fatal failure: {0}")]
    SinkFatal(String),

    #[error("checkpoint at {0} is corrupt: {1}")]
    CheckpointCorrupt(PathBuf, String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WatchError>;

/// Canonicalizes a path, returning the original if canonicalization fails.
///
/// Used at ingestion boundaries where a best-effort canonical form is
/// preferable to rejecting the event outright.
pub fn canonicalize_existing_path(path: PathBuf) -> PathBuf {
    fs::canonicalize(&path).unwrap_or(path)
}
