//! Crate-wide error type.
//!
//! Errors are classified by cause rather than by origin module, so callers
//! (the scheduler, the HTTP layer, the CLI) can react uniformly: the
//! scheduler logs and keeps running, the HTTP layer maps [`Error::kind`] to
//! a status code, the CLI exits non-zero.

use thiserror::Error;

/// Shared `Result` alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for merkle-watch.
#[derive(Debug, Error)]
pub enum Error {
    /// Filesystem or network failure (backend unreachable, unreadable file).
    /// Cache failures are never surfaced as errors; they degrade to misses.
    #[error("I/O failure: {0}")]
    Io(String),

    /// Malformed input: bad configuration, a tree with no root, an invalid
    /// scan interval.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// A lookup that found nothing where something was required: a proof
    /// target absent from the leaves, a root hash unknown to the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// No input items: an empty data-block list, a directory with no files.
    #[error("no input items: {0}")]
    Empty(String),

    /// A single-flight operation was already running.
    #[error("operation already in progress: {0}")]
    Busy(&'static str),

    /// An unrecoverable condition; triggers graceful shutdown.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Stable machine-readable kind, used in HTTP error bodies and the
    /// last-build record.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Invalid(_) => "invalid",
            Self::NotFound(_) => "not_found",
            Self::Empty(_) => "empty",
            Self::Busy(_) => "busy",
            Self::Fatal(_) => "fatal",
        }
    }

    /// HTTP status the operator API answers with for this error.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Invalid(_) => 400,
            Self::NotFound(_) => 404,
            Self::Busy(_) => 409,
            Self::Empty(_) => 422,
            Self::Io(_) | Self::Fatal(_) => 500,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Io(format!("sql backend: {e}"))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Io(format!("cache: {e}"))
    }
}

impl From<s3::error::S3Error> for Error {
    fn from(e: s3::error::S3Error) -> Self {
        Self::Io(format!("object store: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Invalid(format!("json: {e}"))
    }
}
