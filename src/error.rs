use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
///
/// A cache miss is never an error: lookups return `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The source path no longer resolves to a regular file.
    #[error("source not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Filesystem failure (unreadable metadata, disk full, permission denied, ...).
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The operation was cancelled by the caller. Distinct from failure.
    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("transcription service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("segmentation failed: {0}")]
    Segmentation(String),

    /// A persisted cache entry failed validation.
    #[error("corrupt cache entry: {0}")]
    CorruptEntry(String),

    #[error("unsupported book index schema version {found} (expected {expected})")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error represents cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            return Self::Cancelled;
        }
        Self::msg(format!("background task panicked: {err}"))
    }
}
