//! Error taxonomy shared by the upload and query services.

use crate::storage::StorageError;

/// Failures surfaced to callers of the upload and view services.
///
/// Thumbnail extraction failures never show up here; they are recovered
/// inside the upload manager by substituting the placeholder image.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Bad input (missing title, missing file, disallowed type, bad key).
    #[error("{0}")]
    Validation(String),

    /// Uploaded file exceeds the configured size limit.
    #[error("file is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// Accepting the upload would exceed the configured storage quota.
    #[error("storage quota exceeded: {needed} bytes needed, {remaining} remaining")]
    QuotaExceeded { needed: u64, remaining: u64 },

    /// Blob store put/sign/exists failure on a write path.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The metadata document could not be rewritten.
    #[error("failed to persist metadata: {0}")]
    Persistence(String),

    #[error("{0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }

    pub(crate) fn join(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task join error: {err}"))
    }
}

pub type AppResult<T> = Result<T, AppError>;
