//! Blob storage abstraction.
//!
//! Videos and thumbnails live in a key-addressed object store. Keys look like
//! `videos/<id>.mp4` or `thumbnails/<id>.jpg`; they must not contain `..`,
//! backslashes, or a leading `/`, so every backend can map them onto a path.
//!
//! The backend is picked once at startup from [`Settings`]; the services only
//! ever see an `Arc<dyn BlobStore>`.

mod bucket;
mod local;

use std::{fmt, future::Future, str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use thiserror::Error;

use crate::config::Settings;

pub use bucket::{BucketBlobStore, BucketFlavor};
pub use local::LocalBlobStore;

pub const VIDEOS_PREFIX: &str = "videos/";
pub const THUMBNAILS_PREFIX: &str = "thumbnails/";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload of {key} failed: {reason}")]
    UploadFailed { key: String, reason: String },

    #[error("delete of {key} failed: {reason}")]
    DeleteFailed { key: String, reason: String },

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("signed upload rejected: {0}")]
    Forbidden(String),

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("operation not supported by the {0} backend")]
    Unsupported(StorageBackend),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    Gcs,
    Firebase,
}

impl StorageBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageBackend::Local => "local",
            StorageBackend::Gcs => "gcs",
            StorageBackend::Firebase => "firebase",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "disk" => Ok(StorageBackend::Local),
            "gcs" | "google" => Ok(StorageBackend::Gcs),
            "firebase" => Ok(StorageBackend::Firebase),
            other => anyhow::bail!("unknown storage backend {other:?} (expected local, gcs or firebase)"),
        }
    }
}

/// One stored object as reported by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Key-addressed object storage used for videos and thumbnails.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn backend(&self) -> StorageBackend;

    /// Bucket name reported to clients; `"local"` for the filesystem store.
    fn bucket(&self) -> &str;

    /// URL a browser can use to fetch `key`.
    fn public_url(&self, key: &str) -> String;

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()>;

    /// Removes `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<BlobInfo>>;

    /// Issues a time-limited URL the client can `PUT` the object to directly.
    async fn sign_upload(
        &self,
        _key: &str,
        _content_type: &str,
        _ttl: Duration,
    ) -> StorageResult<String> {
        Err(StorageError::Unsupported(self.backend()))
    }
}

/// Rejects keys that could escape a backend's root.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Runs `op` with an upper bound; elapsed time maps to [`StorageError::Timeout`].
pub async fn bounded<T, F>(operation: &'static str, after: Duration, op: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(after, op).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout { operation, after }),
    }
}

/// The configured store plus, for the filesystem backend, the concrete handle
/// the HTTP layer needs to serve files and accept signed uploads.
#[derive(Clone)]
pub struct SelectedStore {
    pub store: Arc<dyn BlobStore>,
    pub local: Option<Arc<LocalBlobStore>>,
}

pub async fn create_blob_store(settings: &Settings) -> Result<SelectedStore> {
    match settings.storage_backend {
        StorageBackend::Local => {
            let secret = settings.upload_signing_secret.unwrap_or_else(|| {
                let mut secret = [0u8; 32];
                OsRng.fill_bytes(&mut secret);
                secret
            });
            let local = Arc::new(
                LocalBlobStore::new(&settings.media_root, &settings.public_base_url, secret)
                    .await
                    .with_context(|| {
                        format!("preparing media root {}", settings.media_root.display())
                    })?,
            );
            Ok(SelectedStore {
                store: local.clone(),
                local: Some(local),
            })
        }
        backend @ (StorageBackend::Gcs | StorageBackend::Firebase) => {
            let bucket = settings
                .bucket_name
                .as_deref()
                .context("BUCKET_NAME must be set for bucket storage")?;
            let flavor = if backend == StorageBackend::Firebase {
                BucketFlavor::Firebase
            } else {
                BucketFlavor::Gcs
            };
            let store = BucketBlobStore::new(
                bucket,
                flavor,
                settings.gcs_service_account_path.as_deref(),
                settings.gcs_service_account_key.as_deref(),
            )
            .with_context(|| format!("connecting to bucket {bucket}"))?;
            Ok(SelectedStore {
                store: Arc::new(store),
                local: None,
            })
        }
    }
}
