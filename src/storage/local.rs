use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::{fs, io::AsyncWriteExt, task};
use walkdir::WalkDir;

use super::{BlobInfo, BlobStore, StorageBackend, StorageError, StorageResult, validate_key};

/// Filesystem-backed store rooted at the media directory.
///
/// Files are served back by the API under `/media/<key>`. Signed uploads
/// point at the API's own `PUT /api/blobs/<key>` endpoint and carry a keyed
/// BLAKE3 MAC over key, content type and expiry.
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
    signing_key: [u8; 32],
}

impl LocalBlobStore {
    pub async fn new(
        root: impl Into<PathBuf>,
        public_base_url: &str,
        signing_key: [u8; 32],
    ) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|err| {
            StorageError::Config(format!(
                "failed to create storage directory {}: {err}",
                root.display()
            ))
        })?;

        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_key,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key onto a path under the root after validating it.
    pub fn key_to_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn signature(&self, key: &str, content_type: &str, expires: i64) -> blake3::Hash {
        let message = format!("{key}\n{content_type}\n{expires}");
        blake3::keyed_hash(&self.signing_key, message.as_bytes())
    }

    /// Checks a signed upload produced by [`BlobStore::sign_upload`].
    /// `now` is a unix timestamp in seconds.
    pub fn verify_upload(
        &self,
        key: &str,
        content_type: &str,
        expires: i64,
        signature: &str,
        now: i64,
    ) -> StorageResult<()> {
        validate_key(key)?;
        if now > expires {
            return Err(StorageError::Forbidden("upload URL has expired".into()));
        }
        let provided = blake3::Hash::from_hex(signature)
            .map_err(|_| StorageError::Forbidden("malformed signature".into()))?;
        // blake3::Hash equality is constant time.
        if provided != self.signature(key, content_type, expires) {
            return Err(StorageError::Forbidden("signature mismatch".into()));
        }
        Ok(())
    }

    /// Opens a stored blob for streaming.
    pub async fn open(&self, key: &str) -> StorageResult<(fs::File, PathBuf)> {
        let path = self.key_to_path(key)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok((file, path)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Local
    }

    fn bucket(&self) -> &str {
        "local"
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/media/{}", self.public_base_url, key)
    }

    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        let start = Instant::now();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let upload_failed = |err: std::io::Error| StorageError::UploadFailed {
            key: key.to_string(),
            reason: format!("{}: {err}", path.display()),
        };
        let mut file = fs::File::create(&path).await.map_err(upload_failed)?;
        file.write_all(&data).await.map_err(upload_failed)?;
        file.sync_all().await.map_err(upload_failed)?;

        tracing::info!(
            key = %key,
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "stored blob on local disk"
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(key = %key, "deleted local blob");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(key = %key, "local blob already absent");
                Ok(())
            }
            Err(err) => Err(StorageError::DeleteFailed {
                key: key.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<BlobInfo>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        task::spawn_blocking(move || {
            let mut blobs = Vec::new();
            for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(&prefix) {
                    continue;
                }
                let meta = entry.metadata().ok();
                blobs.push(BlobInfo {
                    key,
                    size: meta.as_ref().map(|meta| meta.len()).unwrap_or(0),
                    last_modified: meta
                        .and_then(|meta| meta.modified().ok())
                        .map(DateTime::<Utc>::from),
                });
            }
            blobs.sort_by(|a, b| a.key.cmp(&b.key));
            blobs
        })
        .await
        .map_err(|err| StorageError::Backend(format!("listing task failed: {err}")))
    }

    async fn sign_upload(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageResult<String> {
        validate_key(key)?;
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.signature(key, content_type, expires);
        Ok(format!(
            "{}/api/blobs/{}?contentType={}&expires={}&signature={}",
            self.public_base_url,
            key,
            utf8_percent_encode(content_type, NON_ALPHANUMERIC),
            expires,
            signature.to_hex()
        ))
    }
}
