use std::{path::Path, time::Duration, time::Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http::Method;
use object_store::{
    Attribute, Attributes, ObjectStore, PutOptions, PutPayload,
    gcp::{GoogleCloudStorage, GoogleCloudStorageBuilder},
    path::Path as ObjectPath,
    signer::Signer,
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

use super::{BlobInfo, BlobStore, StorageBackend, StorageError, StorageResult, validate_key};

/// How public URLs are shaped for a Google-hosted bucket. Firebase Storage
/// buckets are plain GCS buckets behind a different download endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketFlavor {
    Gcs,
    Firebase,
}

pub struct BucketBlobStore {
    inner: GoogleCloudStorage,
    bucket: String,
    flavor: BucketFlavor,
}

impl BucketBlobStore {
    /// Builds a client from the ambient Google environment, then applies the
    /// explicit bucket and credentials when given.
    pub fn new(
        bucket: &str,
        flavor: BucketFlavor,
        service_account_path: Option<&Path>,
        service_account_key: Option<&str>,
    ) -> StorageResult<Self> {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = service_account_path {
            builder = builder.with_service_account_path(path.to_string_lossy());
        }
        if let Some(key) = service_account_key {
            builder = builder.with_service_account_key(key);
        }
        let inner = builder
            .build()
            .map_err(|err| StorageError::Config(format!("failed to build GCS client: {err}")))?;

        tracing::info!(bucket = %bucket, flavor = ?flavor, "bucket storage initialized");
        Ok(Self {
            inner,
            bucket: bucket.to_string(),
            flavor,
        })
    }

    fn object_path(key: &str) -> StorageResult<ObjectPath> {
        validate_key(key)?;
        ObjectPath::parse(key).map_err(|err| StorageError::InvalidKey(format!("{key}: {err}")))
    }
}

/// Public download URL for `key` in `bucket`.
pub(crate) fn bucket_public_url(flavor: BucketFlavor, bucket: &str, key: &str) -> String {
    match flavor {
        BucketFlavor::Gcs => format!("https://storage.googleapis.com/{bucket}/{key}"),
        BucketFlavor::Firebase => format!(
            "https://firebasestorage.googleapis.com/v0/b/{bucket}/o/{}?alt=media",
            utf8_percent_encode(key, NON_ALPHANUMERIC)
        ),
    }
}

#[async_trait]
impl BlobStore for BucketBlobStore {
    fn backend(&self) -> StorageBackend {
        match self.flavor {
            BucketFlavor::Gcs => StorageBackend::Gcs,
            BucketFlavor::Firebase => StorageBackend::Firebase,
        }
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn public_url(&self, key: &str) -> String {
        bucket_public_url(self.flavor, &self.bucket, key)
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        let path = Self::object_path(key)?;
        let size = data.len();
        let start = Instant::now();

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        self.inner
            .put_opts(&path, PutPayload::from(data), options)
            .await
            .map_err(|err| {
                tracing::error!(key = %key, error = %err, "bucket upload failed");
                StorageError::UploadFailed {
                    key: key.to_string(),
                    reason: err.to_string(),
                }
            })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_millis() as u64,
            "stored blob in bucket"
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = Self::object_path(key)?;
        match self.inner.delete(&path).await {
            Ok(()) => {
                tracing::info!(bucket = %self.bucket, key = %key, "deleted bucket blob");
                Ok(())
            }
            Err(object_store::Error::NotFound { .. }) => {
                tracing::debug!(key = %key, "bucket blob already absent");
                Ok(())
            }
            Err(err) => Err(StorageError::DeleteFailed {
                key: key.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = Self::object_path(key)?;
        match self.inner.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(StorageError::Backend(err.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<BlobInfo>> {
        let prefix = ObjectPath::from(prefix.trim_end_matches('/'));
        self.inner
            .list(Some(&prefix))
            .map_ok(|meta| BlobInfo {
                key: meta.location.to_string(),
                size: meta.size as u64,
                last_modified: Some(meta.last_modified),
            })
            .try_collect::<Vec<_>>()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))
    }

    async fn sign_upload(
        &self,
        key: &str,
        _content_type: &str,
        ttl: Duration,
    ) -> StorageResult<String> {
        let path = Self::object_path(key)?;
        let url = self
            .inner
            .signed_url(Method::PUT, &path, ttl)
            .await
            .map_err(|err| StorageError::Backend(format!("failed to sign upload URL: {err}")))?;
        Ok(url.to_string())
    }
}
