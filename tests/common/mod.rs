#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use newtube_hosting::{
    metadata::MetadataStore,
    storage::{BlobInfo, BlobStore, StorageBackend, StorageError, StorageResult},
    thumbnail::{FrameExtractor, Thumbnail, ThumbnailError},
    uploads::{UploadLimits, UploadManager},
    videos::VideoService,
};
use parking_lot::Mutex;
use tempfile::TempDir;

/// In-memory store with switches to make individual operations fail.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, (Bytes, String)>>,
    pub fail_puts: AtomicBool,
    pub fail_thumbnail_puts: AtomicBool,
    pub fail_deletes: AtomicBool,
    pub puts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().keys().cloned().collect()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.blobs.lock().get(key).map(|(_, ct)| ct.clone())
    }

    pub fn insert(&self, key: &str, data: &'static [u8]) {
        self.blobs
            .lock()
            .insert(key.to_string(), (Bytes::from_static(data), "video/mp4".into()));
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Gcs
    }

    fn bucket(&self) -> &str {
        "test-bucket"
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://blobs.test/{key}")
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let thumbnail = key.starts_with("thumbnails/");
        if self.fail_puts.load(Ordering::SeqCst)
            || (thumbnail && self.fail_thumbnail_puts.load(Ordering::SeqCst))
        {
            return Err(StorageError::UploadFailed {
                key: key.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.blobs
            .lock()
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::DeleteFailed {
                key: key.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.blobs.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.blobs.lock().contains_key(key))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<BlobInfo>> {
        Ok(self
            .blobs
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (data, _))| BlobInfo {
                key: key.clone(),
                size: data.len() as u64,
                last_modified: Some(Utc::now()),
            })
            .collect())
    }

    async fn sign_upload(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageResult<String> {
        Ok(format!(
            "https://blobs.test/{key}?ct={content_type}&ttl={}",
            ttl.as_secs()
        ))
    }
}

/// Returns a fixed JPEG-ish payload.
pub struct FixedExtractor;

#[async_trait]
impl FrameExtractor for FixedExtractor {
    async fn extract_frame(&self, _video: &[u8]) -> Result<Thumbnail, ThumbnailError> {
        Ok(Thumbnail {
            data: Bytes::from_static(b"\xff\xd8frame"),
            content_type: "image/jpeg",
            extension: "jpg",
        })
    }
}

pub struct FailingExtractor;

#[async_trait]
impl FrameExtractor for FailingExtractor {
    async fn extract_frame(&self, _video: &[u8]) -> Result<Thumbnail, ThumbnailError> {
        Err(ThumbnailError::Failed("moov atom not found".into()))
    }
}

pub struct SlowExtractor;

#[async_trait]
impl FrameExtractor for SlowExtractor {
    async fn extract_frame(&self, _video: &[u8]) -> Result<Thumbnail, ThumbnailError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(ThumbnailError::Empty)
    }
}

pub fn limits() -> UploadLimits {
    UploadLimits {
        max_upload_bytes: 1024,
        blob_timeout: Duration::from_secs(5),
        thumbnail_timeout: Duration::from_millis(200),
        upload_url_ttl: Duration::from_secs(900),
        storage_quota: Some(4096),
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub metadata: Arc<MetadataStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub uploads: UploadManager,
    pub videos: VideoService,
}

pub fn harness(extractor: Arc<dyn FrameExtractor>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(MetadataStore::open(dir.path().join("videos-db.json")));
    let blobs = Arc::new(MemoryBlobStore::default());
    let limits = limits();
    let uploads =
        UploadManager::new(metadata.clone(), blobs.clone(), extractor, limits.clone()).unwrap();
    let videos = VideoService::new(
        metadata.clone(),
        blobs.clone(),
        limits.blob_timeout,
        limits.max_upload_bytes,
        limits.storage_quota,
        true,
    );
    Harness {
        dir,
        metadata,
        blobs,
        uploads,
        videos,
    }
}
