//! Read, view-count and delete operations over the stored videos.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::task;

use crate::{
    error::{AppError, AppResult},
    metadata::{MetadataStore, VideoRecord},
    storage::{BlobStore, StorageError, bounded},
    uploads::ALLOWED_MIME_TYPES,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub message: String,
    pub videos_count: usize,
}

/// Usage and limits, as reported by `GET /api/storage-info`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSummary {
    pub backend: String,
    pub bucket: String,
    pub videos_count: usize,
    pub total_bytes: u64,
    pub max_file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_bytes: Option<u64>,
    pub allowed_mime_types: Vec<&'static str>,
    pub signed_uploads: bool,
}

pub struct VideoService {
    metadata: Arc<MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    blob_timeout: Duration,
    max_upload_bytes: u64,
    storage_quota: Option<u64>,
    signed_uploads: bool,
}

impl VideoService {
    pub fn new(
        metadata: Arc<MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        blob_timeout: Duration,
        max_upload_bytes: u64,
        storage_quota: Option<u64>,
        signed_uploads: bool,
    ) -> Self {
        Self {
            metadata,
            blobs,
            blob_timeout,
            max_upload_bytes,
            storage_quota,
            signed_uploads,
        }
    }

    /// Every record, newest first.
    pub fn list_all(&self) -> Vec<VideoRecord> {
        let mut videos = self.metadata.snapshot();
        videos.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        videos
    }

    /// Fetches one record and counts the fetch as a view.
    pub async fn get_by_id(&self, id: &str) -> AppResult<VideoRecord> {
        let metadata = self.metadata.clone();
        let lookup = id.to_string();
        let updated = task::spawn_blocking(move || {
            metadata.update(&lookup, |video| video.views = video.views.saturating_add(1))
        })
        .await
        .map_err(AppError::join)?
        .map_err(AppError::persistence)?;

        match updated {
            Some(video) => {
                tracing::debug!(video_id = %video.id, views = video.views, "view recorded");
                Ok(video)
            }
            None => Err(AppError::not_found("Video not found")),
        }
    }

    /// Removes the record, then its blobs. Blob failures are logged only; the
    /// record is gone either way.
    pub async fn delete_by_id(&self, id: &str) -> AppResult<VideoRecord> {
        let metadata = self.metadata.clone();
        let lookup = id.to_string();
        let removed = task::spawn_blocking(move || metadata.remove(&lookup))
            .await
            .map_err(AppError::join)?
            .map_err(AppError::persistence)?
            .ok_or_else(|| AppError::not_found("Video not found"))?;

        for key in [&removed.video_key, &removed.thumbnail_key] {
            if key.is_empty() {
                continue;
            }
            if let Err(err) = self.delete_blob(key).await {
                tracing::warn!(
                    video_id = %removed.id,
                    key = %key,
                    error = %err,
                    "blob delete failed, leaving it for reconciliation"
                );
            }
        }

        tracing::info!(video_id = %removed.id, title = %removed.title, "video deleted");
        Ok(removed)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "OK",
            message: format!("Video hosting server is running ({} storage)", self.blobs.backend()),
            videos_count: self.metadata.len(),
        }
    }

    /// Usage figures come from the metadata, not from listing the store.
    pub fn storage_summary(&self) -> StorageSummary {
        let videos = self.metadata.snapshot();
        let total_bytes = videos.iter().map(|video| video.file_size).sum::<u64>();
        StorageSummary {
            backend: self.blobs.backend().to_string(),
            bucket: self.blobs.bucket().to_string(),
            videos_count: videos.len(),
            total_bytes,
            max_file_size: self.max_upload_bytes,
            quota_bytes: self.storage_quota,
            remaining_bytes: self
                .storage_quota
                .map(|quota| quota.saturating_sub(total_bytes)),
            allowed_mime_types: ALLOWED_MIME_TYPES.to_vec(),
            signed_uploads: self.signed_uploads,
        }
    }

    async fn delete_blob(&self, key: &str) -> Result<(), StorageError> {
        bounded("blob delete", self.blob_timeout, self.blobs.delete(key)).await
    }
}
