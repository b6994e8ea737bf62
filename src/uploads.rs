//! Upload lifecycle: validate, store the video, derive a thumbnail, commit the
//! metadata record.
//!
//! Blob and extractor calls run without touching the metadata lock, so
//! uploads proceed in parallel and only the final commit is serialized.
//! Blobs are not rolled back when the metadata save fails; they stay behind
//! and the `reconcile` binary reports them. A record refused at commit
//! (duplicate key, quota) has the blobs written for it removed.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task;
use uuid::Uuid;

use crate::{
    config::Settings,
    error::{AppError, AppResult},
    metadata::{DEFAULT_CHANNEL, InsertError, MetadataStore, VideoRecord},
    storage::{BlobStore, THUMBNAILS_PREFIX, VIDEOS_PREFIX, bounded, validate_key},
    thumbnail::{FrameExtractor, Thumbnail, ThumbnailError, placeholder_thumbnail},
};

/// Accepted upload types: mp4, webm, quicktime and the two spellings of avi.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "video/x-msvideo",
    "video/avi",
];

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_upload_bytes: u64,
    pub blob_timeout: Duration,
    pub thumbnail_timeout: Duration,
    pub upload_url_ttl: Duration,
    /// Cap on the summed size of every stored video.
    pub storage_quota: Option<u64>,
}

impl From<&Settings> for UploadLimits {
    fn from(settings: &Settings) -> Self {
        Self {
            max_upload_bytes: settings.max_upload_bytes,
            blob_timeout: settings.blob_timeout,
            thumbnail_timeout: settings.thumbnail_timeout,
            upload_url_ttl: settings.upload_url_ttl,
            storage_quota: settings.storage_quota,
        }
    }
}

/// A video received in full by the server.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub data: Bytes,
    pub file_name: Option<String>,
    pub mime_type: String,
    pub title: String,
    pub description: Option<String>,
}

/// First phase of a direct-to-store upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUploadTicket {
    pub upload_url: String,
    pub file_key: String,
    pub bucket: String,
    pub expires_in: String,
}

/// Second phase of a direct-to-store upload, sent once the client finished
/// writing to the signed URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUpload {
    #[serde(default)]
    pub file_key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_type: Option<String>,
}

pub struct UploadManager {
    metadata: Arc<MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    extractor: Arc<dyn FrameExtractor>,
    limits: UploadLimits,
    placeholder: Thumbnail,
}

impl UploadManager {
    pub fn new(
        metadata: Arc<MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        extractor: Arc<dyn FrameExtractor>,
        limits: UploadLimits,
    ) -> Result<Self, ThumbnailError> {
        Ok(Self {
            metadata,
            blobs,
            extractor,
            limits,
            placeholder: placeholder_thumbnail()?,
        })
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// Stores an upload received by the server and records it.
    pub async fn submit_upload(&self, request: UploadRequest) -> AppResult<VideoRecord> {
        let title = validate_title(&request.title)?;
        if request.data.is_empty() {
            return Err(AppError::validation("a video file is required"));
        }
        let mime_type = normalize_mime(&request.mime_type);
        ensure_allowed_mime(&mime_type)?;
        let size = request.data.len() as u64;
        if size > self.limits.max_upload_bytes {
            return Err(AppError::TooLarge {
                size,
                limit: self.limits.max_upload_bytes,
            });
        }
        self.ensure_quota(size)?;

        let id = new_video_id();
        let extension = video_extension(request.file_name.as_deref(), &mime_type);
        let video_key = format!("{VIDEOS_PREFIX}{id}.{extension}");

        bounded(
            "video upload",
            self.limits.blob_timeout,
            self.blobs.put(&video_key, request.data.clone(), &mime_type),
        )
        .await?;

        let (thumbnail, placeholder) = self.derive_thumbnail(&id, &request.data).await;
        let thumbnail_key = format!("{THUMBNAILS_PREFIX}{id}.{}", thumbnail.extension);
        if let Err(err) = self.store_thumbnail(&thumbnail_key, &thumbnail).await {
            self.discard_blob(&video_key).await;
            return Err(err);
        }

        let record = VideoRecord {
            public_url: self.blobs.public_url(&video_key),
            thumbnail_url: self.blobs.public_url(&thumbnail_key),
            id,
            title,
            description: clean_description(request.description.as_deref()),
            video_key,
            thumbnail_key,
            channel: DEFAULT_CHANNEL.to_string(),
            views: 0,
            uploaded_at: Utc::now(),
            file_size: size,
            mime_type,
            thumbnail_placeholder: placeholder,
        };
        let written = [record.video_key.clone(), record.thumbnail_key.clone()];
        self.commit(record, &written).await
    }

    /// Issues a signed URL the client can upload to directly. No state is
    /// kept; an abandoned ticket simply expires.
    pub async fn begin_upload(
        &self,
        file_name: &str,
        file_type: &str,
    ) -> AppResult<SignedUploadTicket> {
        if file_name.trim().is_empty() || file_type.trim().is_empty() {
            return Err(AppError::validation("fileName and fileType are required"));
        }
        let mime_type = normalize_mime(file_type);
        ensure_allowed_mime(&mime_type)?;

        let file_key = format!(
            "{VIDEOS_PREFIX}{}-{}",
            Utc::now().timestamp_millis(),
            sanitize_file_name(file_name)
        );
        let ttl = self.limits.upload_url_ttl;
        let upload_url = bounded(
            "upload URL signing",
            self.limits.blob_timeout,
            self.blobs.sign_upload(&file_key, &mime_type, ttl),
        )
        .await?;

        tracing::info!(file_key = %file_key, ttl_secs = ttl.as_secs(), "issued signed upload URL");
        Ok(SignedUploadTicket {
            upload_url,
            file_key,
            bucket: self.blobs.bucket().to_string(),
            expires_in: format_ttl(ttl),
        })
    }

    /// Records a video the client wrote straight to the store. The server
    /// never sees the bytes, so the thumbnail is always the placeholder.
    pub async fn complete_upload(&self, request: CompleteUpload) -> AppResult<VideoRecord> {
        let title = validate_title(&request.title)?;
        let video_key = request.file_key.trim().to_string();
        if !video_key.starts_with(VIDEOS_PREFIX) || validate_key(&video_key).is_err() {
            return Err(AppError::validation(
                "fileKey must reference an uploaded video",
            ));
        }
        let mime_type = match request.file_type.as_deref() {
            Some(declared) if !declared.trim().is_empty() => normalize_mime(declared),
            _ => mime_guess::from_path(&video_key)
                .first_raw()
                .unwrap_or("video/mp4")
                .to_string(),
        };
        ensure_allowed_mime(&mime_type)?;
        let file_size = request.file_size.unwrap_or(0);
        if file_size > self.limits.max_upload_bytes {
            return Err(AppError::TooLarge {
                size: file_size,
                limit: self.limits.max_upload_bytes,
            });
        }
        self.ensure_quota(file_size)?;
        // Cheap early rejection; the insert re-checks under the lock.
        if self
            .metadata
            .snapshot()
            .iter()
            .any(|video| video.video_key == video_key)
        {
            return Err(AppError::validation(format!(
                "{video_key} is already registered"
            )));
        }

        let present = bounded(
            "upload existence check",
            self.limits.blob_timeout,
            self.blobs.exists(&video_key),
        )
        .await?;
        if !present {
            return Err(AppError::validation(format!(
                "no uploaded file found at {video_key}"
            )));
        }

        let id = new_video_id();
        let thumbnail = self.placeholder.clone();
        let thumbnail_key = format!("{THUMBNAILS_PREFIX}{id}.{}", thumbnail.extension);
        self.store_thumbnail(&thumbnail_key, &thumbnail).await?;

        let record = VideoRecord {
            public_url: self.blobs.public_url(&video_key),
            thumbnail_url: self.blobs.public_url(&thumbnail_key),
            id,
            title,
            description: clean_description(request.description.as_deref()),
            video_key,
            thumbnail_key,
            channel: DEFAULT_CHANNEL.to_string(),
            views: 0,
            uploaded_at: Utc::now(),
            file_size,
            mime_type,
            thumbnail_placeholder: true,
        };
        // The video blob belongs to the client's upload; only the thumbnail
        // is ours to remove if the record is refused.
        let written = [record.thumbnail_key.clone()];
        self.commit(record, &written).await
    }

    /// Extracts a frame, falling back to the placeholder on any failure.
    /// The flag is true when the placeholder was used.
    async fn derive_thumbnail(&self, id: &str, video: &Bytes) -> (Thumbnail, bool) {
        let attempt =
            tokio::time::timeout(self.limits.thumbnail_timeout, self.extractor.extract_frame(video))
                .await;
        match attempt {
            Ok(Ok(thumbnail)) => (thumbnail, false),
            Ok(Err(err)) => {
                tracing::warn!(video_id = %id, error = %err, "thumbnail extraction failed, using placeholder");
                (self.placeholder.clone(), true)
            }
            Err(_) => {
                tracing::warn!(
                    video_id = %id,
                    timeout_secs = self.limits.thumbnail_timeout.as_secs(),
                    "thumbnail extraction timed out, using placeholder"
                );
                (self.placeholder.clone(), true)
            }
        }
    }

    async fn store_thumbnail(&self, key: &str, thumbnail: &Thumbnail) -> AppResult<()> {
        bounded(
            "thumbnail upload",
            self.limits.blob_timeout,
            self.blobs
                .put(key, thumbnail.data.clone(), thumbnail.content_type),
        )
        .await?;
        Ok(())
    }

    async fn discard_blob(&self, key: &str) {
        let outcome = bounded("blob cleanup", self.limits.blob_timeout, self.blobs.delete(key)).await;
        if let Err(err) = outcome {
            tracing::warn!(key = %key, error = %err, "failed to remove blob of aborted upload");
        }
    }

    /// Early quota check so a doomed upload writes nothing. The binding
    /// check happens again under the metadata lock at commit.
    fn ensure_quota(&self, size: u64) -> AppResult<()> {
        let Some(quota) = self.limits.storage_quota else {
            return Ok(());
        };
        let remaining = quota.saturating_sub(self.metadata.used_bytes());
        if size > remaining {
            return Err(AppError::QuotaExceeded {
                needed: size,
                remaining,
            });
        }
        Ok(())
    }

    /// Inserts `record` under the metadata lock. When the record is refused
    /// (duplicate key, quota) the blobs in `written` are removed again; when
    /// only the save fails they are left for reconciliation.
    async fn commit(&self, record: VideoRecord, written: &[String]) -> AppResult<VideoRecord> {
        let metadata = self.metadata.clone();
        let stored = record.clone();
        let quota = self.limits.storage_quota;
        let outcome = task::spawn_blocking(move || metadata.insert_within(stored, quota))
            .await
            .map_err(AppError::join)?;

        let err = match outcome {
            Ok(()) => {
                tracing::info!(video_id = %record.id, title = %record.title, "video saved");
                return Ok(record);
            }
            Err(InsertError::Save(err)) => {
                tracing::error!(
                    video_id = %record.id,
                    video_key = %record.video_key,
                    error = %format!("{err:#}"),
                    "metadata commit failed, blobs left in place"
                );
                return Err(AppError::persistence(err));
            }
            Err(InsertError::DuplicateKey(key)) => {
                AppError::validation(format!("{key} is already registered"))
            }
            Err(InsertError::QuotaExceeded { needed, remaining }) => {
                AppError::QuotaExceeded { needed, remaining }
            }
            Err(err @ InsertError::DuplicateId(_)) => AppError::Internal(err.to_string()),
        };

        tracing::warn!(video_id = %record.id, error = %err, "record refused, removing its blobs");
        for key in written {
            self.discard_blob(key).await;
        }
        Err(err)
    }
}

pub fn new_video_id() -> String {
    format!("video_{}", Uuid::new_v4().simple())
}

/// Strips MIME parameters and lowercases (`Video/MP4; codecs=x` -> `video/mp4`).
pub fn normalize_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

pub fn is_allowed_mime(mime_type: &str) -> bool {
    ALLOWED_MIME_TYPES.contains(&normalize_mime(mime_type).as_str())
}

fn ensure_allowed_mime(mime_type: &str) -> AppResult<()> {
    if is_allowed_mime(mime_type) {
        return Ok(());
    }
    Err(AppError::validation(format!(
        "unsupported video type {mime_type:?}; allowed: {}",
        ALLOWED_MIME_TYPES.join(", ")
    )))
}

fn validate_title(title: &str) -> AppResult<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(AppError::validation("title is required"));
    }
    Ok(title.to_string())
}

fn clean_description(description: Option<&str>) -> String {
    description.map(str::trim).unwrap_or_default().to_string()
}

/// Keeps ASCII letters, digits and dots; everything else becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

/// Extension for the stored video: the original one when it is a known video
/// extension, otherwise derived from the MIME type.
fn video_extension(file_name: Option<&str>, mime_type: &str) -> String {
    const KNOWN: &[&str] = &["mp4", "m4v", "webm", "mov", "qt", "avi"];
    if let Some(ext) = file_name
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| KNOWN.contains(&ext.as_str()))
    {
        return ext;
    }
    match mime_type {
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-msvideo" | "video/avi" => "avi",
        _ => "mp4",
    }
    .to_string()
}

fn format_ttl(ttl: Duration) -> String {
    let secs = ttl.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
