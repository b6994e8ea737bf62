//! Finds blobs that no metadata record points at.
//!
//! These show up when a metadata commit fails after the blobs were written,
//! when a best-effort delete fails, or when a signed upload is never
//! completed.

use std::{collections::HashSet, path::Path};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    metadata::{self, VideoRecord},
    storage::{BlobInfo, BlobStore, StorageResult, THUMBNAILS_PREFIX, VIDEOS_PREFIX},
};

/// Records to reconcile against. Unlike the server, a missing or unreadable
/// document is an error here: treating it as empty would mark every blob as
/// an orphan.
pub fn load_records(path: &Path) -> Result<Vec<VideoRecord>> {
    metadata::load_strict(path).context("refusing to reconcile without a readable metadata document")
}

/// `now` minus `min_age_mins`, failing instead of overflowing.
pub fn cutoff_before(now: DateTime<Utc>, min_age_mins: u64) -> Result<DateTime<Utc>> {
    let age = i64::try_from(min_age_mins)
        .ok()
        .and_then(TimeDelta::try_minutes)
        .with_context(|| format!("--min-age-mins {min_age_mins} is out of range"))?;
    now.checked_sub_signed(age)
        .with_context(|| format!("--min-age-mins {min_age_mins} is out of range"))
}

/// Lists `videos/` and `thumbnails/` and returns the unreferenced blobs.
///
/// Blobs modified after `cutoff` are skipped so uploads still in flight are
/// not reported. Blobs without a modification time are always considered.
pub async fn find_orphans(
    store: &dyn BlobStore,
    records: &[VideoRecord],
    cutoff: DateTime<Utc>,
) -> StorageResult<Vec<BlobInfo>> {
    let referenced: HashSet<&str> = records
        .iter()
        .flat_map(|video| [video.video_key.as_str(), video.thumbnail_key.as_str()])
        .collect();

    let mut orphans = Vec::new();
    for prefix in [VIDEOS_PREFIX, THUMBNAILS_PREFIX] {
        for blob in store.list(prefix).await? {
            if referenced.contains(blob.key.as_str()) {
                continue;
            }
            if blob.last_modified.is_some_and(|modified| modified > cutoff) {
                tracing::debug!(key = %blob.key, "skipping recent blob");
                continue;
            }
            orphans.push(blob);
        }
    }
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metadata::DEFAULT_CHANNEL, storage::LocalBlobStore};
    use bytes::Bytes;
    use chrono::Duration;
    use std::fs;
    use tempfile::tempdir;

    fn record(id: &str) -> VideoRecord {
        VideoRecord {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            video_key: format!("videos/{id}.mp4"),
            thumbnail_key: format!("thumbnails/{id}.png"),
            public_url: String::new(),
            thumbnail_url: String::new(),
            channel: DEFAULT_CHANNEL.to_string(),
            views: 0,
            uploaded_at: Utc::now(),
            file_size: 1,
            mime_type: "video/mp4".into(),
            thumbnail_placeholder: true,
        }
    }

    #[tokio::test]
    async fn reports_only_unreferenced_blobs() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), "http://localhost", [1u8; 32])
            .await
            .unwrap();
        for key in [
            "videos/kept.mp4",
            "thumbnails/kept.png",
            "videos/lost.mp4",
            "thumbnails/lost.png",
        ] {
            store.put(key, Bytes::from_static(b"x"), "application/octet-stream").await.unwrap();
        }

        let future = Utc::now() + Duration::hours(1);
        let orphans = find_orphans(&store, &[record("kept")], future).await.unwrap();
        let keys: Vec<_> = orphans.iter().map(|blob| blob.key.as_str()).collect();
        assert_eq!(keys, ["videos/lost.mp4", "thumbnails/lost.png"]);

        let past = Utc::now() - Duration::hours(1);
        assert!(find_orphans(&store, &[record("kept")], past).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_document_stops_the_sweep() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("media"), "http://localhost", [1u8; 32])
            .await
            .unwrap();
        store.put("videos/live.mp4", Bytes::from_static(b"x"), "video/mp4").await.unwrap();
        store.put("thumbnails/live.png", Bytes::from_static(b"x"), "image/png").await.unwrap();

        let db = dir.path().join("videos-db.json");
        assert!(load_records(&db).is_err());

        fs::write(&db, r#"{"videos": ["#).unwrap();
        assert!(load_records(&db).is_err());

        metadata::save(&db, &[record("live")]).unwrap();
        let records = load_records(&db).unwrap();
        let future = Utc::now() + Duration::hours(1);
        assert!(find_orphans(&store, &records, future).await.unwrap().is_empty());
    }

    #[test]
    fn cutoff_rejects_out_of_range_ages() {
        let now = Utc::now();
        assert_eq!(cutoff_before(now, 60).unwrap(), now - Duration::minutes(60));
        assert_eq!(cutoff_before(now, 0).unwrap(), now);
        assert!(cutoff_before(now, u64::MAX).is_err());
        assert!(cutoff_before(now, i64::MAX as u64).is_err());
    }
}
