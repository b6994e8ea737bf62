//! Metadata persistence layer.
//!
//! All records live in one JSON document (`{"videos": [...]}`) that is
//! rewritten in full on every mutation. [`MetadataStore`] owns the in-memory
//! copy behind a mutex so each load-mutate-save cycle is atomic; callers only
//! ever receive clones.
//!
//! The store is synchronous on purpose. Async code reaches it through
//! `tokio::task::spawn_blocking`, so a slow disk never stalls the runtime.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const DEFAULT_CHANNEL: &str = "Your Channel";

/// One uploaded video and its derived thumbnail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Blob store key of the video file. Older documents call it `fileKey`.
    #[serde(alias = "fileKey")]
    pub video_key: String,
    /// Blob store key of the thumbnail image. Empty for records whose
    /// thumbnail lives outside the store.
    #[serde(default)]
    pub thumbnail_key: String,
    pub public_url: String,
    pub thumbnail_url: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub views: u64,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub mime_type: String,
    /// Set when the thumbnail is the generated placeholder rather than a frame.
    #[serde(default)]
    pub thumbnail_placeholder: bool,
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    videos: &'a [VideoRecord],
}

/// The setup script seeds the file with a bare `[]`, later writes use the
/// wrapped form. Both are accepted.
#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Wrapped { videos: Vec<VideoRecord> },
    Bare(Vec<VideoRecord>),
}

/// Reads the document at `path`.
///
/// A missing or unreadable document is treated as an empty store; the
/// problem is logged and never returned.
pub fn load(path: &Path) -> Vec<VideoRecord> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no metadata document yet, starting empty");
        return Vec::new();
    }
    match load_strict(path) {
        Ok(videos) => videos,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "metadata document is not usable, starting empty");
            Vec::new()
        }
    }
}

/// Like [`load`], but a missing or invalid document is an error. Used by
/// callers that must not mistake a bad path for an empty library.
pub fn load_strict(path: &Path) -> Result<Vec<VideoRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading metadata document {}", path.display()))?;
    let mut videos = match serde_json::from_str::<Document>(&raw)
        .with_context(|| format!("parsing metadata document {}", path.display()))?
    {
        Document::Wrapped { videos } | Document::Bare(videos) => videos,
    };
    for video in &mut videos {
        if video.mime_type.is_empty() {
            video.mime_type = mime_guess::from_path(&video.video_key)
                .first_raw()
                .unwrap_or("video/mp4")
                .to_string();
        }
    }
    Ok(videos)
}

/// Rewrites the whole document. The new content goes to a temp file in the
/// same directory which is then renamed over `path`, so readers never see a
/// half-written file.
pub fn save(path: &Path, videos: &[VideoRecord]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating metadata directory {}", dir.display()))?;

    let body = serde_json::to_vec_pretty(&DocumentRef { videos }).context("serializing videos")?;
    let mut tmp = NamedTempFile::new_in(&dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(&body).context("writing metadata")?;
    tmp.as_file().sync_all().context("syncing metadata")?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Why [`MetadataStore::insert`] refused a record.
#[derive(Debug, Error)]
pub enum InsertError {
    #[error("video id {0} already exists")]
    DuplicateId(String),

    #[error("{0} is already registered")]
    DuplicateKey(String),

    #[error("storage quota exceeded: {needed} bytes needed, {remaining} remaining")]
    QuotaExceeded { needed: u64, remaining: u64 },

    #[error(transparent)]
    Save(#[from] anyhow::Error),
}

/// Lock-guarded owner of the metadata document.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    videos: Mutex<Vec<VideoRecord>>,
}

impl MetadataStore {
    /// Loads the current document (or starts empty) from `path`.
    ///
    /// A document that exists but cannot be parsed is copied aside to
    /// `<path>.unreadable` before the store starts empty, so the first write
    /// does not destroy it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let videos = if path.exists() {
            match load_strict(&path) {
                Ok(videos) => videos,
                Err(err) => {
                    let aside = unreadable_copy_path(&path);
                    match fs::copy(&path, &aside) {
                        Ok(_) => tracing::warn!(
                            path = %path.display(),
                            copy = %aside.display(),
                            error = %format!("{err:#}"),
                            "metadata document is not usable, kept a copy and starting empty"
                        ),
                        Err(copy_err) => tracing::error!(
                            path = %path.display(),
                            error = %format!("{err:#}"),
                            copy_error = %copy_err,
                            "metadata document is not usable and could not be copied aside"
                        ),
                    }
                    Vec::new()
                }
            }
        } else {
            load(&path)
        };
        tracing::info!(path = %path.display(), count = videos.len(), "loaded videos from metadata document");
        Self {
            path,
            videos: Mutex::new(videos),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.videos.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.lock().is_empty()
    }

    /// A copy of every record in storage order.
    pub fn snapshot(&self) -> Vec<VideoRecord> {
        self.videos.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<VideoRecord> {
        self.videos.lock().iter().find(|video| video.id == id).cloned()
    }

    /// Sum of `fileSize` over every record.
    pub fn used_bytes(&self) -> u64 {
        self.videos.lock().iter().map(|video| video.file_size).sum()
    }

    /// Appends `record` and persists. Ids and video keys must be unique.
    pub fn insert(&self, record: VideoRecord) -> Result<(), InsertError> {
        self.insert_within(record, None)
    }

    /// [`insert`](Self::insert) that also refuses the record when the summed
    /// `fileSize` would exceed `quota`. Every check runs under the lock.
    pub fn insert_within(&self, record: VideoRecord, quota: Option<u64>) -> Result<(), InsertError> {
        self.commit(|videos| {
            if videos.iter().any(|video| video.id == record.id) {
                return Err(InsertError::DuplicateId(record.id));
            }
            if videos.iter().any(|video| video.video_key == record.video_key) {
                return Err(InsertError::DuplicateKey(record.video_key));
            }
            if let Some(quota) = quota {
                let used: u64 = videos.iter().map(|video| video.file_size).sum();
                let remaining = quota.saturating_sub(used);
                if record.file_size > remaining {
                    return Err(InsertError::QuotaExceeded {
                        needed: record.file_size,
                        remaining,
                    });
                }
            }
            videos.push(record);
            Ok(Some(()))
        })
        .map(|_| ())
    }

    /// Applies `mutate` to the record with `id` and persists.
    /// Returns the updated record, or `None` when the id is unknown (in which
    /// case nothing is written).
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Option<VideoRecord>>
    where
        F: FnOnce(&mut VideoRecord),
    {
        self.commit(|videos| {
            Ok(videos.iter_mut().find(|video| video.id == id).map(|video| {
                mutate(video);
                video.clone()
            }))
        })
    }

    /// Removes the record with `id` and persists. `None` when unknown.
    pub fn remove(&self, id: &str) -> Result<Option<VideoRecord>> {
        self.commit(|videos| {
            Ok(videos
                .iter()
                .position(|video| video.id == id)
                .map(|index| videos.remove(index)))
        })
    }

    /// Runs `mutate` on a copy, saves the copy, and only then publishes it.
    /// A failed save leaves the in-memory state untouched. `Ok(None)` from
    /// the closure means nothing changed and skips the write.
    fn commit<T, E, F>(&self, mutate: F) -> Result<Option<T>, E>
    where
        E: From<anyhow::Error>,
        F: FnOnce(&mut Vec<VideoRecord>) -> Result<Option<T>, E>,
    {
        let mut guard = self.videos.lock();
        let mut next = guard.clone();
        let Some(outcome) = mutate(&mut next)? else {
            return Ok(None);
        };
        save(&self.path, &next)?;
        *guard = next;
        Ok(Some(outcome))
    }
}

fn unreadable_copy_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".unreadable");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn record(id: &str) -> VideoRecord {
        VideoRecord {
            id: id.to_string(),
            title: format!("title {id}"),
            description: String::new(),
            video_key: format!("videos/{id}.mp4"),
            thumbnail_key: format!("thumbnails/{id}.png"),
            public_url: format!("http://localhost/media/videos/{id}.mp4"),
            thumbnail_url: format!("http://localhost/media/thumbnails/{id}.png"),
            channel: DEFAULT_CHANNEL.to_string(),
            views: 0,
            uploaded_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            file_size: 10,
            mime_type: "video/mp4".into(),
            thumbnail_placeholder: true,
        }
    }

    #[test]
    fn load_missing_document_is_empty() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("videos-db.json")).is_empty());
    }

    #[test]
    fn load_corrupt_document_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("videos-db.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load(&path).is_empty());
    }

    #[test]
    fn load_accepts_bare_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("videos.json");
        fs::write(&path, "[]").unwrap();
        assert!(load(&path).is_empty());

        let rec = record("a");
        fs::write(&path, serde_json::to_string(&vec![rec.clone()]).unwrap()).unwrap();
        assert_eq!(load(&path), vec![rec]);
    }

    #[test]
    fn save_writes_wrapped_camel_case_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/videos-db.json");
        save(&path, &[record("a")]).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let first = &value["videos"][0];
        assert_eq!(first["id"], "a");
        assert_eq!(first["uploadedAt"], "2024-01-01T00:00:00Z");
        assert_eq!(first["thumbnailUrl"], "http://localhost/media/thumbnails/a.png");
        assert_eq!(first["mimeType"], "video/mp4");
        assert_eq!(load(&path), vec![record("a")]);
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("videos-db.json");
        let store = MetadataStore::open(&path);
        store.insert(record("a")).unwrap();
        store.insert(record("b")).unwrap();
        drop(store);

        let reopened = MetadataStore::open(&path);
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("b").unwrap().title, "title b");
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("db.json"));
        store.insert(record("a")).unwrap();
        assert!(store.insert(record("a")).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn insert_rejects_duplicate_video_keys() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("db.json"));
        store.insert(record("a")).unwrap();
        let mut twin = record("b");
        twin.video_key = record("a").video_key;
        assert!(matches!(store.insert(twin), Err(InsertError::DuplicateKey(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn insert_within_enforces_quota() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("db.json"));
        store.insert_within(record("a"), Some(15)).unwrap();
        assert!(matches!(
            store.insert_within(record("b"), Some(15)),
            Err(InsertError::QuotaExceeded { needed: 10, remaining: 5 })
        ));
        assert_eq!(store.used_bytes(), 10);
        store.insert_within(record("b"), Some(20)).unwrap();
    }

    #[test]
    fn load_strict_reports_missing_and_truncated_documents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        assert!(load_strict(&path).is_err());
        fs::write(&path, r#"{"videos": ["#).unwrap();
        assert!(load_strict(&path).is_err());
        assert!(load(&path).is_empty());
    }

    #[test]
    fn loads_records_from_older_documents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("videos.json");
        let legacy = r#"{"videos": [{
            "id": "video_1700000000000_abc123def",
            "title": "Old upload",
            "description": "",
            "fileKey": "videos/1700000000000-clip.webm",
            "publicUrl": "https://storage.googleapis.com/demo/videos/1700000000000-clip.webm",
            "uploadedAt": "2023-11-14T22:13:20.000Z",
            "thumbnailUrl": "https://via.placeholder.com/320x180/1a1a1a/ffffff?text=Old",
            "channel": "Your Channel",
            "type": "video",
            "views": 7,
            "duration": "00:00",
            "fileSize": 1234
        }]}"#;
        fs::write(&path, legacy).unwrap();

        let videos = load_strict(&path).unwrap();
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].video_key, "videos/1700000000000-clip.webm");
        assert_eq!(videos[0].thumbnail_key, "");
        assert_eq!(videos[0].mime_type, "video/webm");
        assert_eq!(videos[0].views, 7);
    }

    #[test]
    fn unreadable_document_is_kept_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, "{ truncated").unwrap();

        let store = MetadataStore::open(&path);
        assert!(store.is_empty());
        store.insert(record("a")).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("db.json.unreadable")).unwrap(),
            "{ truncated"
        );
    }

    #[test]
    fn update_unknown_id_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        let store = MetadataStore::open(&path);
        assert!(store.update("missing", |video| video.views += 1).unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn update_and_remove_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        let store = MetadataStore::open(&path);
        store.insert(record("a")).unwrap();

        let updated = store.update("a", |video| video.views += 3).unwrap().unwrap();
        assert_eq!(updated.views, 3);
        assert_eq!(load(&path)[0].views, 3);

        let removed = store.remove("a").unwrap().unwrap();
        assert_eq!(removed.id, "a");
        assert!(store.is_empty());
        assert!(load(&path).is_empty());
        assert!(store.remove("a").unwrap().is_none());
    }

    #[test]
    fn failed_save_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        // A directory at the document path makes the final rename fail.
        let path = dir.path().join("db.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        let store = MetadataStore::open(&path);
        assert!(store.insert(record("a")).is_err());
        assert!(store.is_empty());
    }
}
