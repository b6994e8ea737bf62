//! Runtime configuration.
//!
//! Settings come from an env-style file (`KEY="value"` per line, `#` comments)
//! and are then overridden by process environment variables of the same name.
//! Everything is optional; [`Settings::resolve`] fills in defaults and
//! rejects combinations that cannot work (a bucket backend without a bucket).

use anyhow::{Context, Result, anyhow, bail};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::storage::StorageBackend;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/newtube-hosting-env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_MEDIA_ROOT: &str = "./uploads";
pub const DB_FILE_NAME: &str = "videos-db.json";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_UPLOAD_URL_TTL_SECS: u64 = 15 * 60;
pub const DEFAULT_BLOB_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_THUMBNAIL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";

/// Every key understood in the config file and the environment.
const KNOWN_KEYS: &[&str] = &[
    "HOST",
    "PORT",
    "DATA_DIR",
    "DB_FILE",
    "MEDIA_ROOT",
    "PUBLIC_BASE_URL",
    "STORAGE_BACKEND",
    "BUCKET_NAME",
    "GCS_SERVICE_ACCOUNT_PATH",
    "GCS_SERVICE_ACCOUNT_KEY",
    "MAX_FILE_SIZE",
    "STORAGE_QUOTA",
    "UPLOAD_URL_TTL_SECS",
    "BLOB_TIMEOUT_SECS",
    "THUMBNAIL_TIMEOUT_SECS",
    "FFMPEG_PATH",
    "UPLOAD_SIGNING_SECRET",
];

/// Raw, unvalidated values as they appear in the file or environment.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub db_file: Option<PathBuf>,
    pub media_root: Option<PathBuf>,
    pub public_base_url: Option<String>,
    pub storage_backend: Option<StorageBackend>,
    pub bucket_name: Option<String>,
    pub gcs_service_account_path: Option<PathBuf>,
    pub gcs_service_account_key: Option<String>,
    pub max_file_size: Option<u64>,
    pub storage_quota: Option<u64>,
    pub upload_url_ttl_secs: Option<u64>,
    pub blob_timeout_secs: Option<u64>,
    pub thumbnail_timeout_secs: Option<u64>,
    pub ffmpeg_path: Option<PathBuf>,
    pub upload_signing_secret: Option<[u8; 32]>,
}

impl EnvConfig {
    /// Applies one `KEY=value` pair. Empty values are ignored so a blank line
    /// in the file never clobbers a default. Unknown keys are skipped.
    pub fn apply(&mut self, key: &str, value: &str, origin: &str) -> Result<()> {
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            return Ok(());
        }
        match key {
            "HOST" => self.host = Some(value.to_string()),
            "PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing PORT from {origin}"))?;
                self.port = Some(port);
            }
            "DATA_DIR" => self.data_dir = Some(PathBuf::from(value)),
            "DB_FILE" => self.db_file = Some(PathBuf::from(value)),
            "MEDIA_ROOT" => self.media_root = Some(PathBuf::from(value)),
            "PUBLIC_BASE_URL" => self.public_base_url = Some(value.to_string()),
            "STORAGE_BACKEND" => {
                let backend = value
                    .parse()
                    .with_context(|| format!("Parsing STORAGE_BACKEND from {origin}"))?;
                self.storage_backend = Some(backend);
            }
            "BUCKET_NAME" => self.bucket_name = Some(value.to_string()),
            "GCS_SERVICE_ACCOUNT_PATH" => {
                self.gcs_service_account_path = Some(PathBuf::from(value))
            }
            // Keys pasted from a JSON secret often carry literal "\n".
            "GCS_SERVICE_ACCOUNT_KEY" => {
                self.gcs_service_account_key = Some(value.replace("\\n", "\n"))
            }
            "MAX_FILE_SIZE" => {
                let size = parse_size(value)
                    .with_context(|| format!("Parsing MAX_FILE_SIZE from {origin}"))?;
                self.max_file_size = Some(size);
            }
            "STORAGE_QUOTA" => {
                let size = parse_size(value)
                    .with_context(|| format!("Parsing STORAGE_QUOTA from {origin}"))?;
                self.storage_quota = Some(size);
            }
            "UPLOAD_URL_TTL_SECS" => {
                self.upload_url_ttl_secs = Some(parse_secs(value, key, origin)?)
            }
            "BLOB_TIMEOUT_SECS" => self.blob_timeout_secs = Some(parse_secs(value, key, origin)?),
            "THUMBNAIL_TIMEOUT_SECS" => {
                self.thumbnail_timeout_secs = Some(parse_secs(value, key, origin)?)
            }
            "FFMPEG_PATH" => self.ffmpeg_path = Some(PathBuf::from(value)),
            "UPLOAD_SIGNING_SECRET" => {
                let hash = blake3::Hash::from_hex(value).map_err(|err| {
                    anyhow!("UPLOAD_SIGNING_SECRET in {origin} must be 64 hex characters: {err}")
                })?;
                self.upload_signing_secret = Some(*hash.as_bytes());
            }
            _ => {}
        }
        Ok(())
    }

    /// Overrides file values with whatever `lookup` returns for known keys.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in KNOWN_KEYS {
            if let Some(value) = lookup(key) {
                self.apply(key, &value, "environment")?;
            }
        }
        Ok(self)
    }
}

/// Fully resolved settings used by the binaries.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub media_root: PathBuf,
    pub public_base_url: String,
    pub storage_backend: StorageBackend,
    pub bucket_name: Option<String>,
    pub gcs_service_account_path: Option<PathBuf>,
    pub gcs_service_account_key: Option<String>,
    pub max_upload_bytes: u64,
    pub storage_quota: Option<u64>,
    pub upload_url_ttl: Duration,
    pub blob_timeout: Duration,
    pub thumbnail_timeout: Duration,
    pub ffmpeg_path: PathBuf,
    pub upload_signing_secret: Option<[u8; 32]>,
}

impl Settings {
    pub fn resolve(cfg: EnvConfig) -> Result<Self> {
        let host = cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = cfg.port.unwrap_or(DEFAULT_PORT);
        let db_path = match cfg.db_file {
            Some(path) => path,
            None => cfg
                .data_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
                .join(DB_FILE_NAME),
        };
        let storage_backend = cfg.storage_backend.unwrap_or(StorageBackend::Local);
        if storage_backend != StorageBackend::Local && cfg.bucket_name.is_none() {
            bail!("BUCKET_NAME is required for the {storage_backend} storage backend");
        }
        let public_base_url = cfg
            .public_base_url
            .unwrap_or_else(|| format!("http://{host}:{port}"));

        Ok(Self {
            host,
            port,
            db_path,
            media_root: cfg
                .media_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT)),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            storage_backend,
            bucket_name: cfg.bucket_name,
            gcs_service_account_path: cfg.gcs_service_account_path,
            gcs_service_account_key: cfg.gcs_service_account_key,
            max_upload_bytes: cfg.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE),
            storage_quota: cfg.storage_quota,
            upload_url_ttl: Duration::from_secs(
                cfg.upload_url_ttl_secs
                    .unwrap_or(DEFAULT_UPLOAD_URL_TTL_SECS),
            ),
            blob_timeout: Duration::from_secs(
                cfg.blob_timeout_secs.unwrap_or(DEFAULT_BLOB_TIMEOUT_SECS),
            ),
            thumbnail_timeout: Duration::from_secs(
                cfg.thumbnail_timeout_secs
                    .unwrap_or(DEFAULT_THUMBNAIL_TIMEOUT_SECS),
            ),
            ffmpeg_path: cfg
                .ffmpeg_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_PATH)),
            upload_signing_secret: cfg.upload_signing_secret,
        })
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let origin = path.display().to_string();
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        if let Some((key, value)) = trimmed.split_once('=') {
            cfg.apply(key.trim(), value, &origin)?;
        }
    }
    Ok(Some(cfg))
}

/// Reads `path` when it exists (a missing file is fine), then lets the
/// process environment override it.
pub fn load_env_config(path: impl AsRef<Path>) -> Result<EnvConfig> {
    read_env_config(path.as_ref())?
        .unwrap_or_default()
        .overlay(|key| std::env::var(key).ok())
}

pub fn load_settings_from(path: impl AsRef<Path>) -> Result<Settings> {
    Settings::resolve(load_env_config(path)?)
}

/// Parses sizes such as `100MB`, `5 GB`, `512k` or a bare byte count.
/// Units are binary (1KB = 1024 bytes).
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .with_context(|| format!("invalid size {value:?}"))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        other => bail!("unknown size unit {other:?} in {value:?}"),
    };
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("size {value:?} overflows"))
}

fn parse_secs(value: &str, key: &str, origin: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("Parsing {key} from {origin}"))
}
