//! Thumbnail extraction.
//!
//! Extractors only report success or failure. Deciding what to do on failure
//! (substituting [`placeholder_thumbnail`]) is the upload manager's job.

use std::{io::Cursor, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::Command;

pub const THUMBNAIL_WIDTH: u32 = 320;
pub const THUMBNAIL_HEIGHT: u32 = 180;
const PLACEHOLDER_COLOR: Rgb<u8> = Rgb([0x1a, 0x1a, 0x1a]);

/// An encoded still image ready for the blob store.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub data: Bytes,
    pub content_type: &'static str,
    pub extension: &'static str,
}

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("failed to stage video for extraction: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} could not be started: {reason}")]
    Spawn { program: String, reason: String },

    #[error("frame extraction failed: {0}")]
    Failed(String),

    #[error("extractor produced an empty image")]
    Empty,

    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),
}

#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract_frame(&self, video: &[u8]) -> Result<Thumbnail, ThumbnailError>;
}

/// Runs `ffmpeg` against a temp copy of the upload and grabs one JPEG frame,
/// first at one second in, then at zero for clips shorter than that.
pub struct FfmpegExtractor {
    program: PathBuf,
}

impl FfmpegExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn grab_at(
        &self,
        seek: &str,
        input: &std::path::Path,
        output: &std::path::Path,
    ) -> Result<Vec<u8>, ThumbnailError> {
        let scale = format!(
            "scale={THUMBNAIL_WIDTH}:{THUMBNAIL_HEIGHT}:force_original_aspect_ratio=decrease"
        );
        let result = Command::new(&self.program)
            .arg("-y")
            .args(["-ss", seek])
            .arg("-i")
            .arg(input)
            .args(["-vframes", "1", "-vf", &scale, "-q:v", "2", "-f", "image2"])
            .arg(output)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ThumbnailError::Spawn {
                program: self.program.display().to_string(),
                reason: err.to_string(),
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail = stderr.lines().last().unwrap_or("no output").to_string();
            return Err(ThumbnailError::Failed(tail));
        }
        Ok(tokio::fs::read(output).await.unwrap_or_default())
    }
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    async fn extract_frame(&self, video: &[u8]) -> Result<Thumbnail, ThumbnailError> {
        let input = NamedTempFile::new()?;
        tokio::fs::write(input.path(), video).await?;
        let output = NamedTempFile::with_suffix(".jpg")?;

        let data = match self.grab_at("1", input.path(), output.path()).await {
            Ok(data) if !data.is_empty() => data,
            Ok(_) | Err(ThumbnailError::Failed(_)) => {
                self.grab_at("0", input.path(), output.path()).await?
            }
            Err(err) => return Err(err),
        };
        if data.is_empty() {
            return Err(ThumbnailError::Empty);
        }

        Ok(Thumbnail {
            data: Bytes::from(data),
            content_type: "image/jpeg",
            extension: "jpg",
        })
    }
}

/// Solid dark PNG used whenever a real frame is unavailable.
pub fn placeholder_thumbnail() -> Result<Thumbnail, ThumbnailError> {
    let image = RgbImage::from_pixel(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT, PLACEHOLDER_COLOR);
    let mut encoded = Cursor::new(Vec::new());
    image.write_to(&mut encoded, ImageFormat::Png)?;
    Ok(Thumbnail {
        data: Bytes::from(encoded.into_inner()),
        content_type: "image/png",
        extension: "png",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_a_fixed_size_png() {
        let thumb = placeholder_thumbnail().unwrap();
        assert_eq!(thumb.content_type, "image/png");
        let decoded = image::load_from_memory_with_format(&thumb.data, ImageFormat::Png).unwrap();
        assert_eq!(decoded.width(), THUMBNAIL_WIDTH);
        assert_eq!(decoded.height(), THUMBNAIL_HEIGHT);
        assert_eq!(decoded.to_rgb8().get_pixel(10, 10), &PLACEHOLDER_COLOR);
    }

    #[tokio::test]
    async fn missing_binary_is_reported_not_panicked() {
        let extractor = FfmpegExtractor::new("/nonexistent/ffmpeg-binary");
        let err = extractor.extract_frame(b"not a video").await.unwrap_err();
        assert!(matches!(err, ThumbnailError::Spawn { .. }));
    }
}
