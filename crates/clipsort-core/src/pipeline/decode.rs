//! Source reading, format-sniffing decode, and JPEG re-encoding for upload.

use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};

use crate::config::RemoteConfig;
use crate::error::{PipelineError, PipelineResult};

/// How an image is shrunk and compressed before it is sent to a remote model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub resize_enabled: bool,
    pub max_edge: u32,
    pub jpeg_quality: u8,
}

impl From<&RemoteConfig> for UploadOptions {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            resize_enabled: config.resize_enabled,
            max_edge: config.max_edge,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

/// Source formats the `image` crate cannot always decode on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    Heic,
    Dng,
}

impl RawFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "heic" | "heif" => Some(Self::Heic),
            "dng" => Some(Self::Dng),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heic => "HEIC",
            Self::Dng => "DNG",
        }
    }

    /// Whether sources in this format can be read here at all. DNG files
    /// that are plain TIFF decode anywhere; HEIC needs `sips`.
    pub fn readable_here(self) -> bool {
        match self {
            Self::Heic => cfg!(target_os = "macos"),
            Self::Dng => true,
        }
    }
}

/// Read a source file. Failures are per-item `Io` errors.
///
/// HEIC and undecodable DNG sources come back as JPEG bytes.
pub async fn read_source(path: &Path) -> PipelineResult<Vec<u8>> {
    let bytes = tokio::fs::read(path).await.map_err(|e| PipelineError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let Some(format) = RawFormat::from_path(path) else {
        return Ok(bytes);
    };

    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || normalize_raw(format, bytes, &owned))
        .await
        .map_err(|e| PipelineError::Io {
            path: path.to_path_buf(),
            message: format!("convert task failed: {e}"),
        })?
}

/// Keep `bytes` if the `image` crate reads them, else convert via the system.
///
/// Blocking.
pub fn normalize_raw(format: RawFormat, bytes: Vec<u8>, path: &Path) -> PipelineResult<Vec<u8>> {
    if image::load_from_memory(&bytes).is_ok() {
        return Ok(bytes);
    }
    tracing::debug!(path = %path.display(), format = format.as_str(), "Converting to JPEG");
    convert_to_jpeg(format, path)
}

#[cfg(target_os = "macos")]
fn convert_to_jpeg(format: RawFormat, path: &Path) -> PipelineResult<Vec<u8>> {
    let io_err = |message: String| PipelineError::Io {
        path: path.to_path_buf(),
        message,
    };
    let scratch = tempfile::Builder::new()
        .prefix("clipsort-")
        .suffix(".jpg")
        .tempfile()
        .map_err(|e| io_err(format!("scratch file: {e}")))?;

    let output = std::process::Command::new("sips")
        .args(["-s", "format", "jpeg"])
        .arg(path)
        .arg("--out")
        .arg(scratch.path())
        .output()
        .map_err(|e| io_err(format!("cannot run sips: {e}")))?;
    if !output.status.success() {
        return Err(PipelineError::InvalidImage {
            path: path.to_path_buf(),
            message: format!(
                "sips could not convert {}: {}",
                format.as_str(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    std::fs::read(scratch.path()).map_err(|e| io_err(format!("read converted image: {e}")))
}

#[cfg(not(target_os = "macos"))]
fn convert_to_jpeg(format: RawFormat, path: &Path) -> PipelineResult<Vec<u8>> {
    Err(PipelineError::UnsupportedFormat {
        path: path.to_path_buf(),
        format: format.as_str(),
    })
}

/// Decode bytes, detecting the format from content rather than the extension.
pub fn decode_bytes_sync(bytes: &[u8], path: &Path) -> PipelineResult<DynamicImage> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::InvalidImage {
            path: path.to_path_buf(),
            message: format!("Cannot detect image format: {e}"),
        })?;
    if reader.format().is_none() {
        return Err(PipelineError::InvalidImage {
            path: path.to_path_buf(),
            message: "Unrecognized image format".to_string(),
        });
    }
    let image = reader.decode().map_err(|e| PipelineError::InvalidImage {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidImage {
            path: path.to_path_buf(),
            message: "image has zero width or height".to_string(),
        });
    }
    Ok(image)
}

/// Target size that fits the long edge within `max_edge`, keeping aspect.
fn fitted_size(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let long_edge = width.max(height);
    if max_edge == 0 || long_edge <= max_edge {
        return (width, height);
    }
    let scale = max_edge as f32 / long_edge as f32;
    let w = ((width as f32) * scale).round().max(1.0) as u32;
    let h = ((height as f32) * scale).round().max(1.0) as u32;
    (w, h)
}

/// Decode, optionally downscale, and re-encode as RGB JPEG.
///
/// Blocking: call from `spawn_blocking`.
pub fn encode_for_upload(
    bytes: &[u8],
    path: &Path,
    options: UploadOptions,
) -> PipelineResult<Vec<u8>> {
    let rgb = decode_bytes_sync(bytes, path)?.to_rgb8();
    let (width, height) = rgb.dimensions();

    let rgb = if options.resize_enabled {
        let (w, h) = fitted_size(width, height, options.max_edge);
        if (w, h) != (width, height) {
            image::imageops::resize(&rgb, w, h, FilterType::Triangle)
        } else {
            rgb
        }
    } else {
        rgb
    };

    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, options.jpeg_quality.clamp(1, 100));
    rgb.write_with_encoder(encoder)
        .map_err(|e| PipelineError::InvalidImage {
            path: path.to_path_buf(),
            message: format!("JPEG encode failed: {e}"),
        })?;

    tracing::trace!(
        path = %path.display(),
        from = ?(width, height),
        to = ?rgb.dimensions(),
        bytes = buf.len(),
        "Prepared upload image"
    );
    Ok(buf)
}
