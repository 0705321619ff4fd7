//! Image preprocessing for CLIP inference.
//!
//! CLIP ViT-B/32 expects:
//! - Input size: 224×224 pixels
//! - Normalization: per-channel (pixel/255 - mean) / std with the OpenAI CLIP constants
//! - Channel order: RGB
//! - Tensor layout: NCHW [batch, channels, height, width]

use std::path::Path;

use image::DynamicImage;
use ndarray::Array4;

use crate::error::{PipelineError, PipelineResult};

/// Number of color channels (RGB).
const CHANNELS: usize = 3;

/// CLIP normalization mean (per-channel).
const NORM_MEAN: [f32; CHANNELS] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// CLIP normalization std (per-channel).
const NORM_STD: [f32; CHANNELS] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Preprocess a decoded image for CLIP inference.
///
/// Resizes to `image_size × image_size` with a bilinear filter, converts to
/// RGB, normalizes, and returns a `[1, 3, S, S]` tensor.
pub fn preprocess(image: &DynamicImage, image_size: u32) -> Array4<f32> {
    let rgb = image
        .resize_exact(
            image_size,
            image_size,
            image::imageops::FilterType::Triangle,
        )
        .to_rgb8();

    let size = image_size as usize;
    Array4::from_shape_fn((1, CHANNELS, size, size), |(_, c, y, x)| {
        let val = rgb.get_pixel(x as u32, y as u32)[c];
        (val as f32 / 255.0 - NORM_MEAN[c]) / NORM_STD[c]
    })
}

/// Decode raw bytes (format sniffed from content) and preprocess.
///
/// Fails with [`PipelineError::InvalidImage`] if the bytes are not a decodable image.
pub fn preprocess_bytes(bytes: &[u8], path: &Path, image_size: u32) -> PipelineResult<Array4<f32>> {
    let image = image::load_from_memory(bytes).map_err(|e| PipelineError::InvalidImage {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::InvalidImage {
            path: path.to_path_buf(),
            message: "image has zero width or height".to_string(),
        });
    }
    Ok(preprocess(&image, image_size))
}
