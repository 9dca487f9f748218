//! Bitmap to patch-sequence conversion.

use candle_core::{Device, Tensor};

use crate::error::{VisionCotError, VisionCotResult};
use crate::render::Bitmap;

/// Number of patches a bitmap of `width` pixels splits into.
pub(crate) fn patch_count(width: u32, patch_width: u32) -> usize {
    width.div_ceil(patch_width) as usize
}

/// Slice a single-line bitmap into full-height vertical patches.
///
/// Returns `[num_patches, height * patch_width]`, row-major within each
/// patch. Pixels are inverted so ink is 1.0 and background 0.0; the last
/// patch is padded with background.
///
/// # Errors
/// - `VisionCotError::EncoderError` if the bitmap is empty
pub fn patchify(bitmap: &Bitmap, patch_width: u32, device: &Device) -> VisionCotResult<Tensor> {
    let (width, height) = bitmap.dimensions();
    if width == 0 || height == 0 {
        return Err(VisionCotError::EncoderError {
            message: format!("Cannot encode empty bitmap ({}x{})", width, height),
        });
    }

    let num_patches = patch_count(width, patch_width);
    let patch_pixels = (height * patch_width) as usize;
    let mut data = Vec::with_capacity(num_patches * patch_pixels);

    for p in 0..num_patches as u32 {
        let x0 = p * patch_width;
        for y in 0..height {
            for dx in 0..patch_width {
                let x = x0 + dx;
                let ink = if x < width {
                    1.0 - f32::from(bitmap.get_pixel(x, y).0[0]) / 255.0
                } else {
                    0.0
                };
                data.push(ink);
            }
        }
    }

    Tensor::from_vec(data, (num_patches, patch_pixels), device).map_err(|e| {
        VisionCotError::TensorError {
            message: format!("Patch tensor creation failed: {}", e),
        }
    })
}
