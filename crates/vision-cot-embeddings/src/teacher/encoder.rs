//! Teacher encoder forward pass.
//!
//! Pipeline:
//! 1. Slice the bitmap into full-height patches of `patch_width` columns
//! 2. Linear patch embedding plus learned position embedding
//! 3. Bidirectional transformer layers
//! 4. Post-LayerNorm
//! 5. Average-pool every `merge_factor` neighbouring patches into one token
//! 6. Linear projection into the backbone embedding space

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};
use tracing::{debug, info};

use crate::config::TeacherEncoderConfig;
use crate::error::{VisionCotError, VisionCotResult};
use crate::layers::{BlockConfig, TransformerBlock};
use crate::render::Bitmap;

use super::patches::{patch_count, patchify};
use super::weights::seeded_tensors;

/// Read-only vision capability used to produce regression targets.
///
/// The trait exposes no parameters; callers only see detached outputs.
pub trait VisionEncoder: Send + Sync {
    /// Encode a bitmap into `[num_tokens, output_dim]` target embeddings.
    ///
    /// # Errors
    /// - `VisionCotError::EncoderError` if the bitmap cannot be processed
    ///   at its size; the output is never truncated
    fn encode(&self, bitmap: &Bitmap) -> VisionCotResult<Tensor>;

    /// Dimensionality of each output embedding.
    fn output_dim(&self) -> usize;
}

fn map_candle(e: candle_core::Error) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("Teacher encoder forward failed: {}", e),
    }
}

/// Frozen patch-transformer teacher.
pub struct TeacherEncoder {
    patch_embed: Linear,
    position_embedding: Tensor,
    layers: Vec<TransformerBlock>,
    post_layernorm: LayerNorm,
    output_projection: Linear,
    config: TeacherEncoderConfig,
    output_dim: usize,
    device: Device,
}

impl TeacherEncoder {
    /// Load the teacher from `config.weights_path`, or build it from
    /// `config.seed` when no path is configured.
    ///
    /// # Errors
    /// - `VisionCotError::ModelLoadError` if a configured weights file is
    ///   missing or does not contain the expected tensors
    pub fn new(
        config: &TeacherEncoderConfig,
        output_dim: usize,
        device: &Device,
    ) -> VisionCotResult<Self> {
        match &config.weights_path {
            Some(path) => {
                if !path.exists() {
                    return Err(VisionCotError::ModelLoadError {
                        message: format!("Teacher weights not found: {}", path.display()),
                    });
                }
                // SAFETY: the file is memory-mapped read-only and not modified
                // while the encoder is alive.
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[path.as_path()], DType::F32, device)
                }
                .map_err(|e| VisionCotError::ModelLoadError {
                    message: format!("Failed to map teacher weights '{}': {}", path.display(), e),
                })?;
                info!(path = %path.display(), "Loading teacher encoder weights");
                Self::from_var_builder(config, output_dim, vb, device)
            }
            None => {
                let tensors = seeded_tensors(config, output_dim, device).map_err(map_candle)?;
                let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
                info!(seed = config.seed, "Initialising teacher encoder from seed");
                Self::from_var_builder(config, output_dim, vb, device)
            }
        }
    }

    fn from_var_builder(
        config: &TeacherEncoderConfig,
        output_dim: usize,
        vb: VarBuilder,
        device: &Device,
    ) -> VisionCotResult<Self> {
        let h = config.hidden_size;
        let load = |e: candle_core::Error| VisionCotError::ModelLoadError {
            message: format!("Teacher weight missing or misshapen: {}", e),
        };

        let patch_embed = candle_nn::linear(config.patch_pixels(), h, vb.pp("patch_embed")).map_err(load)?;
        let position_embedding = vb
            .get((config.max_patches, h), "position_embedding")
            .map_err(load)?;

        let block = BlockConfig {
            hidden_size: h,
            num_heads: config.num_heads,
            intermediate_size: config.intermediate_size,
            layer_norm_eps: config.layer_norm_eps,
        };
        let layers = (0..config.num_layers)
            .map(|i| TransformerBlock::new(block, vb.pp(format!("layers.{i}")), None))
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(load)?;

        let post_layernorm =
            candle_nn::layer_norm(h, config.layer_norm_eps, vb.pp("post_layernorm")).map_err(load)?;
        let output_projection =
            candle_nn::linear_no_bias(h, output_dim, vb.pp("output_projection")).map_err(load)?;

        Ok(Self {
            patch_embed,
            position_embedding,
            layers,
            post_layernorm,
            output_projection,
            config: config.clone(),
            output_dim,
            device: device.clone(),
        })
    }

    /// Number of target tokens a bitmap of `width` pixels encodes to.
    pub fn output_len(&self, width: u32) -> usize {
        patch_count(width, self.config.patch_width).div_ceil(self.config.merge_factor.max(1))
    }

    fn check_bitmap(&self, bitmap: &Bitmap) -> VisionCotResult<usize> {
        let (width, height) = bitmap.dimensions();
        if height != self.config.image_height {
            return Err(VisionCotError::EncoderError {
                message: format!(
                    "Bitmap height {} does not match encoder height {}",
                    height, self.config.image_height
                ),
            });
        }
        if width == 0 {
            return Err(VisionCotError::EncoderError {
                message: "Cannot encode an empty bitmap".to_string(),
            });
        }
        let patches = patch_count(width, self.config.patch_width);
        if patches > self.config.max_patches {
            return Err(VisionCotError::EncoderError {
                message: format!(
                    "Bitmap width {} needs {} patches, encoder supports {}",
                    width, patches, self.config.max_patches
                ),
            });
        }
        Ok(patches)
    }
}

/// Average-pool groups of `factor` consecutive rows. A trailing partial
/// group is pooled over the rows it has.
fn merge_patches(x: &Tensor, factor: usize) -> candle_core::Result<Tensor> {
    let (n, h) = x.dims2()?;
    if factor <= 1 {
        return Ok(x.clone());
    }
    let full = n / factor;
    let rem = n % factor;

    let mut parts = Vec::with_capacity(2);
    if full > 0 {
        parts.push(
            x.narrow(0, 0, full * factor)?
                .reshape((full, factor, h))?
                .mean(1)?,
        );
    }
    if rem > 0 {
        parts.push(x.narrow(0, full * factor, rem)?.mean_keepdim(0)?);
    }
    Tensor::cat(&parts, 0)
}

impl VisionEncoder for TeacherEncoder {
    fn encode(&self, bitmap: &Bitmap) -> VisionCotResult<Tensor> {
        let num_patches = self.check_bitmap(bitmap)?;
        let patches = patchify(bitmap, self.config.patch_width, &self.device)?;

        let pos = self
            .position_embedding
            .narrow(0, 0, num_patches)
            .map_err(map_candle)?;
        let x = (self.patch_embed.forward(&patches).map_err(map_candle)? + pos).map_err(map_candle)?;

        let mut x = x.unsqueeze(0).map_err(map_candle)?;
        for layer in &self.layers {
            x = layer.forward(&x, None, None).map_err(map_candle)?;
        }
        let x = self
            .post_layernorm
            .forward(&x)
            .and_then(|t| t.squeeze(0))
            .map_err(map_candle)?;

        let pooled = merge_patches(&x, self.config.merge_factor).map_err(map_candle)?;
        let out = self.output_projection.forward(&pooled).map_err(map_candle)?;

        debug!(
            width = bitmap.width(),
            patches = num_patches,
            tokens = out.dims()[0],
            "Teacher encoded bitmap"
        );
        Ok(out.detach())
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{GlyphStripRenderer, Renderer};
    use image::GrayImage;

    fn encoder() -> TeacherEncoder {
        TeacherEncoder::new(&TeacherEncoderConfig::default(), 16, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_output_shape_matches_width() {
        let enc = encoder();
        let bitmap = GlyphStripRenderer::default().render("Step 1: 3 + 4 = 7").unwrap();
        let out = enc.encode(&bitmap).unwrap();
        assert_eq!(out.dims(), &[enc.output_len(bitmap.width()), 16]);
        // 17 chars * 8px = 17 patches, merged by 4 -> 5 tokens
        assert_eq!(out.dims()[0], 5);
    }

    #[test]
    fn test_seeded_teacher_is_deterministic() {
        let bitmap = GlyphStripRenderer::default().render("abc").unwrap();
        let a: Vec<f32> = encoder().encode(&bitmap).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = encoder().encode(&bitmap).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_height_rejected() {
        let bitmap = GrayImage::new(16, 9);
        assert!(matches!(
            encoder().encode(&bitmap),
            Err(VisionCotError::EncoderError { .. })
        ));
    }

    #[test]
    fn test_oversized_bitmap_rejected_not_truncated() {
        let mut config = TeacherEncoderConfig::default();
        config.max_patches = 2;
        let enc = TeacherEncoder::new(&config, 16, &Device::Cpu).unwrap();
        let bitmap = GrayImage::new(24, config.image_height);
        assert!(matches!(enc.encode(&bitmap), Err(VisionCotError::EncoderError { .. })));
    }

    #[test]
    fn test_missing_weights_file_is_fatal() {
        let mut config = TeacherEncoderConfig::default();
        config.weights_path = Some("/nonexistent/teacher.safetensors".into());
        assert!(matches!(
            TeacherEncoder::new(&config, 16, &Device::Cpu),
            Err(VisionCotError::ModelLoadError { .. })
        ));
    }

    #[test]
    fn test_merge_partial_group() {
        let x = Tensor::from_slice(&[1.0f32, 3.0, 5.0, 7.0, 9.0], (5, 1), &Device::Cpu).unwrap();
        let m: Vec<Vec<f32>> = merge_patches(&x, 2).unwrap().to_vec2().unwrap();
        assert_eq!(m, vec![vec![2.0], vec![6.0], vec![9.0]]);
    }

    #[test]
    fn test_output_is_not_a_variable() {
        let bitmap = GlyphStripRenderer::default().render("x").unwrap();
        let out = encoder().encode(&bitmap).unwrap();
        assert!(!out.is_variable());
    }
}
