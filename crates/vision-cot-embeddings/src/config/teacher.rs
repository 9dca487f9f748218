//! Frozen teacher vision encoder configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{VisionCotError, VisionCotResult};

/// Configuration for the frozen patch encoder producing target vision tokens.
///
/// Output length for a bitmap of width `w` is
/// `ceil(ceil(w / patch_width) / merge_factor)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeacherEncoderConfig {
    /// Safetensors file with pretrained encoder weights. Random (seeded)
    /// weights are used when unset.
    #[serde(default)]
    pub weights_path: Option<PathBuf>,

    /// Required bitmap height in pixels (one patch row).
    #[serde(default = "default_image_height")]
    pub image_height: u32,

    /// Patch width in pixels.
    #[serde(default = "default_patch_width")]
    pub patch_width: u32,

    /// Encoder hidden size.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Number of bidirectional transformer layers.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Attention heads per layer.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// FFN inner size.
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    /// Adjacent patch tokens averaged into one output token.
    #[serde(default = "default_merge_factor")]
    pub merge_factor: usize,

    /// Widest bitmap accepted, in patches. Wider bitmaps are rejected.
    #[serde(default = "default_max_patches")]
    pub max_patches: usize,

    /// LayerNorm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// Seed for random initialisation.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_image_height() -> u32 {
    16
}

fn default_patch_width() -> u32 {
    8
}

fn default_hidden_size() -> usize {
    32
}

fn default_num_layers() -> usize {
    1
}

fn default_num_heads() -> usize {
    4
}

fn default_intermediate_size() -> usize {
    64
}

fn default_merge_factor() -> usize {
    4
}

fn default_max_patches() -> usize {
    2048
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_seed() -> u64 {
    0x7EAC_4E55
}

impl Default for TeacherEncoderConfig {
    fn default() -> Self {
        Self {
            weights_path: None,
            image_height: default_image_height(),
            patch_width: default_patch_width(),
            hidden_size: default_hidden_size(),
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            intermediate_size: default_intermediate_size(),
            merge_factor: default_merge_factor(),
            max_patches: default_max_patches(),
            layer_norm_eps: default_layer_norm_eps(),
            seed: default_seed(),
        }
    }
}

impl TeacherEncoderConfig {
    /// Number of pixels in one flattened patch.
    pub fn patch_pixels(&self) -> usize {
        (self.image_height * self.patch_width) as usize
    }

    /// Validate the encoder configuration.
    pub fn validate(&self) -> VisionCotResult<()> {
        if self.image_height == 0 || self.patch_width == 0 {
            return Err(VisionCotError::ConfigError {
                message: "image_height and patch_width must be > 0".to_string(),
            });
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(VisionCotError::ConfigError {
                message: format!(
                    "hidden_size {} must be divisible by num_heads {}",
                    self.hidden_size, self.num_heads
                ),
            });
        }
        if self.merge_factor == 0 {
            return Err(VisionCotError::ConfigError {
                message: "merge_factor must be >= 1".to_string(),
            });
        }
        if self.max_patches == 0 {
            return Err(VisionCotError::ConfigError {
                message: "max_patches must be > 0".to_string(),
            });
        }
        Ok(())
    }
}
