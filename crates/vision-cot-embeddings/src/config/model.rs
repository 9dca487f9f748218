//! Language backbone, tokenizer and marker configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{VisionCotError, VisionCotResult};

/// Geometry of the decoder backbone.
///
/// Also the on-disk format of `config.json` inside a pretrained backbone
/// directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Host vocabulary size (markers are appended after it).
    pub vocab_size: usize,
    /// Hidden size; also the dimensionality of every soft token.
    pub hidden_size: usize,
    /// Number of decoder layers.
    pub num_hidden_layers: usize,
    /// Attention heads per layer.
    pub num_attention_heads: usize,
    /// FFN inner size.
    pub intermediate_size: usize,
    /// Maximum context length (prompt + soft tokens + answer).
    pub max_position_embeddings: usize,
    /// LayerNorm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// End-of-sequence token, if the tokenizer defines one.
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            vocab_size: crate::tokenizer::ByteTokenizer::VOCAB_SIZE,
            hidden_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            intermediate_size: 256,
            max_position_embeddings: 1024,
            layer_norm_eps: default_layer_norm_eps(),
            eos_token_id: Some(crate::tokenizer::ByteTokenizer::EOS_TOKEN_ID),
        }
    }
}

impl BackboneConfig {
    /// Validate the backbone geometry.
    pub fn validate(&self) -> VisionCotResult<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_hidden_layers == 0 {
            return Err(VisionCotError::ConfigError {
                message: "vocab_size, hidden_size and num_hidden_layers must be > 0".to_string(),
            });
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(VisionCotError::ConfigError {
                message: format!(
                    "hidden_size {} must be divisible by num_attention_heads {}",
                    self.hidden_size, self.num_attention_heads
                ),
            });
        }
        if self.max_position_embeddings < 4 {
            return Err(VisionCotError::ConfigError {
                message: "max_position_embeddings must be >= 4".to_string(),
            });
        }
        if let Some(eos) = self.eos_token_id {
            if eos as usize >= self.vocab_size {
                return Err(VisionCotError::ConfigError {
                    message: format!(
                        "eos_token_id {} outside vocabulary of {}",
                        eos, self.vocab_size
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Configuration for the shared language model and its extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Pretrained backbone directory (`config.json` + `model.safetensors`).
    /// When unset the backbone is randomly initialised from `backbone`.
    #[serde(default)]
    pub backbone_dir: Option<PathBuf>,

    /// HuggingFace `tokenizer.json`. When unset the byte tokenizer is used.
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,

    /// Backbone geometry, ignored when `backbone_dir` carries a `config.json`.
    #[serde(default)]
    pub backbone: BackboneConfig,

    /// Soft-token dimensionality. Must match the backbone hidden size
    /// because generated embeddings are fed back as inputs.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Low-rank adapter rank on attention query/value projections (0 = none).
    #[serde(default = "default_lora_rank")]
    pub lora_rank: usize,

    /// Adapter scaling numerator (effective scale is alpha / rank).
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: f64,

    /// Norm the marker embeddings are scaled to at initialisation.
    /// Defaults to the mean token-embedding norm of the backbone.
    #[serde(default)]
    pub marker_init_norm: Option<f32>,

    /// Seed for the marker directions.
    #[serde(default = "default_marker_seed")]
    pub marker_seed: u64,
}

fn default_embedding_dim() -> usize {
    64
}

fn default_lora_rank() -> usize {
    8
}

fn default_lora_alpha() -> f64 {
    16.0
}

fn default_marker_seed() -> u64 {
    0x5EED_0001
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone_dir: None,
            tokenizer_path: None,
            backbone: BackboneConfig::default(),
            embedding_dim: default_embedding_dim(),
            lora_rank: default_lora_rank(),
            lora_alpha: default_lora_alpha(),
            marker_init_norm: None,
            marker_seed: default_marker_seed(),
        }
    }
}

impl ModelConfig {
    /// Validate the model configuration.
    pub fn validate(&self) -> VisionCotResult<()> {
        self.backbone.validate()?;

        if self.backbone_dir.is_none() && self.embedding_dim != self.backbone.hidden_size {
            return Err(VisionCotError::ConfigError {
                message: format!(
                    "embedding_dim {} must equal backbone hidden_size {}",
                    self.embedding_dim, self.backbone.hidden_size
                ),
            });
        }
        if self.lora_rank > 0 && self.lora_alpha <= 0.0 {
            return Err(VisionCotError::ConfigError {
                message: "lora_alpha must be > 0 when lora_rank > 0".to_string(),
            });
        }
        if let Some(norm) = self.marker_init_norm {
            if !norm.is_finite() || norm <= 0.0 {
                return Err(VisionCotError::ConfigError {
                    message: format!("marker_init_norm must be finite and > 0, got {}", norm),
                });
            }
        }
        Ok(())
    }
}

/// Projection head configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Inner width of the two-layer projection MLP.
    #[serde(default = "default_hidden_width")]
    pub hidden_width: usize,
}

fn default_hidden_width() -> usize {
    128
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            hidden_width: default_hidden_width(),
        }
    }
}

impl ProjectionConfig {
    /// Validate the projection configuration.
    pub fn validate(&self) -> VisionCotResult<()> {
        if self.hidden_width == 0 {
            return Err(VisionCotError::ConfigError {
                message: "hidden_width must be > 0".to_string(),
            });
        }
        Ok(())
    }
}
