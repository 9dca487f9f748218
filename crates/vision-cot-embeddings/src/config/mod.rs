//! Root configuration for the vision-token compression pipeline.
//!
//! # Loading Configuration
//!
//! ```
//! use vision_cot_embeddings::VisionCotConfig;
//!
//! let config = VisionCotConfig::default();
//! config.validate().expect("Default config should be valid");
//!
//! let config = VisionCotConfig::default().with_env_overrides();
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! [model]
//! embedding_dim = 64
//! lora_rank = 8
//!
//! [teacher]
//! image_height = 16
//! merge_factor = 4
//!
//! [training]
//! stage = "integration"
//! adapter = true
//!
//! [generation]
//! max_soft_tokens = 64
//! temperature = 0.0
//! ```
//!
//! Invalid configuration is an error, never silently defaulted. Stage 2
//! without exactly one backbone strategy fails here, before any model is
//! built.

mod checkpoint;
mod device;
mod generation;
mod loss;
mod model;
mod teacher;
mod training;

pub use checkpoint::CheckpointConfig;
pub use device::DeviceConfig;
pub use generation::GenerationConfig;
pub use loss::LossConfig;
pub use model::{BackboneConfig, ModelConfig, ProjectionConfig};
pub use teacher::TeacherEncoderConfig;
pub use training::{StageId, TrainingConfig};

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{VisionCotError, VisionCotResult};
use crate::training::StageDescriptor;

// ============================================================================
// ROOT CONFIG
// ============================================================================

/// Root configuration aggregating every subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisionCotConfig {
    /// Compute device.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Backbone, tokenizer and markers.
    #[serde(default)]
    pub model: ModelConfig,

    /// Frozen teacher encoder.
    #[serde(default)]
    pub teacher: TeacherEncoderConfig,

    /// Projection head.
    #[serde(default)]
    pub projection: ProjectionConfig,

    /// Loss engine.
    #[serde(default)]
    pub loss: LossConfig,

    /// Stage schedule and optimizer.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Inference defaults.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Stage artifacts.
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
}

impl VisionCotConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `VisionCotError::ConfigError` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> VisionCotResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| VisionCotError::ConfigError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        toml::from_str(&contents).map_err(|e| VisionCotError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    /// Create configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> VisionCotResult<Self> {
        toml::from_str(toml).map_err(|e| VisionCotError::ConfigError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml_string(&self) -> VisionCotResult<String> {
        toml::to_string_pretty(self).map_err(|e| VisionCotError::ConfigError {
            message: format!("Failed to serialize to TOML: {}", e),
        })
    }

    /// Validate all sections and resolve the stage descriptor.
    ///
    /// Returns the first error found, prefixed with its section.
    pub fn validate(&self) -> VisionCotResult<()> {
        let sections: [(&str, VisionCotResult<()>); 8] = [
            ("device", self.device.validate()),
            ("model", self.model.validate()),
            ("teacher", self.teacher.validate()),
            ("projection", self.projection.validate()),
            ("loss", self.loss.validate()),
            ("training", self.training.validate()),
            ("generation", self.generation.validate()),
            ("checkpoints", self.checkpoints.validate()),
        ];
        for (name, result) in sections {
            result.map_err(|e| VisionCotError::ConfigError {
                message: format!("[{}] {}", name, e),
            })?;
        }

        StageDescriptor::from_config(&self.training, self.model.lora_rank).map_err(|e| {
            VisionCotError::ConfigError {
                message: format!("[training] {}", e),
            }
        })?;

        Ok(())
    }

    /// Apply environment variable overrides. Prefix: `VISION_COT_`.
    ///
    /// | Variable | Config Path | Type |
    /// |----------|-------------|------|
    /// | `VISION_COT_USE_CUDA` | `device.use_cuda` | bool |
    /// | `VISION_COT_BACKBONE_DIR` | `model.backbone_dir` | path |
    /// | `VISION_COT_TOKENIZER_PATH` | `model.tokenizer_path` | path |
    /// | `VISION_COT_STAGE` | `training.stage` | `1`/`2` |
    /// | `VISION_COT_LEARNING_RATE` | `training.learning_rate` | f64 |
    /// | `VISION_COT_MAX_SOFT_TOKENS` | `generation.max_soft_tokens` | usize |
    /// | `VISION_COT_MAX_ANSWER_TOKENS` | `generation.max_answer_tokens` | usize |
    /// | `VISION_COT_TEMPERATURE` | `generation.temperature` | f64 |
    /// | `VISION_COT_STAGE1_PATH` | `checkpoints.stage1_path` | path |
    /// | `VISION_COT_STAGE2_PATH` | `checkpoints.stage2_path` | path |
    ///
    /// Unparseable values are ignored; `validate` still runs afterwards.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(b) = env_parse::<bool>("VISION_COT_USE_CUDA") {
            self.device.use_cuda = b;
        }
        if let Ok(val) = env::var("VISION_COT_BACKBONE_DIR") {
            self.model.backbone_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("VISION_COT_TOKENIZER_PATH") {
            self.model.tokenizer_path = Some(PathBuf::from(val));
        }
        if let Some(stage) = env::var("VISION_COT_STAGE")
            .ok()
            .and_then(|v| StageId::parse(&v))
        {
            self.training.stage = stage;
        }
        if let Some(lr) = env_parse::<f64>("VISION_COT_LEARNING_RATE") {
            self.training.learning_rate = lr;
        }
        if let Some(n) = env_parse::<usize>("VISION_COT_MAX_SOFT_TOKENS") {
            self.generation.max_soft_tokens = n;
        }
        if let Some(n) = env_parse::<usize>("VISION_COT_MAX_ANSWER_TOKENS") {
            self.generation.max_answer_tokens = n;
        }
        if let Some(t) = env_parse::<f64>("VISION_COT_TEMPERATURE") {
            self.generation.temperature = t;
        }
        if let Ok(val) = env::var("VISION_COT_STAGE1_PATH") {
            self.checkpoints.stage1_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("VISION_COT_STAGE2_PATH") {
            self.checkpoints.stage2_path = Some(PathBuf::from(val));
        }

        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = VisionCotConfig::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.training.stage, StageId::Bootstrap);
        assert_eq!(config.model.embedding_dim, config.model.backbone.hidden_size);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = VisionCotConfig::default();
        let toml = config.to_toml_string().unwrap();
        let parsed = VisionCotConfig::from_toml_str(&toml).unwrap();
        assert_eq!(parsed.generation.max_soft_tokens, config.generation.max_soft_tokens);
        assert_eq!(parsed.model.backbone, config.model.backbone);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = VisionCotConfig::from_toml_str(
            r#"
            [generation]
            max_soft_tokens = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.generation.max_soft_tokens, 8);
        assert_eq!(config.teacher.merge_factor, 4);
    }

    #[test]
    fn test_stage2_without_strategy_rejected() {
        let config = VisionCotConfig::from_toml_str(
            r#"
            [training]
            stage = "integration"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, VisionCotError::ConfigError { .. }));
        assert!(err.to_string().contains("[training]"));
    }

    #[test]
    fn test_stage2_two_strategies_rejected() {
        let mut config = VisionCotConfig::default();
        config.training.stage = StageId::Integration;
        config.training.full_backbone = true;
        config.training.head_only = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_embedding_dim_mismatch_rejected() {
        let mut config = VisionCotConfig::default();
        config.model.embedding_dim = 32;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[model]"));
    }

    #[test]
    fn test_invalid_top_p_rejected() {
        let mut config = VisionCotConfig::default();
        config.generation.top_p = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_var_bounds_rejected() {
        let mut config = VisionCotConfig::default();
        config.loss.log_var_min = 2.0;
        config.loss.log_var_max = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_missing_file() {
        let err = VisionCotConfig::from_file("/nonexistent/vision-cot.toml").unwrap_err();
        assert!(matches!(err, VisionCotError::ConfigError { .. }));
    }

    #[test]
    fn test_stage_id_parse() {
        assert_eq!(StageId::parse("1"), Some(StageId::Bootstrap));
        assert_eq!(StageId::parse("Integration"), Some(StageId::Integration));
        assert_eq!(StageId::parse("3"), None);
        assert_eq!(StageId::Integration.number(), 2);
    }
}
