//! Training schedule configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{VisionCotError, VisionCotResult};

/// Which of the two training stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Stage 1: frozen backbone, projection head (and markers) only.
    #[default]
    Bootstrap,
    /// Stage 2: one trainable-backbone strategy plus the answer loss.
    Integration,
}

impl StageId {
    /// Stage number as used in logs and artifact names.
    pub fn number(self) -> u8 {
        match self {
            StageId::Bootstrap => 1,
            StageId::Integration => 2,
        }
    }

    /// Parse `1`/`2`/`bootstrap`/`integration`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "1" | "bootstrap" | "stage1" => Some(StageId::Bootstrap),
            "2" | "integration" | "stage2" => Some(StageId::Integration),
            _ => None,
        }
    }
}

/// Training run configuration.
///
/// The Stage 2 strategy flags are mutually exclusive; exactly one must be
/// set when `stage = "integration"`. Resolution into a stage descriptor
/// happens in [`crate::training::StageDescriptor::from_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Active stage.
    #[serde(default)]
    pub stage: StageId,

    /// Marker embeddings trainable in Stage 1.
    #[serde(default = "default_true")]
    pub train_markers: bool,

    /// Stage 2 strategy: fine-tune the whole backbone and output head.
    #[serde(default)]
    pub full_backbone: bool,

    /// Stage 2 strategy: train low-rank adapters only.
    #[serde(default)]
    pub adapter: bool,

    /// Stage 2 strategy: train the output head only.
    #[serde(default)]
    pub head_only: bool,

    /// Freeze the projection head during Stage 2.
    #[serde(default = "default_true")]
    pub freeze_projection: bool,

    /// Keep the vision loss active during Stage 2.
    #[serde(default = "default_true")]
    pub stage2_vision_loss: bool,

    /// Peak learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// AdamW weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Linear warmup steps before cosine decay.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,

    /// Passes over the dataset.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Samples whose losses are summed before one optimizer step.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Total optimizer steps for the schedule. Derived from the dataset size
    /// and epochs when unset.
    #[serde(default)]
    pub total_steps: Option<usize>,

    /// Shuffle seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// JSONL dataset of `{question, reasoning, answer}` records.
    #[serde(default)]
    pub dataset_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_warmup_steps() -> usize {
    100
}

fn default_epochs() -> usize {
    1
}

fn default_batch_size() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            stage: StageId::default(),
            train_markers: true,
            full_backbone: false,
            adapter: false,
            head_only: false,
            freeze_projection: true,
            stage2_vision_loss: true,
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            warmup_steps: default_warmup_steps(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            total_steps: None,
            seed: default_seed(),
            dataset_path: None,
        }
    }
}

impl TrainingConfig {
    /// Validate numeric fields. Strategy exclusivity is checked by the
    /// stage descriptor.
    pub fn validate(&self) -> VisionCotResult<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(VisionCotError::ConfigError {
                message: format!("learning_rate must be > 0, got {}", self.learning_rate),
            });
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(VisionCotError::ConfigError {
                message: format!("weight_decay must be >= 0, got {}", self.weight_decay),
            });
        }
        if self.epochs == 0 {
            return Err(VisionCotError::ConfigError {
                message: "epochs must be > 0".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(VisionCotError::ConfigError {
                message: "batch_size must be > 0".to_string(),
            });
        }
        Ok(())
    }
}
