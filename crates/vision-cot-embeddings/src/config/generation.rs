//! Inference configuration.

use serde::{Deserialize, Serialize};

use crate::error::{VisionCotError, VisionCotResult};

/// Defaults for the two-phase generation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Soft-phase step cap.
    #[serde(default = "default_max_soft_tokens")]
    pub max_soft_tokens: usize,
    /// Discrete-phase token cap.
    #[serde(default = "default_max_answer_tokens")]
    pub max_answer_tokens: usize,
    /// EOS is suppressed until this many answer tokens have been produced.
    #[serde(default = "default_min_answer_tokens")]
    pub min_answer_tokens: usize,
    /// Sampling temperature; 0 selects greedy decoding.
    #[serde(default)]
    pub temperature: f64,
    /// Nucleus threshold; 1.0 disables top-p filtering.
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// Sampler seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_max_soft_tokens() -> usize {
    64
}

fn default_max_answer_tokens() -> usize {
    256
}

fn default_min_answer_tokens() -> usize {
    1
}

fn default_top_p() -> f64 {
    1.0
}

fn default_seed() -> u64 {
    299_792_458
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_soft_tokens: default_max_soft_tokens(),
            max_answer_tokens: default_max_answer_tokens(),
            min_answer_tokens: default_min_answer_tokens(),
            temperature: 0.0,
            top_p: default_top_p(),
            seed: default_seed(),
        }
    }
}

impl GenerationConfig {
    /// Validate sampling parameters.
    pub fn validate(&self) -> VisionCotResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(VisionCotError::ConfigError {
                message: format!("temperature must be >= 0, got {}", self.temperature),
            });
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(VisionCotError::ConfigError {
                message: format!("top_p must be in (0, 1], got {}", self.top_p),
            });
        }
        if self.min_answer_tokens > self.max_answer_tokens {
            return Err(VisionCotError::ConfigError {
                message: format!(
                    "min_answer_tokens {} exceeds max_answer_tokens {}",
                    self.min_answer_tokens, self.max_answer_tokens
                ),
            });
        }
        Ok(())
    }
}
