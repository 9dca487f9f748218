//! Loss engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{VisionCotError, VisionCotResult};

/// Weights and numeric guards for the vision and answer losses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    /// Weight of the MSE term in the per-step vision loss.
    #[serde(default = "default_mse_weight")]
    pub mse_weight: f32,
    /// Weight of the `1 - cosine` term.
    #[serde(default = "default_cosine_weight")]
    pub cosine_weight: f32,
    /// Weight of the softmax KL term.
    #[serde(default = "default_kl_weight")]
    pub kl_weight: f32,
    /// Both norms must exceed this for the cosine term to be used.
    #[serde(default = "default_min_norm")]
    pub min_norm: f32,
    /// Cosine similarity is clamped to `[-1 + eps, 1 - eps]`.
    #[serde(default = "default_similarity_clamp_eps")]
    pub similarity_clamp_eps: f32,
    /// Element differences are clamped to `±mse_clamp` before squaring.
    #[serde(default = "default_mse_clamp")]
    pub mse_clamp: f32,
    /// Static weight of the vision loss (uncertainty weighting off).
    #[serde(default = "default_term_weight")]
    pub vision_weight: f32,
    /// Static weight of the answer loss (uncertainty weighting off).
    #[serde(default = "default_term_weight")]
    pub answer_weight: f32,
    /// Combine terms with learned log-variances instead of static weights.
    #[serde(default = "default_uncertainty_weighting")]
    pub uncertainty_weighting: bool,
    /// Lower clamp for the learned log-variances.
    #[serde(default = "default_log_var_min")]
    pub log_var_min: f32,
    /// Upper clamp for the learned log-variances.
    #[serde(default = "default_log_var_max")]
    pub log_var_max: f32,
}

fn default_mse_weight() -> f32 {
    1.0
}

fn default_cosine_weight() -> f32 {
    0.5
}

fn default_kl_weight() -> f32 {
    0.1
}

fn default_min_norm() -> f32 {
    1e-6
}

fn default_similarity_clamp_eps() -> f32 {
    1e-6
}

fn default_mse_clamp() -> f32 {
    1e6
}

fn default_term_weight() -> f32 {
    1.0
}

fn default_uncertainty_weighting() -> bool {
    true
}

fn default_log_var_min() -> f32 {
    -5.0
}

fn default_log_var_max() -> f32 {
    5.0
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            mse_weight: default_mse_weight(),
            cosine_weight: default_cosine_weight(),
            kl_weight: default_kl_weight(),
            min_norm: default_min_norm(),
            similarity_clamp_eps: default_similarity_clamp_eps(),
            mse_clamp: default_mse_clamp(),
            vision_weight: default_term_weight(),
            answer_weight: default_term_weight(),
            uncertainty_weighting: default_uncertainty_weighting(),
            log_var_min: default_log_var_min(),
            log_var_max: default_log_var_max(),
        }
    }
}

impl LossConfig {
    /// Validate weights and guards.
    pub fn validate(&self) -> VisionCotResult<()> {
        let weights = [
            ("mse_weight", self.mse_weight),
            ("cosine_weight", self.cosine_weight),
            ("kl_weight", self.kl_weight),
            ("vision_weight", self.vision_weight),
            ("answer_weight", self.answer_weight),
        ];
        for (name, w) in weights {
            if !w.is_finite() || w < 0.0 {
                return Err(VisionCotError::ConfigError {
                    message: format!("{} must be finite and >= 0, got {}", name, w),
                });
            }
        }
        if self.mse_weight + self.cosine_weight + self.kl_weight <= 0.0 {
            return Err(VisionCotError::ConfigError {
                message: "at least one vision loss weight must be > 0".to_string(),
            });
        }
        if !(self.similarity_clamp_eps > 0.0 && self.similarity_clamp_eps < 1.0) {
            return Err(VisionCotError::ConfigError {
                message: "similarity_clamp_eps must be in (0, 1)".to_string(),
            });
        }
        if !(self.min_norm >= 0.0 && self.mse_clamp > 0.0 && self.mse_clamp.is_finite()) {
            return Err(VisionCotError::ConfigError {
                message: "min_norm must be >= 0 and mse_clamp finite and > 0".to_string(),
            });
        }
        if self.log_var_min >= self.log_var_max {
            return Err(VisionCotError::ConfigError {
                message: format!(
                    "log_var_min {} must be < log_var_max {}",
                    self.log_var_min, self.log_var_max
                ),
            });
        }
        Ok(())
    }
}
