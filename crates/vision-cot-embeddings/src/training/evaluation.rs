//! Distillation quality metrics.

use candle_core::{Tensor, D};
use serde::Serialize;

use crate::error::{VisionCotError, VisionCotResult};
use crate::gpu::l2_normalize;

/// How closely generated embeddings track the teacher's.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DistillationMetrics {
    /// Mean per-token cosine similarity.
    pub mean_cosine: f32,
    /// Mean per-token MSE.
    pub mean_mse: f32,
    /// Tokens compared.
    pub num_tokens: usize,
}

impl DistillationMetrics {
    /// Compare `[T, D]` predictions with `[T, D]` targets row by row.
    pub fn compare(predictions: &Tensor, targets: &Tensor) -> VisionCotResult<Self> {
        if predictions.dims() != targets.dims() {
            return Err(VisionCotError::InvalidInput(format!(
                "Prediction shape {:?} differs from target shape {:?}",
                predictions.dims(),
                targets.dims()
            )));
        }
        let num_tokens = predictions.dims2().map_err(map_candle)?.0;
        if num_tokens == 0 {
            return Ok(Self::default());
        }

        let cos: Vec<f32> = l2_normalize(predictions)
            .and_then(|p| p * l2_normalize(targets)?)
            .and_then(|t| t.sum(D::Minus1))
            .and_then(|t| t.to_vec1())
            .map_err(map_candle)?;
        let mse: Vec<f32> = (predictions - targets)
            .and_then(|d| d.sqr())
            .and_then(|d| d.mean(D::Minus1))
            .and_then(|d| d.to_vec1())
            .map_err(map_candle)?;

        let n = num_tokens as f32;
        Ok(Self {
            mean_cosine: cos.iter().sum::<f32>() / n,
            mean_mse: mse.iter().sum::<f32>() / n,
            num_tokens,
        })
    }

    /// Token-weighted average over several samples.
    pub fn merge(parts: &[DistillationMetrics]) -> Self {
        let num_tokens: usize = parts.iter().map(|m| m.num_tokens).sum();
        if num_tokens == 0 {
            return Self::default();
        }
        let weight = |m: &DistillationMetrics| m.num_tokens as f32 / num_tokens as f32;
        Self {
            mean_cosine: parts.iter().map(|m| m.mean_cosine * weight(m)).sum(),
            mean_mse: parts.iter().map(|m| m.mean_mse * weight(m)).sum(),
            num_tokens,
        }
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "cosine={:.4} mse={:.6} tokens={}",
            self.mean_cosine, self.mean_mse, self.num_tokens
        )
    }
}

fn map_candle(e: candle_core::Error) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("Evaluation error: {}", e),
    }
}
