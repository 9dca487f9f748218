//! Loss engine.
//!
//! Vision loss per teacher-forced step, three guarded measures:
//! 1. MSE on element differences clamped to `±mse_clamp` (always defined)
//! 2. `1 - cos(pred, target)`, similarity clamped away from ±1; only when
//!    both norms are finite and above `min_norm`, otherwise MSE
//! 3. `KL(softmax(target) || softmax(pred))`; MSE when non-finite
//!
//! The weighted step losses are averaged over the sequence. Answer loss is
//! cross-entropy over the answer positions of the full sequence only.

use candle_core::{DType, Tensor, D};
use tracing::warn;

use crate::config::LossConfig;
use crate::error::{VisionCotError, VisionCotResult};
use crate::gpu::tensor_to_f32;

/// Per-component loss values for logging, averaged over steps.
#[derive(Debug, Clone, Default)]
pub struct LossComponents {
    /// MSE term.
    pub mse: f32,
    /// Cosine term (MSE where it fell back).
    pub cosine: f32,
    /// KL term (MSE where it fell back).
    pub kl: f32,
    /// Weighted vision loss.
    pub total: f32,
    /// Steps whose cosine term used the MSE floor.
    pub cosine_fallbacks: usize,
    /// Steps whose KL term used the MSE floor.
    pub kl_fallbacks: usize,
    /// Steps whose combined loss was replaced by MSE.
    pub total_fallbacks: usize,
}

/// Vision loss with its logged components.
#[derive(Debug, Clone)]
pub struct VisionLoss {
    /// Scalar loss, attached to the prediction graph.
    pub loss: Tensor,
    pub components: LossComponents,
}

/// Embedding regression and answer losses.
pub struct DistillationLoss {
    config: LossConfig,
}

impl DistillationLoss {
    pub fn new(config: LossConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Vision loss between `predictions` and `targets`, both `[T, D]`.
    ///
    /// # Errors
    /// - `VisionCotError::DimensionMismatch` if the shapes differ
    /// - `VisionCotError::NumericError` if even the MSE floor is non-finite
    pub fn vision_loss(&self, predictions: &Tensor, targets: &Tensor) -> VisionCotResult<VisionLoss> {
        let (steps, dim) = predictions.dims2().map_err(map_candle)?;
        let (t_steps, t_dim) = targets.dims2().map_err(map_candle)?;
        if steps != t_steps {
            return Err(VisionCotError::DimensionMismatch {
                expected: t_steps,
                actual: steps,
            });
        }
        if dim != t_dim {
            return Err(VisionCotError::DimensionMismatch {
                expected: t_dim,
                actual: dim,
            });
        }
        if steps == 0 {
            return Err(VisionCotError::InvalidInput(
                "Vision loss over an empty sequence".to_string(),
            ));
        }

        let mut step_losses = Vec::with_capacity(steps);
        let mut components = LossComponents::default();
        for t in 0..steps {
            let pred = predictions.get(t).map_err(map_candle)?;
            let target = targets.get(t).map_err(map_candle)?.detach();
            let (loss, step) = self.step_loss(&pred, &target)?;
            components.mse += step.mse;
            components.cosine += step.cosine;
            components.kl += step.kl;
            components.total += step.total;
            components.cosine_fallbacks += step.cosine_fallbacks;
            components.kl_fallbacks += step.kl_fallbacks;
            components.total_fallbacks += step.total_fallbacks;
            step_losses.push(loss);
        }

        let n = steps as f32;
        components.mse /= n;
        components.cosine /= n;
        components.kl /= n;
        components.total /= n;

        let loss = Tensor::stack(&step_losses, 0)
            .and_then(|s| s.mean_all())
            .map_err(map_candle)?;

        Ok(VisionLoss { loss, components })
    }

    /// Loss for one step, `pred` and `target` both `[D]`.
    pub fn step_loss(&self, pred: &Tensor, target: &Tensor) -> VisionCotResult<(Tensor, LossComponents)> {
        let c = &self.config;
        let mut parts = LossComponents::default();

        let mse = self.mse(pred, target)?;
        let mse_val = tensor_to_f32(&mse)?;
        if !mse_val.is_finite() {
            return Err(VisionCotError::NumericError {
                message: format!("MSE floor is non-finite ({})", mse_val),
            });
        }
        parts.mse = mse_val;

        let cosine = match self.cosine(pred, target)? {
            Some(cos) => cos,
            None => {
                parts.cosine_fallbacks = 1;
                mse.clone()
            }
        };
        parts.cosine = tensor_to_f32(&cosine)?;

        let kl = self.kl(pred, target)?;
        let kl = if tensor_to_f32(&kl)?.is_finite() {
            kl
        } else {
            parts.kl_fallbacks = 1;
            warn!("KL term non-finite, using MSE for this step");
            mse.clone()
        };
        parts.kl = tensor_to_f32(&kl)?;

        let total = weighted(&mse, c.mse_weight)
            .and_then(|m| m + weighted(&cosine, c.cosine_weight)?)
            .and_then(|m| m + weighted(&kl, c.kl_weight)?)
            .map_err(map_candle)?;
        let total_val = tensor_to_f32(&total)?;
        let total = if total_val.is_finite() {
            parts.total = total_val;
            total
        } else {
            parts.total_fallbacks = 1;
            parts.total = mse_val;
            warn!(total = total_val, "Vision loss non-finite, using MSE for this step");
            mse
        };

        Ok((total, parts))
    }

    /// Mean squared clamped difference.
    pub fn mse(&self, pred: &Tensor, target: &Tensor) -> VisionCotResult<Tensor> {
        let bound = self.config.mse_clamp as f64;
        (pred - target)
            .and_then(|d| d.clamp(-bound, bound))
            .and_then(|d| d.sqr())
            .and_then(|d| d.mean_all())
            .map_err(map_candle)
    }

    /// `1 - clamp(cos)`, or `None` when either norm is too small or not
    /// finite. Both norms stay in the graph so the gradient is tangential
    /// to `pred`.
    pub fn cosine(&self, pred: &Tensor, target: &Tensor) -> VisionCotResult<Option<Tensor>> {
        let min_norm = self.config.min_norm;
        let pred_norm = pred.sqr().and_then(|t| t.sum_all()).and_then(|t| t.sqrt()).map_err(map_candle)?;
        let target_norm = target.sqr().and_then(|t| t.sum_all()).and_then(|t| t.sqrt()).map_err(map_candle)?;
        let (pn, tn) = (tensor_to_f32(&pred_norm)?, tensor_to_f32(&target_norm)?);
        if !(pn.is_finite() && tn.is_finite() && pn > min_norm && tn > min_norm) {
            return Ok(None);
        }

        let limit = 1.0 - self.config.similarity_clamp_eps as f64;
        let loss = (pred * target)
            .and_then(|p| p.sum_all())
            .and_then(|dot| dot.broadcast_div(&(&pred_norm * &target_norm)?))
            .and_then(|sim| sim.clamp(-limit, limit))
            .and_then(|sim| sim.affine(-1.0, 1.0))
            .map_err(map_candle)?;
        Ok(Some(loss))
    }

    /// `KL(softmax(target) || softmax(pred))`.
    pub fn kl(&self, pred: &Tensor, target: &Tensor) -> VisionCotResult<Tensor> {
        let log_p = candle_nn::ops::log_softmax(target, D::Minus1).map_err(map_candle)?;
        let log_q = candle_nn::ops::log_softmax(pred, D::Minus1).map_err(map_candle)?;
        log_p
            .exp()
            .and_then(|p| p * (&log_p - &log_q)?)
            .and_then(|t| t.sum_all())
            .map_err(map_candle)
    }

    /// Cross-entropy over positions with a label.
    ///
    /// `logits: [L, V]`, `labels.len() == L`; `None` positions are masked
    /// out of the loss entirely.
    ///
    /// # Errors
    /// - `VisionCotError::InvalidInput` if no position carries a label
    /// - `VisionCotError::NumericError` if the loss is non-finite
    pub fn answer_loss(&self, logits: &Tensor, labels: &[Option<u32>]) -> VisionCotResult<Tensor> {
        let (len, _vocab) = logits.dims2().map_err(map_candle)?;
        if labels.len() != len {
            return Err(VisionCotError::DimensionMismatch {
                expected: len,
                actual: labels.len(),
            });
        }
        let (positions, targets): (Vec<u32>, Vec<u32>) = labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.map(|t| (i as u32, t)))
            .unzip();
        if positions.is_empty() {
            return Err(VisionCotError::InvalidInput(
                "Answer loss with no labelled positions".to_string(),
            ));
        }

        let device = logits.device();
        let index = Tensor::new(positions.as_slice(), device).map_err(map_candle)?;
        let targets = Tensor::new(targets.as_slice(), device).map_err(map_candle)?;
        let selected = logits
            .index_select(&index, 0)
            .and_then(|t| t.to_dtype(DType::F32))
            .map_err(map_candle)?;
        let loss = candle_nn::loss::cross_entropy(&selected, &targets).map_err(map_candle)?;

        let value = tensor_to_f32(&loss)?;
        if !value.is_finite() {
            return Err(VisionCotError::NumericError {
                message: format!("Answer cross-entropy is non-finite ({})", value),
            });
        }
        Ok(loss)
    }
}

fn weighted(t: &Tensor, w: f32) -> candle_core::Result<Tensor> {
    t.affine(w as f64, 0.0)
}

fn map_candle(e: candle_core::Error) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("Loss computation error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::training::ScheduledOptimizer;
    use candle_core::{Device, Var};

    fn engine() -> DistillationLoss {
        DistillationLoss::new(LossConfig::default())
    }

    fn vecs(rows: &[&[f32]]) -> Tensor {
        let d = rows[0].len();
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), d), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_zero_vectors_fall_back_to_finite_mse() {
        let zeros = vecs(&[&[0.0, 0.0, 0.0, 0.0]]);
        let out = engine().vision_loss(&zeros, &zeros).unwrap();
        let value = tensor_to_f32(&out.loss).unwrap();
        assert!(value.is_finite());
        assert_eq!(value, 0.0);
        assert_eq!(out.components.cosine_fallbacks, 1);
    }

    #[test]
    fn test_zero_prediction_nonzero_target() {
        let pred = vecs(&[&[0.0, 0.0, 0.0, 0.0]]);
        let target = vecs(&[&[1.0, -2.0, 0.5, 3.0]]);
        let out = engine().vision_loss(&pred, &target).unwrap();
        assert!(tensor_to_f32(&out.loss).unwrap().is_finite());
        assert_eq!(out.components.cosine_fallbacks, 1);
        // cosine term is the MSE floor
        assert!((out.components.cosine - out.components.mse).abs() < 1e-6);
    }

    #[test]
    fn test_extreme_magnitudes_stay_finite() {
        let pred = vecs(&[&[1e30, -1e30, 1e30, 0.0]]);
        let target = vecs(&[&[-1e30, 1e30, 0.0, 1e30]]);
        let out = engine().vision_loss(&pred, &target).unwrap();
        let value = tensor_to_f32(&out.loss).unwrap();
        assert!(value.is_finite(), "loss = {}", value);
    }

    #[test]
    fn test_nan_prediction_is_numeric_error() {
        let pred = vecs(&[&[f32::NAN, 0.0]]);
        let target = vecs(&[&[1.0, 0.0]]);
        let err = engine().vision_loss(&pred, &target).unwrap_err();
        assert!(matches!(err, VisionCotError::NumericError { .. }));
        assert!(err.is_sample_recoverable());
    }

    #[test]
    fn test_identical_vectors_near_zero() {
        let v = vecs(&[&[0.3, -0.4, 0.5, 0.1], &[1.0, 2.0, 3.0, 4.0]]);
        let out = engine().vision_loss(&v, &v).unwrap();
        let value = tensor_to_f32(&out.loss).unwrap();
        // cosine clamp leaves eps * weight
        assert!(value < 1e-3, "loss = {}", value);
        assert_eq!(out.components.cosine_fallbacks, 0);
    }

    #[test]
    fn test_opposite_vectors_cosine_near_two() {
        let p = vecs(&[&[1.0, 0.0]]).get(0).unwrap();
        let t = vecs(&[&[-1.0, 0.0]]).get(0).unwrap();
        let cos = engine().cosine(&p, &t).unwrap().unwrap();
        let v = tensor_to_f32(&cos).unwrap();
        assert!(v < 2.0 && v > 1.99);
    }

    #[test]
    fn test_cosine_gradient_has_no_radial_component() {
        let p = Var::from_slice(&[1.0f32, 0.5, -0.3, 0.2], 4, &Device::Cpu).unwrap();
        let t = Tensor::from_slice(&[1.0f32, 0.0, 0.0, 0.0], 4, &Device::Cpu).unwrap();
        let cos = engine().cosine(p.as_tensor(), &t).unwrap().unwrap();
        let grads = cos.backward().unwrap();
        let g: Vec<f32> = grads.get(p.as_tensor()).unwrap().to_vec1().unwrap();
        let pv: Vec<f32> = p.as_tensor().to_vec1().unwrap();
        let radial: f32 = g.iter().zip(&pv).map(|(a, b)| a * b).sum();
        assert!(radial.abs() < 1e-5, "radial = {}, grad = {:?}", radial, g);
        // rotating toward the target lowers the loss
        assert!(g[0] < 0.0);
        assert!(g[1] > 0.0);
    }

    #[test]
    fn test_vision_loss_pulls_prediction_toward_target() {
        let pred = Var::from_tensor(&vecs(&[&[0.2, 0.9, -0.4, 0.1]])).unwrap();
        let target = vecs(&[&[1.0, -0.5, 0.3, 0.8]]);
        let config = TrainingConfig {
            learning_rate: 0.05,
            warmup_steps: 0,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut opt = ScheduledOptimizer::new(vec![pred.clone()], &config, 1000).unwrap();
        let loss = engine();

        let cos_sim = |p: &Tensor| {
            let p = p.get(0).unwrap();
            let t = target.get(0).unwrap();
            1.0 - tensor_to_f32(&loss.cosine(&p, &t).unwrap().unwrap()).unwrap()
        };
        let mse_before = tensor_to_f32(&loss.mse(pred.as_tensor(), &target).unwrap()).unwrap();
        let cos_before = cos_sim(pred.as_tensor());

        for _ in 0..40 {
            let out = loss.vision_loss(pred.as_tensor(), &target).unwrap();
            opt.backward_step(&out.loss).unwrap();
        }

        let mse_after = tensor_to_f32(&loss.mse(pred.as_tensor(), &target).unwrap()).unwrap();
        let cos_after = cos_sim(pred.as_tensor());
        assert!(mse_after < mse_before, "mse {} -> {}", mse_before, mse_after);
        assert!(cos_after > cos_before, "cos {} -> {}", cos_before, cos_after);
        assert!(cos_after > 0.9, "cos = {}", cos_after);
    }

    #[test]
    fn test_step_count_mismatch() {
        let a = vecs(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let b = vecs(&[&[1.0, 0.0]]);
        assert!(matches!(
            engine().vision_loss(&a, &b),
            Err(VisionCotError::DimensionMismatch { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn test_answer_loss_masks_prompt_positions() {
        let device = Device::Cpu;
        // position 0 would be a terrible prediction but is masked
        let logits = Tensor::from_slice(
            &[-100.0f32, 100.0, 100.0, 0.0, 100.0, -100.0],
            (3, 2),
            &device,
        )
        .unwrap();
        let loss = engine()
            .answer_loss(&logits, &[None, Some(0), Some(0)])
            .unwrap();
        let v = tensor_to_f32(&loss).unwrap();
        assert!(v < 1e-3, "masked loss = {}", v);

        let unmasked = engine()
            .answer_loss(&logits, &[Some(0), Some(0), Some(0)])
            .unwrap();
        assert!(tensor_to_f32(&unmasked).unwrap() > 10.0);
    }

    #[test]
    fn test_answer_loss_requires_labels() {
        let logits = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(engine().answer_loss(&logits, &[None, None]).is_err());
    }
}
