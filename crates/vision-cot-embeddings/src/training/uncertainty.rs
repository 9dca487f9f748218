//! Combination of the vision and answer losses.
//!
//! With uncertainty weighting each active term contributes
//! `exp(-s) * L + s`, where `s` is a learned log-variance clamped to
//! `[log_var_min, log_var_max]` at the point of use. Otherwise the static
//! `vision_weight` / `answer_weight` sum is used.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};

use crate::config::LossConfig;
use crate::error::{VisionCotError, VisionCotResult};
use crate::gpu::tensor_to_f32;

fn map_candle(e: candle_core::Error) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("Loss weighting error: {}", e),
    }
}

/// Learned log-variances, one per loss term.
pub struct UncertaintyWeights {
    varmap: VarMap,
    log_var_vision: Tensor,
    log_var_answer: Tensor,
    min: f32,
    max: f32,
}

impl UncertaintyWeights {
    pub const VISION: &'static str = "log_var_vision";
    pub const ANSWER: &'static str = "log_var_answer";

    /// Both log-variances start at 0 (unit weight).
    pub fn new(config: &LossConfig, device: &Device) -> VisionCotResult<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let log_var_vision = vb
            .get_with_hints((), Self::VISION, Init::Const(0.0))
            .map_err(map_candle)?;
        let log_var_answer = vb
            .get_with_hints((), Self::ANSWER, Init::Const(0.0))
            .map_err(map_candle)?;
        Ok(Self {
            varmap,
            log_var_vision,
            log_var_answer,
            min: config.log_var_min,
            max: config.log_var_max,
        })
    }

    /// Variable storage, persisted with the Stage 2 artifact.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Clamped `(vision, answer)` log-variances.
    pub fn log_vars(&self) -> VisionCotResult<(f32, f32)> {
        let v = tensor_to_f32(&self.log_var_vision)?.clamp(self.min, self.max);
        let a = tensor_to_f32(&self.log_var_answer)?.clamp(self.min, self.max);
        Ok((v, a))
    }

    fn term(&self, loss: &Tensor, log_var: &Tensor) -> candle_core::Result<Tensor> {
        let s = log_var.clamp(self.min, self.max)?;
        let precision = s.neg()?.exp()?;
        (precision * loss)? + s
    }
}

/// How active loss terms are summed.
pub enum LossWeighting {
    Uncertainty(UncertaintyWeights),
    Static { vision: f32, answer: f32 },
}

impl LossWeighting {
    /// Weighting selected by `config.uncertainty_weighting`.
    pub fn from_config(config: &LossConfig, device: &Device) -> VisionCotResult<Self> {
        if config.uncertainty_weighting {
            Ok(Self::Uncertainty(UncertaintyWeights::new(config, device)?))
        } else {
            Ok(Self::Static {
                vision: config.vision_weight,
                answer: config.answer_weight,
            })
        }
    }

    /// Sum the active terms. At least one must be present.
    pub fn combine(&self, vision: Option<&Tensor>, answer: Option<&Tensor>) -> VisionCotResult<Tensor> {
        let mut terms = Vec::with_capacity(2);
        match self {
            LossWeighting::Uncertainty(w) => {
                if let Some(v) = vision {
                    terms.push(w.term(v, &w.log_var_vision).map_err(map_candle)?);
                }
                if let Some(a) = answer {
                    terms.push(w.term(a, &w.log_var_answer).map_err(map_candle)?);
                }
            }
            LossWeighting::Static {
                vision: wv,
                answer: wa,
            } => {
                if let Some(v) = vision {
                    terms.push(v.affine(*wv as f64, 0.0).map_err(map_candle)?);
                }
                if let Some(a) = answer {
                    terms.push(a.affine(*wa as f64, 0.0).map_err(map_candle)?);
                }
            }
        }

        let mut iter = terms.into_iter();
        let first = iter.next().ok_or_else(|| {
            VisionCotError::InvalidInput("No active loss term to combine".to_string())
        })?;
        iter.try_fold(first, |acc, t| acc + t).map_err(map_candle)
    }

    /// Trainable variables owned by the weighting (empty when static).
    pub fn vars(&self) -> Vec<Var> {
        match self {
            LossWeighting::Uncertainty(w) => w.vars(),
            LossWeighting::Static { .. } => Vec::new(),
        }
    }

    pub fn uncertainty(&self) -> Option<&UncertaintyWeights> {
        match self {
            LossWeighting::Uncertainty(w) => Some(w),
            LossWeighting::Static { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(v: f32) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_initial_uncertainty_is_plain_sum() {
        let w = LossWeighting::from_config(&LossConfig::default(), &Device::Cpu).unwrap();
        let total = w.combine(Some(&scalar(2.0)), Some(&scalar(3.0))).unwrap();
        assert!((tensor_to_f32(&total).unwrap() - 5.0).abs() < 1e-6);
        assert_eq!(w.vars().len(), 2);
    }

    #[test]
    fn test_log_var_clamped_at_use() {
        let config = LossConfig::default();
        let w = UncertaintyWeights::new(&config, &Device::Cpu).unwrap();
        let mut map = w.varmap().clone();
        map.set_one(UncertaintyWeights::VISION, Tensor::new(100.0f32, &Device::Cpu).unwrap())
            .unwrap();
        let (v, _) = w.log_vars().unwrap();
        assert_eq!(v, config.log_var_max);

        let weighting = LossWeighting::Uncertainty(w);
        let total = weighting.combine(Some(&scalar(1.0)), None).unwrap();
        let expected = (-config.log_var_max).exp() + config.log_var_max;
        assert!((tensor_to_f32(&total).unwrap() - expected).abs() < 1e-4);
    }

    #[test]
    fn test_static_weights() {
        let mut config = LossConfig::default();
        config.uncertainty_weighting = false;
        config.vision_weight = 0.5;
        config.answer_weight = 2.0;
        let w = LossWeighting::from_config(&config, &Device::Cpu).unwrap();
        let total = w.combine(Some(&scalar(2.0)), Some(&scalar(1.0))).unwrap();
        assert!((tensor_to_f32(&total).unwrap() - 3.0).abs() < 1e-6);
        assert!(w.vars().is_empty());
    }

    #[test]
    fn test_no_terms_rejected() {
        let w = LossWeighting::from_config(&LossConfig::default(), &Device::Cpu).unwrap();
        assert!(w.combine(None, None).is_err());
    }
}
