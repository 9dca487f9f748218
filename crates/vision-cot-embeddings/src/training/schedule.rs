//! Learning-rate schedule over AdamW.

use std::f64::consts::PI;

use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::config::TrainingConfig;
use crate::error::{VisionCotError, VisionCotResult};

/// Linear warmup to `peak_lr`, then cosine decay to zero at `total_steps`.
#[derive(Debug, Clone, Copy)]
pub struct WarmupCosine {
    pub peak_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl WarmupCosine {
    /// Learning rate for zero-based optimizer step `step`.
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.peak_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        self.peak_lr * 0.5 * (1.0 + (PI * progress).cos())
    }
}

/// AdamW whose learning rate follows a [`WarmupCosine`] schedule.
pub struct ScheduledOptimizer {
    optimizer: AdamW,
    schedule: WarmupCosine,
    step: usize,
}

impl ScheduledOptimizer {
    /// Optimise `vars` for `total_steps` steps.
    pub fn new(vars: Vec<Var>, config: &TrainingConfig, total_steps: usize) -> VisionCotResult<Self> {
        let schedule = WarmupCosine {
            peak_lr: config.learning_rate,
            warmup_steps: config.warmup_steps,
            total_steps,
        };
        let params = ParamsAdamW {
            lr: schedule.lr_at(0),
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(vars, params).map_err(|e| VisionCotError::TensorError {
            message: format!("Optimizer creation failed: {}", e),
        })?;
        Ok(Self {
            optimizer,
            schedule,
            step: 0,
        })
    }

    /// Backpropagate `loss` and apply one update. Returns the learning rate
    /// used.
    pub fn backward_step(&mut self, loss: &Tensor) -> VisionCotResult<f64> {
        let lr = self.schedule.lr_at(self.step);
        self.optimizer.set_learning_rate(lr);
        self.optimizer
            .backward_step(loss)
            .map_err(|e| VisionCotError::TensorError {
                message: format!("Backward step failed: {}", e),
            })?;
        self.step += 1;
        Ok(lr)
    }

    /// Optimizer steps taken.
    pub fn step_count(&self) -> usize {
        self.step
    }
}
