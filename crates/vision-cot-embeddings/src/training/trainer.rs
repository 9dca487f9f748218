//! Epoch loop over a dataset.
//!
//! Per-sample encoder and numeric failures are skipped inside
//! [`TrainStep::train_batch`]; any error that reaches the trainer aborts
//! the run. A shared flag is checked between batches for cancellation; a
//! batch is one optimizer update, so a raised flag never leaves an update
//! half applied. With `batch_size = 1` that is between samples.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::TrainingConfig;
use crate::error::VisionCotResult;

use super::data::{ReasoningSample, SampleLoader};

/// Losses of one training step. Inactive terms are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainStepOutput {
    /// Combined loss that was backpropagated.
    pub loss: f32,
    /// Embedding regression loss.
    pub vision_loss: Option<f32>,
    /// Answer cross-entropy.
    pub answer_loss: Option<f32>,
}

/// Result of one optimizer step over a batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    /// Samples that contributed to the update.
    pub trained: usize,
    /// Samples dropped for recoverable errors.
    pub skipped: usize,
    /// Mean losses over trained samples; `None` when all were skipped.
    pub losses: Option<TrainStepOutput>,
    /// Learning rate applied, 0 when no update happened.
    pub learning_rate: f64,
}

/// Something that can take one optimizer step over a batch of samples.
pub trait TrainStep {
    /// Train on `samples`, skipping recoverable per-sample failures.
    fn train_batch(&mut self, samples: &[ReasoningSample]) -> VisionCotResult<BatchOutcome>;

    /// Total optimizer steps the run will take, for schedule sizing.
    fn plan_steps(&mut self, _total_steps: usize) {}
}

/// Per-epoch statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub batches: usize,
    pub samples_trained: usize,
    pub samples_skipped: usize,
    pub mean_loss: Option<f32>,
    pub mean_vision_loss: Option<f32>,
    pub mean_answer_loss: Option<f32>,
    pub last_learning_rate: f64,
    pub elapsed_secs: f64,
}

/// Outcome of a full run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochSummary>,
    pub cancelled: bool,
}

impl TrainingReport {
    pub fn samples_trained(&self) -> usize {
        self.epochs.iter().map(|e| e.samples_trained).sum()
    }

    pub fn samples_skipped(&self) -> usize {
        self.epochs.iter().map(|e| e.samples_skipped).sum()
    }
}

#[derive(Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn add(&mut self, v: Option<f32>, weight: usize) {
        if let Some(v) = v {
            self.sum += v as f64 * weight as f64;
            self.count += weight;
        }
    }

    fn get(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.sum / self.count as f64) as f32)
    }
}

/// Epoch/batch driver.
#[derive(Debug, Clone)]
pub struct Trainer {
    epochs: usize,
    batch_size: usize,
    seed: u64,
}

impl Trainer {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            seed: config.seed,
        }
    }

    /// Run every epoch unless `cancel` is raised.
    pub fn run<S: TrainStep>(
        &self,
        step: &mut S,
        samples: Vec<ReasoningSample>,
        cancel: &AtomicBool,
    ) -> VisionCotResult<TrainingReport> {
        let mut loader = SampleLoader::new(samples, self.batch_size, self.seed);
        step.plan_steps(loader.num_batches() * self.epochs);
        info!(
            samples = loader.len(),
            batches_per_epoch = loader.num_batches(),
            epochs = self.epochs,
            "Starting training"
        );

        let mut report = TrainingReport::default();
        for epoch in 0..self.epochs {
            let started = Instant::now();
            loader.shuffle_epoch();

            let mut summary = EpochSummary {
                epoch,
                ..Default::default()
            };
            let (mut loss, mut vision, mut answer) = (Mean::default(), Mean::default(), Mean::default());

            let mut batch_idx = 0;
            while let Some(batch) = loader.next_batch(batch_idx) {
                if cancel.load(Ordering::Relaxed) {
                    warn!(epoch, batch = batch_idx, "Training cancelled");
                    report.cancelled = true;
                    break;
                }
                let outcome = step.train_batch(&batch.samples)?;
                summary.batches += 1;
                summary.samples_trained += outcome.trained;
                summary.samples_skipped += outcome.skipped;
                if let Some(l) = outcome.losses {
                    loss.add(Some(l.loss), outcome.trained);
                    vision.add(l.vision_loss, outcome.trained);
                    answer.add(l.answer_loss, outcome.trained);
                    summary.last_learning_rate = outcome.learning_rate;
                }
                batch_idx += 1;
            }

            summary.mean_loss = loss.get();
            summary.mean_vision_loss = vision.get();
            summary.mean_answer_loss = answer.get();
            summary.elapsed_secs = started.elapsed().as_secs_f64();
            info!(
                epoch,
                trained = summary.samples_trained,
                skipped = summary.samples_skipped,
                loss = ?summary.mean_loss,
                lr = summary.last_learning_rate,
                "Epoch complete"
            );
            report.epochs.push(summary);

            if report.cancelled {
                break;
            }
        }
        Ok(report)
    }
}
