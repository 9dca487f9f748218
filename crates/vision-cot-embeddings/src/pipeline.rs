//! End-to-end pipeline: render, encode, distill, decode.
//!
//! [`VisionCotPipeline`] owns every component and exposes the four entry
//! points used by the CLI and tests:
//!
//! | Entry point | Purpose |
//! |-------------|---------|
//! | [`VisionCotPipeline::train_step`] | one optimizer update on one sample |
//! | [`VisionCotPipeline::generate`] | soft-then-discrete answer generation |
//! | [`VisionCotPipeline::compression_stats`] | text vs. vision token counts |
//! | [`VisionCotPipeline::evaluate`] | distillation quality, no update |
//!
//! Stage artifacts configured in `[checkpoints]` are loaded at construction.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::accounting::{self, CompressionReport};
use crate::checkpoint::{self, artifact_file_name, ArtifactStatus};
use crate::config::{StageId, VisionCotConfig};
use crate::error::{VisionCotError, VisionCotResult};
use crate::generator::{EmbeddingGenerator, SoftDecoder};
use crate::gpu::{select_device, tensor_to_f32};
use crate::inference::{DecodeOptions, InferenceEngine, StopReason};
use crate::models::VisionCotModel;
use crate::render::{GlyphStripRenderer, Renderer};
use crate::teacher::{TeacherEncoder, VisionEncoder};
use crate::tokenizer::{load_tokenizer, TextTokenizer};
use crate::training::{
    AnswerSequence, BatchOutcome, DistillationLoss, DistillationMetrics, LossWeighting,
    ReasoningSample, ScheduledOptimizer, StageDescriptor, TrainStep, TrainStepOutput,
};

fn map_candle(e: candle_core::Error) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("Pipeline error: {}", e),
    }
}

/// Schedule length used when neither the config nor the trainer sizes it.
const DEFAULT_SCHEDULE_STEPS: usize = 10_000;

/// Answer produced by [`VisionCotPipeline::generate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutput {
    pub answer_text: String,
    pub soft_token_count: usize,
    pub answer_token_count: usize,
    pub stop_reason: StopReason,
}

/// Load outcome of both stage artifacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactReport {
    pub stage1: ArtifactStatus,
    pub stage2: ArtifactStatus,
}

/// Graph and scalar values of one sample's losses.
struct SampleLosses {
    total: Tensor,
    vision: Option<f32>,
    answer: Option<f32>,
}

/// Every component of the compression pipeline.
pub struct VisionCotPipeline {
    config: VisionCotConfig,
    device: Device,
    tokenizer: Box<dyn TextTokenizer>,
    renderer: Box<dyn Renderer>,
    teacher: Box<dyn VisionEncoder>,
    model: VisionCotModel,
    loss: DistillationLoss,
    weighting: LossWeighting,
    optimizer: Option<ScheduledOptimizer>,
    planned_steps: Option<usize>,
    artifacts: ArtifactReport,
}

impl VisionCotPipeline {
    /// Validate `config` and build every component.
    ///
    /// # Errors
    /// - `VisionCotError::ConfigError` for invalid configuration, including
    ///   a Stage 2 request without exactly one backbone strategy
    /// - `VisionCotError::ModelLoadError` / `TokenizerError` for configured
    ///   but unreadable model handles
    pub fn new(config: VisionCotConfig) -> VisionCotResult<Self> {
        config.validate()?;
        let device = select_device(&config.device);
        let stage = StageDescriptor::from_config(&config.training, config.model.lora_rank)?;

        let tokenizer = load_tokenizer(config.model.tokenizer_path.as_deref())?;
        let eos = tokenizer.eos_token_id().or(config.model.backbone.eos_token_id);
        let model = VisionCotModel::new(&config, stage, eos, &device)?;
        if tokenizer.vocab_size() > model.base_vocab_size() {
            return Err(VisionCotError::ConfigError {
                message: format!(
                    "tokenizer vocabulary {} exceeds backbone vocabulary {}",
                    tokenizer.vocab_size(),
                    model.base_vocab_size()
                ),
            });
        }

        let renderer: Box<dyn Renderer> = Box::new(GlyphStripRenderer::new(
            config.teacher.image_height,
            config.teacher.patch_width,
        ));
        let teacher: Box<dyn VisionEncoder> = Box::new(TeacherEncoder::new(
            &config.teacher,
            config.model.embedding_dim,
            &device,
        )?);
        let loss = DistillationLoss::new(config.loss.clone());
        let weighting = LossWeighting::from_config(&config.loss, &device)?;

        let mut pipeline = Self {
            config,
            device,
            tokenizer,
            renderer,
            teacher,
            model,
            loss,
            weighting,
            optimizer: None,
            planned_steps: None,
            artifacts: ArtifactReport {
                stage1: ArtifactStatus::NotConfigured,
                stage2: ArtifactStatus::NotConfigured,
            },
        };
        pipeline.artifacts = pipeline.load_artifacts();

        info!(
            stage = pipeline.model.stage().stage().number(),
            strategy = ?pipeline.model.stage().strategy().map(|s| s.to_string()),
            device = ?pipeline.device,
            "Pipeline ready"
        );
        Ok(pipeline)
    }

    /// Replace the renderer. Its height must match the teacher's input.
    pub fn with_renderer(mut self, renderer: Box<dyn Renderer>) -> VisionCotResult<Self> {
        if renderer.height() != self.config.teacher.image_height {
            return Err(VisionCotError::ConfigError {
                message: format!(
                    "renderer height {} differs from teacher image_height {}",
                    renderer.height(),
                    self.config.teacher.image_height
                ),
            });
        }
        self.renderer = renderer;
        Ok(self)
    }

    /// Replace the teacher encoder. Its output must match the embedding
    /// dimensionality.
    pub fn with_teacher(mut self, teacher: Box<dyn VisionEncoder>) -> VisionCotResult<Self> {
        if teacher.output_dim() != self.config.model.embedding_dim {
            return Err(VisionCotError::DimensionMismatch {
                expected: self.config.model.embedding_dim,
                actual: teacher.output_dim(),
            });
        }
        self.teacher = teacher;
        Ok(self)
    }

    pub fn config(&self) -> &VisionCotConfig {
        &self.config
    }

    pub fn model(&self) -> &VisionCotModel {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.tokenizer.as_ref()
    }

    /// Load status of the configured stage artifacts.
    pub fn artifacts(&self) -> &ArtifactReport {
        &self.artifacts
    }

    /// Optimizer steps taken so far.
    pub fn steps_taken(&self) -> usize {
        self.optimizer.as_ref().map_or(0, |o| o.step_count())
    }

    // ------------------------------------------------------------------
    // Training
    // ------------------------------------------------------------------

    /// Teacher targets for a reasoning trace, `[T, D]`.
    fn teacher_targets(&self, reasoning: &str) -> VisionCotResult<Tensor> {
        let bitmap = self.renderer.render(reasoning)?;
        let targets = self.teacher.encode(&bitmap)?;
        let steps = targets.dims().first().copied().unwrap_or(0);
        if steps == 0 {
            return Err(VisionCotError::EncoderError {
                message: "Teacher produced no target embeddings".to_string(),
            });
        }
        Ok(targets)
    }

    /// Forward pass and loss for one sample under the active stage.
    fn sample_losses(&self, question: &str, reasoning: &str, answer: &str) -> VisionCotResult<SampleLosses> {
        let active = self.model.stage().losses();
        let targets = self.teacher_targets(reasoning)?;
        let steps = targets.dims()[0];
        let prompt = self.tokenizer.encode(question)?;
        let answer_ids = if active.answer {
            self.tokenizer.encode(answer)?
        } else {
            Vec::new()
        };
        self.check_fits(prompt.len(), steps, active.answer.then_some(answer_ids.len()))?;

        let mut generator = EmbeddingGenerator::start(&self.model, &prompt)?;
        let predictions = generator.run(steps)?;
        drop(generator);

        let vision = if active.vision {
            Some(self.loss.vision_loss(&predictions, &targets)?.loss)
        } else {
            None
        };

        let answer = if active.answer {
            let sequence = AnswerSequence::build(
                &prompt,
                steps,
                &answer_ids,
                self.model.eos_token_id(),
                self.model.base_vocab_size(),
            );
            let embeds = sequence.embed(&self.model, &predictions.detach())?;
            let mut cache = self.model.new_cache();
            let hidden = self.model.forward_hidden(&embeds, &mut cache)?;
            let logits = self.model.logits(&hidden)?;
            Some(self.loss.answer_loss(&logits, sequence.labels())?)
        } else {
            None
        };

        let total = self.weighting.combine(vision.as_ref(), answer.as_ref())?;
        let total_value = tensor_to_f32(&total)?;
        if !total_value.is_finite() {
            return Err(VisionCotError::NumericError {
                message: format!("Combined loss is {}", total_value),
            });
        }

        Ok(SampleLosses {
            total,
            vision: vision.as_ref().map(tensor_to_f32).transpose()?,
            answer: answer.as_ref().map(tensor_to_f32).transpose()?,
        })
    }

    /// Reject a sample whose layout cannot be run or supervised.
    ///
    /// The soft run occupies `prompt + 1 + steps - 1` positions; the answer
    /// sequence `prompt + 1 + steps + 1 + answer`.
    fn check_fits(&self, prompt: usize, steps: usize, answer: Option<usize>) -> VisionCotResult<()> {
        let limit = self.model.max_positions();
        let needed = match answer {
            Some(a) => prompt + steps + 2 + a,
            None => prompt + steps,
        };
        if needed > limit {
            return Err(VisionCotError::SampleError {
                message: format!(
                    "needs {} positions (prompt {}, vision tokens {}), backbone supports {}",
                    needed, prompt, steps, limit
                ),
            });
        }
        if answer == Some(0) && self.model.eos_token_id().is_none() {
            return Err(VisionCotError::SampleError {
                message: "empty answer and no EOS token leaves nothing to supervise".to_string(),
            });
        }
        Ok(())
    }

    fn build_optimizer(&self) -> VisionCotResult<ScheduledOptimizer> {
        let mut vars = self.model.trainable_vars();
        vars.extend(self.weighting.vars());
        let total_steps = self
            .config
            .training
            .total_steps
            .or(self.planned_steps)
            .unwrap_or(DEFAULT_SCHEDULE_STEPS);
        info!(vars = vars.len(), total_steps, "Creating optimizer");
        ScheduledOptimizer::new(vars, &self.config.training, total_steps)
    }

    fn apply_update(&mut self, loss: &Tensor) -> VisionCotResult<f64> {
        let optimizer = match self.optimizer.take() {
            Some(o) => o,
            None => self.build_optimizer()?,
        };
        self.optimizer.insert(optimizer).backward_step(loss)
    }

    /// Train on one sample: render and encode the reasoning, run the
    /// teacher-forced generator, compute the active losses and apply one
    /// optimizer update to the trainable groups.
    ///
    /// # Errors
    /// - `VisionCotError::EncoderError` if the teacher rejects the bitmap
    /// - `VisionCotError::NumericError` if no finite loss could be formed
    pub fn train_step(&mut self, question: &str, reasoning: &str, answer: &str) -> VisionCotResult<TrainStepOutput> {
        let losses = self.sample_losses(question, reasoning, answer)?;
        let lr = self.apply_update(&losses.total)?;
        let output = TrainStepOutput {
            loss: tensor_to_f32(&losses.total)?,
            vision_loss: losses.vision,
            answer_loss: losses.answer,
        };
        debug!(loss = output.loss, lr, "Train step");
        Ok(output)
    }

    // ------------------------------------------------------------------
    // Inference
    // ------------------------------------------------------------------

    /// Generate an answer, overriding the configured limits and sampling.
    pub fn generate(
        &self,
        question: &str,
        max_soft_tokens: usize,
        max_answer_tokens: usize,
        temperature: f64,
        top_p: f64,
    ) -> VisionCotResult<GenerationOutput> {
        let options = DecodeOptions {
            max_soft_tokens,
            max_answer_tokens,
            temperature,
            top_p,
            ..DecodeOptions::from_config(&self.config.generation)
        };
        self.generate_with(question, &options)
    }

    /// Generate an answer with explicit decode options.
    pub fn generate_with(&self, question: &str, options: &DecodeOptions) -> VisionCotResult<GenerationOutput> {
        let prompt = self.tokenizer.encode(question)?;
        let decoded = InferenceEngine::new(&self.model).decode(&prompt, options)?;
        let answer_text = self.tokenizer.decode(&decoded.answer_ids)?;
        Ok(GenerationOutput {
            answer_text,
            soft_token_count: decoded.soft_token_count,
            answer_token_count: decoded.answer_ids.len(),
            stop_reason: decoded.stop_reason,
        })
    }

    /// Text-token count of `reasoning` against the teacher's vision-token
    /// count for its rendering.
    pub fn compression_stats(&self, reasoning: &str) -> VisionCotResult<CompressionReport> {
        let original = self.tokenizer.count_tokens(reasoning)?;
        let bitmap = self.renderer.render(reasoning)?;
        let synthesized = self.teacher.encode(&bitmap)?.dims().first().copied().unwrap_or(0);
        Ok(accounting::report(original, synthesized))
    }

    /// Distillation quality on one sample. No parameters change.
    pub fn evaluate(&self, sample: &ReasoningSample) -> VisionCotResult<DistillationMetrics> {
        let targets = self.teacher_targets(&sample.reasoning)?;
        let prompt = self.tokenizer.encode(&sample.question)?;
        let steps = targets.dims()[0];
        self.check_fits(prompt.len(), steps, None)?;
        let mut generator = EmbeddingGenerator::start(&self.model, &prompt)?;
        let predictions = generator.run(steps)?.detach();
        DistillationMetrics::compare(&predictions, &targets)
    }

    /// Token-weighted metrics over `samples`, skipping recoverable failures.
    pub fn evaluate_all(&self, samples: &[ReasoningSample]) -> VisionCotResult<DistillationMetrics> {
        let mut parts = Vec::with_capacity(samples.len());
        for sample in samples {
            match self.evaluate(sample) {
                Ok(m) => parts.push(m),
                Err(e) if e.is_sample_recoverable() => {
                    warn!(error = %e, "Skipping sample in evaluation");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(DistillationMetrics::merge(&parts))
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    /// Write both stage artifacts into `dir`. Returns their paths.
    pub fn save_artifacts(&self, dir: &Path) -> VisionCotResult<(PathBuf, PathBuf)> {
        let uncertainty = self.weighting.uncertainty();
        let registry = self.model.registry();
        let stage1 = dir.join(artifact_file_name(StageId::Bootstrap));
        let stage2 = dir.join(artifact_file_name(StageId::Integration));
        checkpoint::save_stage(registry, uncertainty, StageId::Bootstrap, &stage1)?;
        checkpoint::save_stage(registry, uncertainty, StageId::Integration, &stage2)?;
        Ok((stage1, stage2))
    }

    /// Load the stage artifacts named in `[checkpoints]`.
    ///
    /// Never fails; missing or malformed artifacts leave their groups as
    /// they are and are reported per artifact.
    pub fn load_artifacts(&self) -> ArtifactReport {
        let load = |stage: StageId, path: Option<&PathBuf>| match path {
            Some(p) => checkpoint::load_stage(
                self.model.registry(),
                self.weighting.uncertainty(),
                stage,
                p,
                &self.device,
            ),
            None => ArtifactStatus::NotConfigured,
        };
        ArtifactReport {
            stage1: load(StageId::Bootstrap, self.config.checkpoints.stage1_path.as_ref()),
            stage2: load(StageId::Integration, self.config.checkpoints.stage2_path.as_ref()),
        }
    }
}

impl TrainStep for VisionCotPipeline {
    /// Average the losses of every usable sample and apply one update.
    fn train_batch(&mut self, samples: &[ReasoningSample]) -> VisionCotResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut totals = Vec::with_capacity(samples.len());
        let (mut vision_sum, mut answer_sum) = (None::<f32>, None::<f32>);

        for sample in samples {
            match self.sample_losses(&sample.question, &sample.reasoning, &sample.answer) {
                Ok(l) => {
                    if let Some(v) = l.vision {
                        *vision_sum.get_or_insert(0.0) += v;
                    }
                    if let Some(a) = l.answer {
                        *answer_sum.get_or_insert(0.0) += a;
                    }
                    totals.push(l.total);
                }
                Err(e) if e.is_sample_recoverable() => {
                    warn!(error = %e, question = %sample.question, "Skipping sample");
                    outcome.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        outcome.trained = totals.len();
        if totals.is_empty() {
            return Ok(outcome);
        }
        let n = totals.len() as f32;
        let loss = Tensor::stack(&totals, 0)
            .and_then(|t| t.mean_all())
            .map_err(map_candle)?;
        outcome.learning_rate = self.apply_update(&loss)?;
        outcome.losses = Some(TrainStepOutput {
            loss: tensor_to_f32(&loss)?,
            vision_loss: vision_sum.map(|v| v / n),
            answer_loss: answer_sum.map(|a| a / n),
        });
        Ok(outcome)
    }

    fn plan_steps(&mut self, total_steps: usize) {
        self.planned_steps = Some(total_steps);
    }
}
