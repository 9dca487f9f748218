//! Inference engine over any [`SoftDecoder`].

use candle_core::{DType, Tensor};
use candle_transformers::generation::LogitsProcessor;
use serde::Serialize;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{VisionCotError, VisionCotResult};
use crate::generator::{EmbeddingGenerator, SoftDecoder};
use crate::models::Marker;

use super::phase::{DecodePhase, PhaseEvent};

fn map_candle(e: candle_core::Error) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("Inference error: {}", e),
    }
}

/// Per-call decoding limits and sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOptions {
    pub max_soft_tokens: usize,
    pub max_answer_tokens: usize,
    /// EOS is masked until this many answer tokens exist.
    pub min_answer_tokens: usize,
    /// 0 selects greedy decoding.
    pub temperature: f64,
    /// Nucleus mass; 1 disables nucleus filtering.
    pub top_p: f64,
    pub seed: u64,
}

impl DecodeOptions {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_soft_tokens: config.max_soft_tokens,
            max_answer_tokens: config.max_answer_tokens,
            min_answer_tokens: config.min_answer_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            seed: config.seed,
        }
    }

    fn validate(&self) -> VisionCotResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(VisionCotError::InvalidInput(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(VisionCotError::InvalidInput(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }

    fn logits_processor(&self) -> LogitsProcessor {
        let temperature = (self.temperature > 0.0).then_some(self.temperature);
        let top_p = (self.top_p < 1.0).then_some(self.top_p);
        LogitsProcessor::new(self.seed, temperature, top_p)
    }
}

/// Why the discrete phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Eos,
    MaxTokens,
}

/// Result of one decode call.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOutput {
    /// Answer token ids, EOS excluded.
    pub answer_ids: Vec<u32>,
    pub soft_token_count: usize,
    pub stop_reason: StopReason,
}

/// Soft-then-discrete decoder.
///
/// The cache is created per call and handed from the soft phase to the
/// discrete phase unchanged; only the detached last prediction and the end
/// marker are fed when the discrete phase starts.
pub struct InferenceEngine<'m, M: SoftDecoder> {
    model: &'m M,
}

impl<'m, M: SoftDecoder> InferenceEngine<'m, M> {
    pub fn new(model: &'m M) -> Self {
        Self { model }
    }

    /// Decode an answer for `prompt_ids`.
    ///
    /// # Errors
    /// - `VisionCotError::InvalidInput` for out-of-range sampling parameters
    ///   or a context longer than the backbone supports
    pub fn decode(&self, prompt_ids: &[u32], options: &DecodeOptions) -> VisionCotResult<DecodeOutput> {
        options.validate()?;
        let mut phase = DecodePhase::Soft;

        let mut generator = EmbeddingGenerator::start(self.model, prompt_ids)?;
        for _ in 0..options.max_soft_tokens {
            phase.require(DecodePhase::Soft)?;
            generator.step()?;
            phase = phase.on(PhaseEvent::SoftStep)?;
        }
        let soft_token_count = generator.steps();
        let (mut cache, pending) = generator.into_parts();

        let end = self.model.marker_embedding(Marker::End)?;
        let mut input = Tensor::cat(&[&pending, &end], 0).map_err(map_candle)?;
        phase = phase.on(PhaseEvent::EndMarker)?;
        debug!(soft_token_count, "Soft phase complete");

        let eos = self.model.eos_token_id();
        let mut processor = options.logits_processor();
        let mut answer_ids = Vec::new();
        let stop_reason = loop {
            if answer_ids.len() >= options.max_answer_tokens {
                phase = phase.on(PhaseEvent::AnswerCap)?;
                break StopReason::MaxTokens;
            }
            phase.require(DecodePhase::Discrete)?;

            let hidden = self.model.forward_last(&input, &mut cache)?;
            let mut logits = self.model.project_vocab(&hidden)?;
            if let Some(eos) = eos {
                if answer_ids.len() < options.min_answer_tokens {
                    logits = mask_token(&logits, eos)?;
                }
            }
            let token = processor.sample(&logits).map_err(map_candle)?;

            if Some(token) == eos {
                phase = phase.on(PhaseEvent::Eos)?;
                break StopReason::Eos;
            }
            answer_ids.push(token);
            phase = phase.on(PhaseEvent::Token)?;
            input = self.model.embed_tokens(&[token])?;
        };
        debug_assert_eq!(phase, DecodePhase::Done);

        debug!(
            answer_tokens = answer_ids.len(),
            stop_reason = ?stop_reason,
            "Discrete phase complete"
        );

        Ok(DecodeOutput {
            answer_ids,
            soft_token_count,
            stop_reason,
        })
    }
}

fn mask_token(logits: &Tensor, id: u32) -> VisionCotResult<Tensor> {
    let mut values: Vec<f32> = logits
        .to_dtype(DType::F32)
        .and_then(|l| l.to_vec1())
        .map_err(map_candle)?;
    if let Some(v) = values.get_mut(id as usize) {
        *v = f32::NEG_INFINITY;
    }
    Tensor::new(values, logits.device()).map_err(map_candle)
}
