//! Embedding generator: the soft decoding loop shared by training and
//! inference.
//!
//! ```text
//! context = [prompt][begin]
//! loop:
//!     h      = backbone(pending | cache)[last]
//!     pred   = projection(h)
//!     pending = detach(pred)          // fed back, not a gradient path
//! ```
//!
//! Training runs exactly as many steps as the teacher produced targets;
//! inference runs a configured number of steps.

use candle_core::Tensor;
use tracing::trace;

use crate::error::{VisionCotError, VisionCotResult};
use crate::models::Marker;

fn map_candle(e: candle_core::Error) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("Embedding generator error: {}", e),
    }
}

/// Sub-steps of one decoding step, split so each phase can be audited.
///
/// Implemented by [`crate::models::VisionCotModel`]; tests substitute
/// counting stubs.
pub trait SoftDecoder {
    /// Incremental state owned by one generation call.
    type Cache;

    /// Empty cache.
    fn new_cache(&self) -> Self::Cache;

    /// Embeddings of ordinary token ids, `[n, hidden]`.
    fn embed_tokens(&self, ids: &[u32]) -> VisionCotResult<Tensor>;

    /// Embedding of a marker, `[1, hidden]`.
    fn marker_embedding(&self, marker: Marker) -> VisionCotResult<Tensor>;

    /// Feed `embeds: [n, hidden]` after the cached prefix; return the last
    /// position's hidden state `[1, hidden]`.
    fn forward_last(&self, embeds: &Tensor, cache: &mut Self::Cache) -> VisionCotResult<Tensor>;

    /// Hidden state -> predicted soft embedding, `[1, hidden]`.
    fn project_embedding(&self, hidden: &Tensor) -> VisionCotResult<Tensor>;

    /// Hidden state -> vocabulary logits, `[vocab]`.
    fn project_vocab(&self, hidden: &Tensor) -> VisionCotResult<Tensor>;

    /// End-of-sequence token, if the vocabulary has one.
    fn eos_token_id(&self) -> Option<u32>;
}

/// Soft-token generator over a [`SoftDecoder`].
///
/// Owns the cache for the duration of one call. `pending` holds the
/// positions not yet fed to the backbone: the whole `[prompt][begin]`
/// context before the first step, one detached prediction afterwards.
pub struct EmbeddingGenerator<'m, M: SoftDecoder> {
    model: &'m M,
    cache: M::Cache,
    pending: Tensor,
    context_len: usize,
    steps: usize,
}

impl<'m, M: SoftDecoder> EmbeddingGenerator<'m, M> {
    /// Assemble `[prompt][begin]` as the initial context.
    pub fn start(model: &'m M, prompt_ids: &[u32]) -> VisionCotResult<Self> {
        let begin = model.marker_embedding(Marker::Begin)?;
        let pending = if prompt_ids.is_empty() {
            begin
        } else {
            let prompt = model.embed_tokens(prompt_ids)?;
            Tensor::cat(&[&prompt, &begin], 0).map_err(map_candle)?
        };
        Ok(Self {
            model,
            cache: model.new_cache(),
            pending,
            context_len: prompt_ids.len() + 1,
            steps: 0,
        })
    }

    /// One decoding step. Returns the predicted embedding `[1, hidden]`
    /// still attached to the graph; its detached copy becomes the next
    /// pending input and the context grows by one position.
    pub fn step(&mut self) -> VisionCotResult<Tensor> {
        let hidden = self.model.forward_last(&self.pending, &mut self.cache)?;
        let predicted = self.model.project_embedding(&hidden)?;
        self.pending = predicted.detach();
        self.context_len += 1;
        self.steps += 1;
        trace!(step = self.steps, context_len = self.context_len, "Soft step");
        Ok(predicted)
    }

    /// Run `n` steps and stack the predictions, `[n, hidden]`.
    ///
    /// # Errors
    /// - `VisionCotError::InvalidInput` if `n == 0`
    pub fn run(&mut self, n: usize) -> VisionCotResult<Tensor> {
        if n == 0 {
            return Err(VisionCotError::InvalidInput(
                "Embedding generator needs at least one step".to_string(),
            ));
        }
        let mut predictions = Vec::with_capacity(n);
        for _ in 0..n {
            predictions.push(self.step()?);
        }
        Tensor::cat(&predictions, 0).map_err(map_candle)
    }

    /// Steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Positions in the logical context, fed or pending.
    pub fn context_len(&self) -> usize {
        self.context_len
    }

    /// Hand the cache and pending input over to the next phase.
    pub fn into_parts(self) -> (M::Cache, Tensor) {
        (self.cache, self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::cell::Cell;

    /// Records how many positions each forward receives.
    struct ShapeStub {
        fed: Cell<Vec<usize>>,
    }

    impl SoftDecoder for ShapeStub {
        type Cache = usize;

        fn new_cache(&self) -> usize {
            0
        }

        fn embed_tokens(&self, ids: &[u32]) -> VisionCotResult<Tensor> {
            Tensor::ones((ids.len(), 4), DType::F32, &Device::Cpu).map_err(map_candle)
        }

        fn marker_embedding(&self, _marker: Marker) -> VisionCotResult<Tensor> {
            Tensor::zeros((1, 4), DType::F32, &Device::Cpu).map_err(map_candle)
        }

        fn forward_last(&self, embeds: &Tensor, cache: &mut usize) -> VisionCotResult<Tensor> {
            let n = embeds.dims()[0];
            *cache += n;
            let mut fed = self.fed.take();
            fed.push(n);
            self.fed.set(fed);
            embeds.narrow(0, n - 1, 1).map_err(map_candle)
        }

        fn project_embedding(&self, hidden: &Tensor) -> VisionCotResult<Tensor> {
            (hidden + 1.0).map_err(map_candle)
        }

        fn project_vocab(&self, _hidden: &Tensor) -> VisionCotResult<Tensor> {
            unreachable!("generator never projects to vocabulary")
        }

        fn eos_token_id(&self) -> Option<u32> {
            None
        }
    }

    #[test]
    fn test_context_grows_one_per_step() {
        let stub = ShapeStub { fed: Cell::new(Vec::new()) };
        let mut gen = EmbeddingGenerator::start(&stub, &[1, 2, 3]).unwrap();
        assert_eq!(gen.context_len(), 4);
        let preds = gen.run(3).unwrap();
        assert_eq!(preds.dims(), &[3, 4]);
        assert_eq!(gen.context_len(), 7);
        assert_eq!(gen.steps(), 3);
        // prompt+begin once, then one fed-back position per step
        assert_eq!(stub.fed.take(), vec![4, 1, 1]);
        let (cache, pending) = gen.into_parts();
        assert_eq!(cache, 6);
        assert_eq!(pending.dims(), &[1, 4]);
    }

    #[test]
    fn test_feedback_is_previous_prediction() {
        let stub = ShapeStub { fed: Cell::new(Vec::new()) };
        let mut gen = EmbeddingGenerator::start(&stub, &[]).unwrap();
        let preds: Vec<Vec<f32>> = gen.run(3).unwrap().to_vec2().unwrap();
        assert_eq!(preds[0][0], 1.0);
        assert_eq!(preds[1][0], 2.0);
        assert_eq!(preds[2][0], 3.0);
    }

    #[test]
    fn test_zero_steps_rejected() {
        let stub = ShapeStub { fed: Cell::new(Vec::new()) };
        let mut gen = EmbeddingGenerator::start(&stub, &[5]).unwrap();
        assert!(gen.run(0).is_err());
    }
}
