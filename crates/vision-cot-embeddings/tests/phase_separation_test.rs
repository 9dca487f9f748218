//! Soft/discrete phase separation in the inference engine.
//!
//! A counting stub records every sub-step call so the test can check
//! which projections ran in which phase, and how the cache was reused.

use std::cell::RefCell;

use candle_core::{DType, Device, Tensor};
use vision_cot_embeddings::inference::{DecodeOptions, InferenceEngine, StopReason};
use vision_cot_embeddings::{Marker, SoftDecoder, VisionCotResult};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Forward(usize),
    ProjectEmbedding,
    ProjectVocab,
    Marker(Marker),
    EmbedTokens(usize),
}

/// Vocabulary of 8; token 5 always wins, EOS is 7.
struct CountingStub {
    calls: RefCell<Vec<Call>>,
}

impl CountingStub {
    fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
        }
    }

    fn count(&self, call: &Call) -> usize {
        self.calls.borrow().iter().filter(|c| *c == call).count()
    }
}

fn cpu(t: candle_core::Result<Tensor>) -> VisionCotResult<Tensor> {
    t.map_err(|e| vision_cot_embeddings::VisionCotError::TensorError {
        message: e.to_string(),
    })
}

impl SoftDecoder for CountingStub {
    /// Positions fed so far.
    type Cache = usize;

    fn new_cache(&self) -> usize {
        0
    }

    fn embed_tokens(&self, ids: &[u32]) -> VisionCotResult<Tensor> {
        self.calls.borrow_mut().push(Call::EmbedTokens(ids.len()));
        cpu(Tensor::zeros((ids.len(), 4), DType::F32, &Device::Cpu))
    }

    fn marker_embedding(&self, marker: Marker) -> VisionCotResult<Tensor> {
        self.calls.borrow_mut().push(Call::Marker(marker));
        cpu(Tensor::zeros((1, 4), DType::F32, &Device::Cpu))
    }

    fn forward_last(&self, embeds: &Tensor, cache: &mut usize) -> VisionCotResult<Tensor> {
        let n = embeds.dims()[0];
        *cache += n;
        self.calls.borrow_mut().push(Call::Forward(n));
        cpu(embeds.narrow(0, n - 1, 1))
    }

    fn project_embedding(&self, hidden: &Tensor) -> VisionCotResult<Tensor> {
        self.calls.borrow_mut().push(Call::ProjectEmbedding);
        Ok(hidden.clone())
    }

    fn project_vocab(&self, _hidden: &Tensor) -> VisionCotResult<Tensor> {
        self.calls.borrow_mut().push(Call::ProjectVocab);
        cpu(Tensor::new(&[0.0f32, 0.0, 0.0, 0.0, 0.0, 9.0, 0.0, 1.0], &Device::Cpu))
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(7)
    }
}

fn options() -> DecodeOptions {
    DecodeOptions {
        max_soft_tokens: 8,
        max_answer_tokens: 16,
        min_answer_tokens: 1,
        temperature: 0.0,
        top_p: 1.0,
        seed: 1,
    }
}

/// Test: embedding projections all precede vocabulary projections.
#[test]
fn test_projections_never_mix() {
    let stub = CountingStub::new();
    let out = InferenceEngine::new(&stub).decode(&[1, 2, 3], &options()).unwrap();

    assert_eq!(out.soft_token_count, 8);
    assert_eq!(out.answer_ids, vec![5; 16]);
    assert_eq!(out.stop_reason, StopReason::MaxTokens);
    assert_eq!(stub.count(&Call::ProjectEmbedding), 8);
    assert_eq!(stub.count(&Call::ProjectVocab), 16);

    let calls = stub.calls.borrow();
    let last_soft = calls.iter().rposition(|c| *c == Call::ProjectEmbedding).unwrap();
    let first_vocab = calls.iter().position(|c| *c == Call::ProjectVocab).unwrap();
    assert!(last_soft < first_vocab);
}

/// Test: the end marker is the transition and the cache is not rebuilt.
#[test]
fn test_end_marker_transition_reuses_cache() {
    let stub = CountingStub::new();
    InferenceEngine::new(&stub).decode(&[1, 2, 3], &options()).unwrap();
    let calls = stub.calls.borrow();

    let end = calls
        .iter()
        .position(|c| *c == Call::Marker(Marker::End))
        .unwrap();
    assert!(calls[..end].iter().all(|c| *c != Call::ProjectVocab));
    assert!(calls[end..].iter().all(|c| *c != Call::ProjectEmbedding));

    let forwards: Vec<usize> = calls
        .iter()
        .filter_map(|c| match c {
            Call::Forward(n) => Some(*n),
            _ => None,
        })
        .collect();
    // [prompt][begin], 7 fed-back predictions, last prediction + end, 15 tokens
    assert_eq!(forwards[0], 4);
    assert!(forwards[1..8].iter().all(|n| *n == 1));
    assert_eq!(forwards[8], 2);
    assert!(forwards[9..].iter().all(|n| *n == 1));
    assert_eq!(forwards.len(), 8 + 16);
    assert_eq!(forwards.iter().sum::<usize>(), 3 + 1 + 8 + 1 + 15);
}

/// Test: discrete tokens are embedded one at a time after the end marker.
#[test]
fn test_discrete_tokens_fed_back() {
    let stub = CountingStub::new();
    let mut opts = options();
    opts.max_answer_tokens = 3;
    InferenceEngine::new(&stub).decode(&[], &opts).unwrap();

    assert_eq!(stub.count(&Call::EmbedTokens(1)), 3);
    assert_eq!(stub.count(&Call::Marker(Marker::Begin)), 1);
    assert_eq!(stub.count(&Call::Marker(Marker::End)), 1);
}
