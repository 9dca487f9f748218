//! Token-level layout of the answer-loss sequence.
//!
//! ```text
//! ids:    [prompt][BEGIN][SLOT x T][END][answer]
//! labels:  None .................. a0  a1 .. EOS
//! ```
//!
//! Each position is labelled with the token that should follow it, but
//! only from the END marker onwards; every earlier position is masked.
//! SLOT placeholders are replaced by the synthesized embeddings when the
//! sequence is embedded.

use candle_core::Tensor;

use crate::error::{VisionCotError, VisionCotResult};
use crate::models::{Marker, VisionCotModel};

/// Ids and labels for one answer-loss forward pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerSequence {
    ids: Vec<u32>,
    labels: Vec<Option<u32>>,
    soft_start: usize,
    soft_len: usize,
}

impl AnswerSequence {
    /// Lay out `[prompt][BEGIN][SLOT x soft_len][END][answer]`.
    ///
    /// The label after the last answer token is `eos` when given.
    pub fn build(
        prompt: &[u32],
        soft_len: usize,
        answer: &[u32],
        eos: Option<u32>,
        base_vocab: usize,
    ) -> Self {
        let slot = Marker::SoftSlot.token_id(base_vocab);
        let mut ids = Vec::with_capacity(prompt.len() + soft_len + answer.len() + 2);
        ids.extend_from_slice(prompt);
        ids.push(Marker::Begin.token_id(base_vocab));
        let soft_start = ids.len();
        ids.extend(std::iter::repeat(slot).take(soft_len));
        let end_pos = ids.len();
        ids.push(Marker::End.token_id(base_vocab));
        ids.extend_from_slice(answer);

        let mut labels = vec![None; end_pos];
        labels.extend(answer.iter().map(|&t| Some(t)));
        labels.push(eos);

        Self {
            ids,
            labels,
            soft_start,
            soft_len,
        }
    }

    /// Token ids, with SLOT placeholders in the soft region.
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Next-token labels, `None` where masked.
    pub fn labels(&self) -> &[Option<u32>] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Positions that contribute to the answer loss.
    pub fn num_labelled(&self) -> usize {
        self.labels.iter().filter(|l| l.is_some()).count()
    }

    /// Embed the sequence, substituting `soft: [T, hidden]` for the slots.
    pub fn embed(&self, model: &VisionCotModel, soft: &Tensor) -> VisionCotResult<Tensor> {
        let rows = soft.dims().first().copied().unwrap_or(0);
        if rows != self.soft_len {
            return Err(VisionCotError::DimensionMismatch {
                expected: self.soft_len,
                actual: rows,
            });
        }
        let soft_end = self.soft_start + self.soft_len;
        let head = model.embed_ids(&self.ids[..self.soft_start])?;
        let tail = model.embed_ids(&self.ids[soft_end..])?;
        let parts: Vec<&Tensor> = if self.soft_len == 0 {
            vec![&head, &tail]
        } else {
            vec![&head, soft, &tail]
        };
        Tensor::cat(&parts, 0).map_err(|e| VisionCotError::TensorError {
            message: format!("Answer sequence assembly failed: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_labels() {
        let seq = AnswerSequence::build(&[10, 11], 3, &[20, 21], Some(99), 100);
        assert_eq!(seq.ids(), &[10, 11, 100, 101, 101, 101, 102, 20, 21]);
        let labels = seq.labels();
        assert_eq!(labels.len(), seq.len());
        assert!(labels[..6].iter().all(|l| l.is_none()));
        // END predicts the first answer token, last answer token predicts EOS
        assert_eq!(&labels[6..], &[Some(20), Some(21), Some(99)]);
        assert_eq!(seq.num_labelled(), 3);
    }

    #[test]
    fn test_without_eos_last_position_masked() {
        let seq = AnswerSequence::build(&[], 1, &[5], None, 50);
        assert_eq!(seq.ids(), &[50, 51, 52, 5]);
        assert_eq!(seq.labels(), &[None, None, Some(5), None]);
    }
}
