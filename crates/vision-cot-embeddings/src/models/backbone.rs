//! Decoder-only transformer backbone.
//!
//! Consumes embeddings rather than token ids, so soft tokens and discrete
//! tokens go through the same forward path. Pre-norm blocks, learned
//! absolute positions, causal attention with an incremental [`KvCache`].
//!
//! Tensor names (also the layout expected in a pretrained
//! `model.safetensors`):
//!
//! ```text
//! token_embedding.weight       [vocab, hidden]
//! position_embedding.weight    [max_positions, hidden]
//! layers.{i}.ln1 / attn.{q,k,v,o}_proj / ln2 / fc1 / fc2
//! final_norm.{weight,bias}
//! lm_head.weight               [vocab, hidden]   (output head group)
//! ```

use candle_core::{Device, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};

use crate::config::BackboneConfig;
use crate::error::{VisionCotError, VisionCotResult};
use crate::layers::{causal_mask, BlockConfig, TransformerBlock};

use super::cache::KvCache;

fn map_candle(e: candle_core::Error) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("Backbone forward failed: {}", e),
    }
}

/// Low-rank adapter settings for the backbone's attention layers.
#[derive(Clone)]
pub struct AdapterSpec<'a> {
    pub vb: VarBuilder<'a>,
    pub rank: usize,
    pub alpha: f64,
}

/// Transformer decoder over input embeddings.
pub struct TransformerBackbone {
    token_embedding: Embedding,
    position_embedding: Embedding,
    layers: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    config: BackboneConfig,
    device: Device,
}

impl TransformerBackbone {
    /// Create (or look up) every backbone tensor under `vb`.
    pub fn new(
        config: &BackboneConfig,
        vb: VarBuilder,
        adapter: Option<AdapterSpec>,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let h = config.hidden_size;
        let token_embedding = candle_nn::embedding(config.vocab_size, h, vb.pp("token_embedding"))?;
        let position_embedding =
            candle_nn::embedding(config.max_position_embeddings, h, vb.pp("position_embedding"))?;

        let block = BlockConfig {
            hidden_size: h,
            num_heads: config.num_attention_heads,
            intermediate_size: config.intermediate_size,
            layer_norm_eps: config.layer_norm_eps,
        };
        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                let name = format!("layers.{i}");
                let adapter = adapter
                    .as_ref()
                    .map(|a| (a.vb.pp(&name), a.rank, a.alpha));
                TransformerBlock::new(block, vb.pp(&name), adapter)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let final_norm = candle_nn::layer_norm(h, config.layer_norm_eps, vb.pp("final_norm"))?;

        Ok(Self {
            token_embedding,
            position_embedding,
            layers,
            final_norm,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Backbone geometry.
    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    /// Token embedding table `[vocab, hidden]`.
    pub fn token_embeddings(&self) -> &Tensor {
        self.token_embedding.embeddings()
    }

    /// Fresh cache sized for this backbone.
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.layers.len())
    }

    /// Run `embeds: [n, hidden]` after the cached prefix and return the
    /// final hidden states `[n, hidden]`. The new positions are appended to
    /// `cache`.
    ///
    /// # Errors
    /// - `VisionCotError::InvalidInput` if the sequence would exceed
    ///   `max_position_embeddings`
    pub fn forward_hidden(&self, embeds: &Tensor, cache: &mut KvCache) -> VisionCotResult<Tensor> {
        let (n, h) = embeds.dims2().map_err(map_candle)?;
        if h != self.config.hidden_size {
            return Err(VisionCotError::DimensionMismatch {
                expected: self.config.hidden_size,
                actual: h,
            });
        }
        if n == 0 {
            return Err(VisionCotError::InvalidInput(
                "Backbone forward needs at least one position".to_string(),
            ));
        }
        let past = cache.len();
        if past + n > self.config.max_position_embeddings {
            return Err(VisionCotError::InvalidInput(format!(
                "Sequence length {} exceeds max_position_embeddings {}",
                past + n,
                self.config.max_position_embeddings
            )));
        }

        let positions =
            Tensor::arange(past as u32, (past + n) as u32, &self.device).map_err(map_candle)?;
        let pos = self.position_embedding.forward(&positions).map_err(map_candle)?;
        let mut x = (embeds + pos)
            .and_then(|t| t.unsqueeze(0))
            .map_err(map_candle)?;

        // A single query position may attend to the whole prefix.
        let mask = if n > 1 {
            Some(causal_mask(n, past, &self.device).map_err(map_candle)?)
        } else {
            None
        };

        for (layer, slot) in self.layers.iter().zip(cache.slots_mut().iter_mut()) {
            x = layer.forward(&x, mask.as_ref(), Some(slot)).map_err(map_candle)?;
        }
        cache.advance(n);

        self.final_norm
            .forward(&x)
            .and_then(|t| t.squeeze(0))
            .map_err(map_candle)
    }
}

/// Hidden state -> vocabulary logits.
pub struct OutputHead {
    lm_head: Linear,
}

impl OutputHead {
    /// Create `lm_head.weight` under `vb`.
    pub fn new(hidden_size: usize, vocab_size: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            lm_head: candle_nn::linear_no_bias(hidden_size, vocab_size, vb.pp("lm_head"))?,
        })
    }

    /// `[n, hidden] -> [n, vocab]`.
    pub fn forward(&self, hidden: &Tensor) -> candle_core::Result<Tensor> {
        self.lm_head.forward(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn toy_config() -> BackboneConfig {
        BackboneConfig {
            vocab_size: 20,
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            intermediate_size: 32,
            max_position_embeddings: 12,
            ..Default::default()
        }
    }

    fn backbone(map: &VarMap) -> TransformerBackbone {
        let vb = VarBuilder::from_varmap(map, DType::F32, &Device::Cpu);
        TransformerBackbone::new(&toy_config(), vb, None, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_cached_forward_matches_full() {
        let map = VarMap::new();
        let bb = backbone(&map);
        let ids = Tensor::new(&[1u32, 5, 7, 2], &Device::Cpu).unwrap();
        let embeds = bb.token_embedding.forward(&ids).unwrap();

        let mut full_cache = bb.new_cache();
        let full = bb.forward_hidden(&embeds, &mut full_cache).unwrap();
        assert_eq!(full_cache.len(), 4);

        let mut cache = bb.new_cache();
        bb.forward_hidden(&embeds.narrow(0, 0, 3).unwrap(), &mut cache).unwrap();
        let last = bb.forward_hidden(&embeds.narrow(0, 3, 1).unwrap(), &mut cache).unwrap();

        let a: Vec<f32> = full.get(3).unwrap().to_vec1().unwrap();
        let b: Vec<f32> = last.get(0).unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_position_overflow_rejected() {
        let map = VarMap::new();
        let bb = backbone(&map);
        let embeds = Tensor::zeros((13, 16), DType::F32, &Device::Cpu).unwrap();
        let mut cache = bb.new_cache();
        assert!(matches!(
            bb.forward_hidden(&embeds, &mut cache),
            Err(VisionCotError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_hidden_size_checked() {
        let map = VarMap::new();
        let bb = backbone(&map);
        let embeds = Tensor::zeros((2, 8), DType::F32, &Device::Cpu).unwrap();
        let mut cache = bb.new_cache();
        assert!(matches!(
            bb.forward_hidden(&embeds, &mut cache),
            Err(VisionCotError::DimensionMismatch { expected: 16, actual: 8 })
        ));
    }

    #[test]
    fn test_adapter_vars_separate() {
        let map = VarMap::new();
        let adapter_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&map, DType::F32, &Device::Cpu);
        let spec = AdapterSpec {
            vb: VarBuilder::from_varmap(&adapter_map, DType::F32, &Device::Cpu),
            rank: 2,
            alpha: 4.0,
        };
        TransformerBackbone::new(&toy_config(), vb, Some(spec), &Device::Cpu).unwrap();
        // q and v adapters, A and B each, per layer
        assert_eq!(adapter_map.all_vars().len(), 2 * 2 * 2);
    }
}
