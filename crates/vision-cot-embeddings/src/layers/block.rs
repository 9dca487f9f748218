//! Pre-norm transformer block.

use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use super::attention::{KvSlot, SelfAttention};

/// Dimensions of one block.
#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    pub layer_norm_eps: f64,
}

/// `x + attn(ln1(x))` followed by `h + fc2(gelu(fc1(ln2(h))))`.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    ln1: LayerNorm,
    attn: SelfAttention,
    ln2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl TransformerBlock {
    /// Build a block under `vb` (`ln1`, `attn`, `ln2`, `fc1`, `fc2`).
    ///
    /// `adapter` is `(builder, rank, alpha)` for attention adapters; the
    /// builder is scoped as `attn` inside it.
    pub fn new(
        config: BlockConfig,
        vb: VarBuilder,
        adapter: Option<(VarBuilder, usize, f64)>,
    ) -> candle_core::Result<Self> {
        let h = config.hidden_size;
        let adapter = adapter.map(|(avb, rank, alpha)| (avb.pp("attn"), rank, alpha));
        Ok(Self {
            ln1: candle_nn::layer_norm(h, config.layer_norm_eps, vb.pp("ln1"))?,
            attn: SelfAttention::new(h, config.num_heads, vb.pp("attn"), adapter)?,
            ln2: candle_nn::layer_norm(h, config.layer_norm_eps, vb.pp("ln2"))?,
            fc1: candle_nn::linear(h, config.intermediate_size, vb.pp("fc1"))?,
            fc2: candle_nn::linear(config.intermediate_size, h, vb.pp("fc2"))?,
        })
    }

    /// Run the block over `x: [batch, seq, hidden]`.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        kv: Option<&mut KvSlot>,
    ) -> candle_core::Result<Tensor> {
        let attn_out = self.attn.forward(&self.ln1.forward(x)?, mask, kv)?;
        let h = (x + attn_out)?;
        let mlp_out = self
            .fc2
            .forward(&self.fc1.forward(&self.ln2.forward(&h)?)?.gelu()?)?;
        h + mlp_out
    }
}
