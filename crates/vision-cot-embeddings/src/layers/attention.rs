//! Multi-head self-attention with an optional key/value cache slot.
//!
//! All transposes are followed by `contiguous()` before matmul.

use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use super::lora::{LoraAdapter, LoraLinear};

/// Cached keys and values of one layer, each `[batch, heads, past, head_dim]`.
pub type KvSlot = Option<(Tensor, Tensor)>;

/// Multi-head self-attention. Query and value projections accept adapters.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    q_proj: LoraLinear,
    k_proj: Linear,
    v_proj: LoraLinear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    /// Build projections under `vb` (`q_proj`, `k_proj`, `v_proj`, `o_proj`).
    ///
    /// When `adapter` is given, `q_proj` and `v_proj` each get a low-rank
    /// adapter under the same names in the adapter builder.
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        vb: VarBuilder,
        adapter: Option<(VarBuilder, usize, f64)>,
    ) -> candle_core::Result<Self> {
        if num_heads == 0 || hidden_size % num_heads != 0 {
            candle_core::bail!(
                "hidden size {} not divisible by {} heads",
                hidden_size,
                num_heads
            );
        }
        let q_base = candle_nn::linear(hidden_size, hidden_size, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("k_proj"))?;
        let v_base = candle_nn::linear(hidden_size, hidden_size, vb.pp("v_proj"))?;
        let o_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("o_proj"))?;

        let (q_adapter, v_adapter) = match adapter {
            Some((avb, rank, alpha)) => (
                Some(LoraAdapter::new(hidden_size, hidden_size, rank, alpha, avb.pp("q_proj"))?),
                Some(LoraAdapter::new(hidden_size, hidden_size, rank, alpha, avb.pp("v_proj"))?),
            ),
            None => (None, None),
        };

        Ok(Self {
            q_proj: LoraLinear::new(q_base, q_adapter),
            k_proj,
            v_proj: LoraLinear::new(v_base, v_adapter),
            o_proj,
            num_heads,
            head_dim: hidden_size / num_heads,
        })
    }

    /// Attend over `x: [batch, seq, hidden]`.
    ///
    /// With `kv`, new keys/values are appended to the slot and attention
    /// covers the cached prefix too. `mask` is added to the raw scores.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        kv: Option<&mut KvSlot>,
    ) -> candle_core::Result<Tensor> {
        let (batch, seq_len, hidden_size) = x.dims3()?;

        let q = self.split_heads(&self.q_proj.forward(x)?, batch, seq_len)?;
        let k = self.split_heads(&self.k_proj.forward(x)?, batch, seq_len)?;
        let v = self.split_heads(&self.v_proj.forward(x)?, batch, seq_len)?;

        let (k, v) = match kv {
            Some(slot) => {
                let (k, v) = match slot.take() {
                    Some((past_k, past_v)) => (
                        Tensor::cat(&[&past_k, &k], 2)?,
                        Tensor::cat(&[&past_v, &v], 2)?,
                    ),
                    None => (k, v),
                };
                *slot = Some((k.clone(), v.clone()));
                (k, v)
            }
            None => (k, v),
        };

        // Q @ K^T / sqrt(head_dim)
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let scores = (q.matmul(&k_t)? / (self.head_dim as f64).sqrt())?;
        let scores = match mask {
            Some(m) => scores.broadcast_add(m)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;

        // [batch, heads, seq, head_dim] -> [batch, seq, hidden]
        let out = probs
            .matmul(&v.contiguous()?)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, hidden_size))?;

        self.o_proj.forward(&out)
    }

    fn split_heads(&self, t: &Tensor, batch: usize, seq_len: usize) -> candle_core::Result<Tensor> {
        t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}
