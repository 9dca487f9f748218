//! Low-rank adapters over frozen linear projections.
//!
//! `y = W x + b + (alpha / r) * B (A x)` with `A: [r, in]`, `B: [out, r]`.
//! `B` starts at zero so an untrained adapter leaves the projection unchanged.

use candle_core::{Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

/// Trainable low-rank update.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    a: Tensor,
    b: Tensor,
    scale: f64,
}

impl LoraAdapter {
    /// Create `lora_a` / `lora_b` under `vb`.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        rank: usize,
        alpha: f64,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let stdev = (1.0 / in_dim as f64).sqrt();
        let a = vb.get_with_hints((rank, in_dim), "lora_a", Init::Randn { mean: 0.0, stdev })?;
        let b = vb.get_with_hints((out_dim, rank), "lora_b", Init::Const(0.0))?;
        Ok(Self {
            a,
            b,
            scale: alpha / rank as f64,
        })
    }

    /// Adapter rank.
    pub fn rank(&self) -> usize {
        self.a.dims()[0]
    }

    fn delta(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.broadcast_matmul(&self.a.t()?)?
            .broadcast_matmul(&self.b.t()?)?
            .affine(self.scale, 0.0)
    }
}

/// Linear projection with an optional low-rank adapter.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    base: Linear,
    adapter: Option<LoraAdapter>,
}

impl LoraLinear {
    /// Wrap `base`, optionally adding an adapter.
    pub fn new(base: Linear, adapter: Option<LoraAdapter>) -> Self {
        Self { base, adapter }
    }

    /// Whether an adapter is attached.
    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }
}

impl Module for LoraLinear {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let y = self.base.forward(x)?;
        match &self.adapter {
            Some(adapter) => y + adapter.delta(x)?,
            None => Ok(y),
        }
    }
}
