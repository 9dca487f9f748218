//! Projection head: backbone hidden state -> predicted vision embedding.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

/// Two-layer GELU MLP, `hidden -> width -> embedding_dim`.
pub struct ProjectionHead {
    fc1: Linear,
    fc2: Linear,
}

impl ProjectionHead {
    pub fn new(
        input_dim: usize,
        hidden_width: usize,
        output_dim: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(input_dim, hidden_width, vb.pp("fc1"))?,
            fc2: candle_nn::linear(hidden_width, output_dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for ProjectionHead {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(x)?.gelu()?)
    }
}
