//! Transformer building blocks shared by the backbone and the teacher encoder.
//!
//! Layers return `candle_core::Result`; callers map errors into
//! [`crate::error::VisionCotError`] with their own context.

mod attention;
mod block;
mod lora;
mod mask;

pub use attention::{KvSlot, SelfAttention};
pub use block::{BlockConfig, TransformerBlock};
pub use lora::{LoraAdapter, LoraLinear};
pub use mask::causal_mask;
