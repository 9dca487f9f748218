//! Two-phase generation: soft embeddings first, then discrete answer
//! tokens, sharing one incremental cache.

mod engine;
mod phase;

pub use engine::{DecodeOptions, DecodeOutput, InferenceEngine, StopReason};
pub use phase::{DecodePhase, PhaseEvent};
