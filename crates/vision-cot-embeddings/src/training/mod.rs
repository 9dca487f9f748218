//! Training orchestration for the two-stage distillation schedule.
//!
//! ```text
//! Renderer ──> Teacher ──> targets ──┐
//!                                    ├──> DistillationLoss ──┐
//! prompt ──> EmbeddingGenerator ─────┘                       │
//!        └─> AnswerSequence ──> answer cross-entropy ────────┤
//!                                                            v
//!                                 LossWeighting ──> ScheduledOptimizer
//!                                                  (trainable groups only)
//! ```
//!
//! # Modules
//!
//! - [`stage`]: stage descriptor and parameter-group trainability
//! - [`loss`]: guarded vision loss and masked answer loss
//! - [`uncertainty`]: learned log-variance loss weighting
//! - [`sequence`]: answer-loss sequence layout
//! - [`data`]: reasoning samples and loading
//! - [`schedule`]: AdamW with warmup + cosine decay
//! - [`evaluation`]: distillation quality metrics
//! - [`trainer`]: epoch loop with skip-on-bad-sample policy

pub mod data;
pub mod evaluation;
pub mod loss;
pub mod schedule;
pub mod sequence;
pub mod stage;
pub mod trainer;
pub mod uncertainty;

pub use data::{ReasoningSample, SampleLoader};
pub use evaluation::DistillationMetrics;
pub use loss::{DistillationLoss, LossComponents, VisionLoss};
pub use schedule::{ScheduledOptimizer, WarmupCosine};
pub use sequence::AnswerSequence;
pub use stage::{ActiveLosses, BackboneStrategy, StageDescriptor};
pub use trainer::{BatchOutcome, EpochSummary, TrainStep, TrainStepOutput, Trainer, TrainingReport};
pub use uncertainty::{LossWeighting, UncertaintyWeights};
