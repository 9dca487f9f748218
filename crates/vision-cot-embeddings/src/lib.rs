//! Vision-token compression of reasoning traces.
//!
//! A reasoning trace is rendered to a single-line bitmap, encoded by a
//! frozen vision encoder into a short sequence of dense embeddings, and a
//! student language model is trained to synthesize that sequence itself.
//! At inference the student emits soft embeddings in place of its written
//! reasoning, then decodes the answer as ordinary tokens.
//!
//! # Architecture
//!
//! ```text
//! reasoning ──Renderer──> Bitmap ──TeacherEncoder──> targets [T, D]
//!                                                         │
//! question ──> [prompt][BEGIN] ──EmbeddingGenerator──> predictions [T, D]
//!                                                         │
//!                                 DistillationLoss + answer cross-entropy
//!
//! inference: [prompt][BEGIN][soft x N][END] ──> answer tokens ──> EOS
//! ```
//!
//! - **Configuration**: [`VisionCotConfig`] (TOML + `VISION_COT_*` env)
//! - **Teacher**: [`teacher::TeacherEncoder`] behind the read-only
//!   [`teacher::VisionEncoder`] trait; never part of a trainable group
//! - **Student**: [`models::VisionCotModel`] with one parameter group per
//!   component
//! - **Training**: [`training`] stage descriptor, loss engine and trainer
//! - **Inference**: [`inference::InferenceEngine`] (soft, then discrete)
//! - **Facade**: [`VisionCotPipeline`]
//!
//! # Example
//!
//! ```rust,ignore
//! use vision_cot_embeddings::{VisionCotConfig, VisionCotPipeline};
//!
//! let mut pipeline = VisionCotPipeline::new(VisionCotConfig::default())?;
//! let losses = pipeline.train_step(
//!     "How many apples?",
//!     "Step 1: 3 bags * 4 apples = 12 apples.",
//!     "12",
//! )?;
//! let out = pipeline.generate("How many apples?", 8, 16, 0.0, 1.0)?;
//! println!("{} ({} soft tokens)", out.answer_text, out.soft_token_count);
//! ```

pub mod accounting;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod generator;
pub mod gpu;
pub mod inference;
pub mod layers;
pub mod models;
pub mod pipeline;
pub mod render;
pub mod teacher;
pub mod tokenizer;
pub mod training;

pub use accounting::CompressionReport;
pub use checkpoint::ArtifactStatus;
pub use config::VisionCotConfig;
pub use error::{VisionCotError, VisionCotResult};
pub use generator::{EmbeddingGenerator, SoftDecoder};
pub use inference::{DecodeOptions, InferenceEngine};
pub use models::{Marker, ParamGroup, VisionCotModel};
pub use pipeline::{ArtifactReport, GenerationOutput, VisionCotPipeline};
pub use render::{Bitmap, GlyphStripRenderer, Renderer};
pub use teacher::{TeacherEncoder, VisionEncoder};
pub use tokenizer::{ByteTokenizer, HfTokenizer, TextTokenizer};
pub use training::{ReasoningSample, StageDescriptor, TrainStepOutput, Trainer, TrainingReport};
