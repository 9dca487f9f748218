//! Student model components.
//!
//! - [`TransformerBackbone`]: decoder over embeddings with [`KvCache`]
//! - [`MarkerTable`]: begin / soft-slot / end marker embeddings
//! - [`ProjectionHead`]: hidden state -> predicted vision embedding
//! - [`ParamRegistry`]: one variable map per [`ParamGroup`]
//! - [`VisionCotModel`]: all of the above behind [`crate::generator::SoftDecoder`]

mod backbone;
mod cache;
mod groups;
mod markers;
mod projection;
mod vision_cot;

pub use backbone::{AdapterSpec, OutputHead, TransformerBackbone};
pub use cache::KvCache;
pub use groups::{assign_varmap, snapshot_varmap, ParamGroup, ParamRegistry};
pub use markers::{seeded_markers, Marker, MarkerTable};
pub use projection::ProjectionHead;
pub use vision_cot::VisionCotModel;
