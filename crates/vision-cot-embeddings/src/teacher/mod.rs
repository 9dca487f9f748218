//! Frozen teacher vision encoder.
//!
//! The teacher turns a rendered reasoning bitmap into the target embedding
//! sequence the generator regresses onto. It is exposed only through the
//! read-only [`VisionEncoder`] trait: its weights live outside every
//! trainable parameter group and its outputs are detached.

mod encoder;
mod patches;
mod weights;

pub use encoder::{TeacherEncoder, VisionEncoder};
pub use patches::patchify;
