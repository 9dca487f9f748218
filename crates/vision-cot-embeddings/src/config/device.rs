//! Compute device configuration.

use serde::{Deserialize, Serialize};

use crate::error::VisionCotResult;

/// Device selection for all tensor work.
///
/// CUDA is requested by default and silently degrades to CPU when the crate
/// is built without the `cuda` feature or no device is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Request a CUDA device.
    #[serde(default = "default_use_cuda")]
    pub use_cuda: bool,

    /// CUDA ordinal to open when `use_cuda` is set.
    #[serde(default)]
    pub cuda_ordinal: usize,
}

fn default_use_cuda() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            use_cuda: default_use_cuda(),
            cuda_ordinal: 0,
        }
    }
}

impl DeviceConfig {
    /// Validate the configuration. Every combination is currently valid.
    pub fn validate(&self) -> VisionCotResult<()> {
        Ok(())
    }
}
