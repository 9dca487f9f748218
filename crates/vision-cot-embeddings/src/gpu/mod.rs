//! Device selection and shared tensor operations.

mod ops;

pub use ops::{l2_normalize, row_norms, tensor_to_f32};

use candle_core::Device;
use tracing::{info, warn};

use crate::config::DeviceConfig;

/// Open the configured device, degrading to CPU when CUDA is unavailable.
pub fn select_device(config: &DeviceConfig) -> Device {
    if !config.use_cuda {
        return Device::Cpu;
    }

    match Device::cuda_if_available(config.cuda_ordinal) {
        Ok(dev) => {
            if dev.is_cuda() {
                info!(ordinal = config.cuda_ordinal, "CUDA device detected, using GPU");
                dev
            } else {
                warn!("CUDA requested but not available, using CPU");
                Device::Cpu
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to initialize CUDA, using CPU");
            Device::Cpu
        }
    }
}
