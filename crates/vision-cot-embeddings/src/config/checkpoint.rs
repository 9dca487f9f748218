//! Stage artifact locations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{VisionCotError, VisionCotResult};

/// Where stage artifacts are read from and written to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Stage 1 artifact (projection head + markers) to load at startup.
    #[serde(default)]
    pub stage1_path: Option<PathBuf>,

    /// Stage 2 artifact (backbone / adapters / output head) to load at startup.
    #[serde(default)]
    pub stage2_path: Option<PathBuf>,

    /// Directory new artifacts are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            stage1_path: None,
            stage2_path: None,
            output_dir: default_output_dir(),
        }
    }
}

impl CheckpointConfig {
    /// Validate artifact locations.
    pub fn validate(&self) -> VisionCotResult<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(VisionCotError::ConfigError {
                message: "output_dir cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}
