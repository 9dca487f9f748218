//! CLI command handlers
//!
//! # Modules
//!
//! - `train`: epoch training of the configured stage, artifacts saved after
//! - `generate`: soft-then-discrete answer generation
//! - `stats`: compression accounting for one reasoning trace
//! - `check_config`: configuration validation and stage assignment
//!
//! Handlers return the process exit code: 0 = success, 1 = runtime error,
//! 2 = invalid configuration.

pub mod check_config;
pub mod generate;
pub mod stats;
pub mod train;

use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tracing::error;
use vision_cot_embeddings::{VisionCotConfig, VisionCotError};

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;

/// Config file (or defaults) with `VISION_COT_*` overrides applied.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<VisionCotConfig> {
    let config = match path {
        Some(p) => VisionCotConfig::from_file(p)?,
        None => VisionCotConfig::default(),
    };
    Ok(config.with_env_overrides())
}

/// Map an error to an exit code, reporting it on stderr.
pub fn fail(err: anyhow::Error) -> i32 {
    error!("{:#}", err);
    eprintln!("Error: {:#}", err);
    match err.downcast_ref::<VisionCotError>() {
        Some(VisionCotError::ConfigError { .. }) => EXIT_CONFIG,
        _ => EXIT_ERROR,
    }
}

/// Print `value` as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

/// Run blocking compute off the async runtime.
pub async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Worker thread panicked")?
}
