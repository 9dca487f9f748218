//! `stats`: compression accounting for one reasoning trace.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Args;
use vision_cot_embeddings::VisionCotPipeline;

use super::{blocking, fail, load_config, print_json, EXIT_OK};

/// Arguments for the stats command.
#[derive(Args)]
pub struct StatsArgs {
    /// Reasoning text to measure
    #[arg(short, long, conflicts_with = "file")]
    pub reasoning: Option<String>,

    /// Read the reasoning text from a file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Output as JSON instead of human-readable
    #[arg(long)]
    pub json: bool,
}

/// Handle the stats command.
pub async fn handle_stats(config: Option<PathBuf>, args: StatsArgs) -> i32 {
    let json = args.json;
    let result = blocking(move || {
        let reasoning = match (args.reasoning, args.file) {
            (Some(text), _) => text,
            (None, Some(path)) => std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read '{}'", path.display()))?,
            (None, None) => bail!("one of --reasoning or --file is required"),
        };
        let pipeline = VisionCotPipeline::new(load_config(config.as_deref())?)?;
        Ok(pipeline.compression_stats(&reasoning)?)
    })
    .await;

    match result {
        Ok(report) => {
            if json {
                if let Err(e) = print_json(&report) {
                    return fail(e);
                }
            } else {
                println!("{}", report.summary());
            }
            EXIT_OK
        }
        Err(e) => fail(e),
    }
}
