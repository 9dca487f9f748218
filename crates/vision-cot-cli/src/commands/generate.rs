//! `generate`: answer a question through soft tokens.

use std::path::PathBuf;

use clap::Args;
use tracing::info;
use vision_cot_embeddings::{DecodeOptions, VisionCotPipeline};

use super::{blocking, fail, load_config, print_json, EXIT_OK};

/// Arguments for the generate command.
#[derive(Args)]
pub struct GenerateArgs {
    /// Question prompt
    #[arg(short, long)]
    pub question: String,

    /// Soft tokens to emit before the end marker
    #[arg(long)]
    pub max_soft_tokens: Option<usize>,

    /// Answer token cap
    #[arg(long)]
    pub max_answer_tokens: Option<usize>,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long)]
    pub temperature: Option<f64>,

    /// Nucleus sampling mass
    #[arg(long)]
    pub top_p: Option<f64>,

    /// Output as JSON instead of human-readable
    #[arg(long)]
    pub json: bool,
}

/// Handle the generate command.
pub async fn handle_generate(config: Option<PathBuf>, args: GenerateArgs) -> i32 {
    let json = args.json;
    let result = blocking(move || {
        let config = load_config(config.as_deref())?;
        let defaults = DecodeOptions::from_config(&config.generation);
        let options = DecodeOptions {
            max_soft_tokens: args.max_soft_tokens.unwrap_or(defaults.max_soft_tokens),
            max_answer_tokens: args.max_answer_tokens.unwrap_or(defaults.max_answer_tokens),
            temperature: args.temperature.unwrap_or(defaults.temperature),
            top_p: args.top_p.unwrap_or(defaults.top_p),
            ..defaults
        };
        let pipeline = VisionCotPipeline::new(config)?;
        Ok(pipeline.generate_with(&args.question, &options)?)
    })
    .await;

    match result {
        Ok(output) => {
            info!(
                soft_tokens = output.soft_token_count,
                answer_tokens = output.answer_token_count,
                "Generation complete"
            );
            if json {
                if let Err(e) = print_json(&output) {
                    return fail(e);
                }
            } else {
                println!("{}", output.answer_text);
            }
            EXIT_OK
        }
        Err(e) => fail(e),
    }
}
