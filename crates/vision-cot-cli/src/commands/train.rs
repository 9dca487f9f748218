//! `train`: run the configured stage over a dataset and save artifacts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Args;
use serde::Serialize;
use tracing::{info, warn};
use vision_cot_embeddings::config::StageId;
use vision_cot_embeddings::training::data::{arithmetic_samples, load_samples_jsonl};
use vision_cot_embeddings::training::{DistillationMetrics, SampleLoader};
use vision_cot_embeddings::{Trainer, TrainingReport, VisionCotPipeline};

use super::{blocking, fail, load_config, print_json, EXIT_OK};

/// Arguments for the train command.
#[derive(Args)]
pub struct TrainArgs {
    /// JSONL dataset (overrides `training.dataset_path`; the bundled
    /// arithmetic samples are used when neither is set)
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Stage to train: 1 (bootstrap) or 2 (integration)
    #[arg(short, long, value_parser = parse_stage)]
    pub stage: Option<StageId>,

    /// Number of epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Directory for the stage artifacts (overrides `checkpoints.output_dir`)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Hold out this fraction of the samples and report distillation
    /// metrics on them after training
    #[arg(long, value_parser = parse_fraction)]
    pub eval_fraction: Option<f32>,

    /// Output as JSON instead of human-readable
    #[arg(long)]
    pub json: bool,
}

fn parse_fraction(s: &str) -> Result<f32, String> {
    let v: f32 = s.parse().map_err(|e| format!("invalid fraction '{}': {}", s, e))?;
    if (0.0..1.0).contains(&v) {
        Ok(v)
    } else {
        Err(format!("fraction must be in [0, 1), got {}", v))
    }
}

fn parse_stage(s: &str) -> Result<StageId, String> {
    StageId::parse(s).ok_or_else(|| format!("unknown stage '{}', expected 1 or 2", s))
}

#[derive(Serialize)]
struct TrainOutput {
    report: TrainingReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    evaluation: Option<DistillationMetrics>,
    stage1_artifact: PathBuf,
    stage2_artifact: PathBuf,
}

/// Handle the train command.
///
/// Ctrl-C stops training after the current batch; artifacts are still
/// written.
pub async fn handle_train(config: Option<PathBuf>, args: TrainArgs) -> i32 {
    let cancel = Arc::new(AtomicBool::new(false));
    let watcher = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current batch");
                cancel.store(true, Ordering::Relaxed);
            }
        })
    };

    let json = args.json;
    let result = blocking(move || run(config, args, &cancel)).await;
    watcher.abort();

    match result {
        Ok(output) => {
            if json {
                if let Err(e) = print_json(&output) {
                    return fail(e);
                }
            } else {
                print_report(&output);
            }
            EXIT_OK
        }
        Err(e) => fail(e),
    }
}

fn run(path: Option<PathBuf>, args: TrainArgs, cancel: &AtomicBool) -> anyhow::Result<TrainOutput> {
    let mut config = load_config(path.as_deref())?;
    if let Some(stage) = args.stage {
        config.training.stage = stage;
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }

    let samples = match args.data.as_ref().or(config.training.dataset_path.as_ref()) {
        Some(p) => load_samples_jsonl(p)?,
        None => {
            info!("No dataset configured, using bundled arithmetic samples");
            arithmetic_samples()
        }
    };
    let output_dir = args.output.unwrap_or_else(|| config.checkpoints.output_dir.clone());

    let (samples, held_out) = match args.eval_fraction.filter(|f| *f > 0.0) {
        Some(fraction) => {
            let loader = SampleLoader::new(samples, config.training.batch_size, config.training.seed);
            let (train, eval) = loader.train_eval_split(fraction, config.training.seed);
            info!(train = train.len(), eval = eval.len(), "Held out evaluation samples");
            (train.samples().to_vec(), Some(eval.samples().to_vec()))
        }
        None => (samples, None),
    };

    let trainer = Trainer::from_config(&config.training);
    let mut pipeline = VisionCotPipeline::new(config)?;
    let report = trainer.run(&mut pipeline, samples, cancel)?;
    let evaluation = match held_out {
        Some(eval) => Some(pipeline.evaluate_all(&eval)?),
        None => None,
    };
    let (stage1_artifact, stage2_artifact) = pipeline.save_artifacts(&output_dir)?;

    Ok(TrainOutput {
        report,
        evaluation,
        stage1_artifact,
        stage2_artifact,
    })
}

fn print_report(output: &TrainOutput) {
    for epoch in &output.report.epochs {
        let fmt = |v: Option<f32>| v.map_or_else(|| "-".to_string(), |v| format!("{:.4}", v));
        println!(
            "epoch {:>3}  loss {}  vision {}  answer {}  trained {}  skipped {}  lr {:.2e}  {:.1}s",
            epoch.epoch,
            fmt(epoch.mean_loss),
            fmt(epoch.mean_vision_loss),
            fmt(epoch.mean_answer_loss),
            epoch.samples_trained,
            epoch.samples_skipped,
            epoch.last_learning_rate,
            epoch.elapsed_secs
        );
    }
    if let Some(metrics) = &output.evaluation {
        println!("held-out: {}", metrics.summary());
    }
    if output.report.cancelled {
        println!("Training cancelled");
    }
    println!("Stage 1 artifact: {}", output.stage1_artifact.display());
    println!("Stage 2 artifact: {}", output.stage2_artifact.display());
}
