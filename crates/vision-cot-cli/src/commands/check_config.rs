//! `check-config`: validate configuration and print the stage assignment.

use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use vision_cot_embeddings::{ParamGroup, StageDescriptor};

use super::{fail, load_config, print_json, EXIT_OK};

/// Arguments for the check-config command.
#[derive(Args)]
pub struct CheckConfigArgs {
    /// Also print the resolved configuration as TOML
    #[arg(long)]
    pub show: bool,

    /// Output as JSON instead of human-readable
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct StageReport {
    stage: u8,
    strategy: Option<String>,
    trainable: Vec<ParamGroup>,
    frozen: Vec<ParamGroup>,
    vision_loss: bool,
    answer_loss: bool,
}

impl StageReport {
    fn new(stage: &StageDescriptor) -> Self {
        let trainable = stage.trainable_groups();
        let frozen = ParamGroup::ALL
            .into_iter()
            .filter(|g| !stage.is_trainable(*g))
            .collect();
        Self {
            stage: stage.stage().number(),
            strategy: stage.strategy().map(|s| s.to_string()),
            trainable,
            frozen,
            vision_loss: stage.losses().vision,
            answer_loss: stage.losses().answer,
        }
    }
}

/// Handle the check-config command.
pub fn handle_check_config(config: Option<PathBuf>, args: CheckConfigArgs) -> i32 {
    match run(config, &args) {
        Ok(()) => EXIT_OK,
        Err(e) => fail(e),
    }
}

fn run(path: Option<PathBuf>, args: &CheckConfigArgs) -> anyhow::Result<()> {
    let config = load_config(path.as_deref())?;
    config.validate()?;
    let stage = StageDescriptor::from_config(&config.training, config.model.lora_rank)?;
    let report = StageReport::new(&stage);

    if args.json {
        return print_json(&report);
    }

    println!("Configuration valid");
    println!("  stage:       {}", report.stage);
    if let Some(strategy) = &report.strategy {
        println!("  strategy:    {}", strategy);
    }
    let names = |groups: &[ParamGroup]| groups.iter().map(|g| g.name()).collect::<Vec<_>>().join(", ");
    println!("  trainable:   {}", names(&report.trainable));
    println!("  frozen:      {}", names(&report.frozen));
    println!(
        "  losses:      vision={} answer={}",
        report.vision_loss, report.answer_loss
    );
    if args.show {
        println!();
        println!("{}", config.to_toml_string()?);
    }
    Ok(())
}
