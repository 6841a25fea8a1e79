use std::process::ExitCode;

use anyhow::{Context, Result};
use burn_ndarray::NdArrayDevice;
use clap::Parser;
use ddpg_trader::cli::Cli;
use ddpg_trader::logging::init_logging;
use ddpg_trader::{DefaultBackend, DistributedTrainer};
use tracing::{error, info};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Training failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli
        .resolve_config()
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    info!(config = %cli.config.display(), world_size = config.world_size, "Loaded configuration");

    let trainer = DistributedTrainer::<DefaultBackend>::new(config, vec![NdArrayDevice::Cpu])
        .context("invalid training configuration")?;
    let reports = trainer.run().context("distributed training run failed")?;

    for report in &reports {
        info!(
            rank = report.rank,
            episodes = report.episodes,
            optimizer_steps = report.optimizer_steps,
            "Worker finished"
        );
    }
    Ok(())
}
