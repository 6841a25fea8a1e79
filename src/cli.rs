use clap::Parser;
use std::path::PathBuf;

use crate::config::{TrainingConfig, DEFAULT_CONFIG_PATH};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "ddpg-trader")]
#[command(version)]
#[command(about = "Distributed DDPG training for trading agents", long_about = None)]
pub struct Cli {
    /// Training configuration file (json or toml); missing file means defaults
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "DDPG_CONFIG")]
    pub config: PathBuf,

    /// Number of workers, overriding the configuration
    #[arg(short, long = "world-size")]
    pub world_size: Option<usize>,
}

impl Cli {
    /// Load the configuration file and apply command-line overrides
    pub fn resolve_config(&self) -> Result<TrainingConfig> {
        let mut config = TrainingConfig::load(&self.config)?;
        if let Some(world_size) = self.world_size {
            config.world_size = world_size;
        }
        config.validate()?;
        Ok(config)
    }
}
