//! Training configuration
//!
//! Every option has a documented default; a missing configuration file is
//! not an error. Sources are layered as: defaults, optional file,
//! `DDPG_*` environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::algorithms::AgentConfig;
use crate::error::{Result, TrainerError};

/// Default location of the training configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/training_config.json";

/// Complete configuration for a (possibly distributed) training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Per-worker mini-batch size for every accumulation sub-batch
    pub batch_size: usize,
    /// Sub-batches accumulated before one synchronized optimizer step
    pub accumulation_steps: usize,
    /// Number of workers
    pub world_size: usize,
    /// Market state dimension
    pub state_dim: usize,
    /// Action dimension
    pub action_dim: usize,
    /// Hidden width of both networks
    pub hidden_dim: usize,
    /// Policy learning rate
    pub lr_actor: f64,
    /// Value learning rate
    pub lr_critic: f64,
    /// Episodes per worker
    pub episodes: usize,
    /// Step cap per episode
    pub max_steps_per_episode: usize,
    /// Environment steps between accumulation cycles
    pub train_freq: usize,
    /// Discount factor
    pub gamma: f32,
    /// Soft target update rate
    pub tau: f32,
    /// Exploration noise standard deviation
    pub noise_std: f32,
    /// Replay buffer capacity per worker
    pub buffer_capacity: usize,
    /// Global gradient norm bound
    pub max_grad_norm: f32,
    /// Dropout probability used while training
    pub dropout: f64,
    /// Base RNG seed (each worker adds its rank)
    pub seed: u64,
    /// Episodes between metric reports on rank 0
    pub log_interval: usize,
    /// Episodes between checkpoints on rank 0
    pub checkpoint_interval: usize,
    /// Directory for checkpoint files
    pub checkpoint_dir: PathBuf,
    /// Checkpoints kept on disk (0 = keep all)
    pub max_checkpoints: usize,
    /// Seconds a collective may wait for its peers
    pub sync_timeout_secs: u64,
    /// Checkpoint to restore before training
    pub resume_from: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            accumulation_steps: 4,
            world_size: 1,
            state_dim: 20,
            action_dim: 2,
            hidden_dim: 256,
            lr_actor: 1e-4,
            lr_critic: 1e-3,
            episodes: 1000,
            max_steps_per_episode: 500,
            train_freq: 1,
            gamma: 0.99,
            tau: 0.005,
            noise_std: 0.1,
            buffer_capacity: 100_000,
            max_grad_norm: 1.0,
            dropout: 0.1,
            seed: 42,
            log_interval: 10,
            checkpoint_interval: 100,
            checkpoint_dir: PathBuf::from("checkpoints"),
            max_checkpoints: 5,
            sync_timeout_secs: 300,
            resume_from: None,
        }
    }
}

impl TrainingConfig {
    /// Load configuration from `path`, falling back to defaults
    /// for the file itself and for every missing key
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            // Override with environment variables (DDPG_BATCH_SIZE, etc.)
            .add_source(
                Environment::with_prefix("DDPG")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Reject combinations the trainer cannot run with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("accumulation_steps", self.accumulation_steps),
            ("world_size", self.world_size),
            ("state_dim", self.state_dim),
            ("action_dim", self.action_dim),
            ("train_freq", self.train_freq),
            ("buffer_capacity", self.buffer_capacity),
            ("log_interval", self.log_interval),
            ("checkpoint_interval", self.checkpoint_interval),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TrainerError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if self.hidden_dim < 2 {
            return Err(TrainerError::InvalidConfig(
                "hidden_dim must be at least 2".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.tau) {
            return Err(TrainerError::InvalidConfig(format!(
                "tau must be within [0, 1], got {}",
                self.tau
            )));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(TrainerError::InvalidConfig(format!(
                "gamma must be within [0, 1], got {}",
                self.gamma
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainerError::InvalidConfig(format!(
                "dropout must be within [0, 1), got {}",
                self.dropout
            )));
        }
        if self.noise_std < 0.0 || self.max_grad_norm <= 0.0 {
            return Err(TrainerError::InvalidConfig(
                "noise_std must be >= 0 and max_grad_norm > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Transitions consumed by one synchronized optimizer step across all workers
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size * self.accumulation_steps * self.world_size
    }

    /// Hyperparameters of a single agent replica
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            state_dim: self.state_dim,
            action_dim: self.action_dim,
            hidden_dim: self.hidden_dim,
            lr_actor: self.lr_actor,
            lr_critic: self.lr_critic,
            gamma: self.gamma,
            tau: self.tau,
            noise_std: self.noise_std,
            max_grad_norm: self.max_grad_norm,
            dropout: self.dropout,
            buffer_capacity: self.buffer_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::load(dir.path().join("absent.json")).unwrap();

        assert_eq!(config, TrainingConfig::default());
        assert_eq!(config.gamma, 0.99);
        assert_eq!(config.tau, 0.005);
        assert_eq!(config.noise_std, 0.1);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"batch_size": 64, "world_size": 2, "tau": 0.01}}"#).unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.world_size, 2);
        assert_eq!(config.tau, 0.01);
        assert_eq!(config.accumulation_steps, 4);
        assert_eq!(config.hidden_dim, 256);
    }

    #[test]
    fn test_effective_batch_size() {
        let config = TrainingConfig {
            batch_size: 64,
            accumulation_steps: 2,
            world_size: 4,
            ..Default::default()
        };
        assert_eq!(config.effective_batch_size(), 512);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(TrainingConfig::default().validate().is_ok());

        let zero_batch = TrainingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());

        let bad_tau = TrainingConfig {
            tau: 1.5,
            ..Default::default()
        };
        assert!(bad_tau.validate().is_err());
    }
}
