//! Agent Checkpointing
//!
//! Saves and restores complete agent state (networks, targets, optimizer
//! moments, step counter and hyperparameters) as MessagePack files.

use std::fs;
use std::path::{Path, PathBuf};

use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use tracing::{info, warn};

use crate::algorithms::{AgentRecord, DdpgAgent};
use crate::error::{Result, TrainerError};

type AgentRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// File extension written by the recorder
const EXTENSION: &str = "mpk";

/// Checkpointer for saving and loading agents
pub struct Checkpointer {
    /// Directory for checkpoints
    checkpoint_dir: PathBuf,
    /// Maximum checkpoints to keep (0 = keep all)
    max_checkpoints: usize,
}

impl Checkpointer {
    /// Create a checkpointer, creating the directory if needed
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P, max_checkpoints: usize) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir).map_err(|e| checkpoint_error(&checkpoint_dir, e))?;

        Ok(Self {
            checkpoint_dir,
            max_checkpoints,
        })
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Get checkpoint path for a given name
    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{name}.{EXTENSION}"))
    }

    /// Save an agent under `name` and prune old checkpoints
    pub fn save<B: AutodiffBackend>(&self, agent: &DdpgAgent<B>, name: &str) -> Result<PathBuf> {
        let path = self.checkpoint_path(name);
        save_agent(agent, &path)?;
        info!(path = %path.display(), step = agent.step(), "Saved checkpoint");

        self.cleanup_old_checkpoints();
        Ok(path)
    }

    /// Save an agent under the episode naming scheme
    pub fn save_episode<B: AutodiffBackend>(
        &self,
        agent: &DdpgAgent<B>,
        episode: usize,
    ) -> Result<PathBuf> {
        self.save(agent, &episode_name("ddpg", episode))
    }

    /// Load a named checkpoint
    pub fn load<B: AutodiffBackend>(
        &self,
        name: &str,
        device: &B::Device,
        seed: u64,
    ) -> Result<DdpgAgent<B>> {
        load_agent(self.checkpoint_path(name), device, seed)
    }

    /// List available checkpoints, oldest name first
    pub fn list_checkpoints(&self) -> Vec<String> {
        let suffix = format!(".{EXTENSION}");
        let mut checkpoints: Vec<String> = fs::read_dir(&self.checkpoint_dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix(&suffix))
                    .map(str::to_string)
            })
            .collect();

        checkpoints.sort();
        checkpoints
    }

    /// Get latest checkpoint name
    pub fn latest_checkpoint(&self) -> Option<String> {
        self.list_checkpoints().into_iter().last()
    }

    /// Check if a checkpoint exists
    pub fn exists(&self, name: &str) -> bool {
        self.checkpoint_path(name).exists()
    }

    /// Cleanup old checkpoints keeping only max_checkpoints
    fn cleanup_old_checkpoints(&self) {
        if self.max_checkpoints == 0 {
            return;
        }
        let checkpoints = self.list_checkpoints();
        if checkpoints.len() <= self.max_checkpoints {
            return;
        }

        let to_remove = checkpoints.len() - self.max_checkpoints;
        for name in checkpoints.into_iter().take(to_remove) {
            let path = self.checkpoint_path(&name);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove old checkpoint {:?}: {}", path, e);
            } else {
                info!("Removed old checkpoint: {}", name);
            }
        }
    }
}

/// Write an agent's full record. The file always carries the `.mpk`
/// extension; any other extension on `path` is replaced.
pub fn save_agent<B: AutodiffBackend>(agent: &DdpgAgent<B>, path: &Path) -> Result<()> {
    let path = record_path(path);
    let record = agent.to_record()?;
    <AgentRecorder as Recorder<B>>::record(&AgentRecorder::new(), record, path.clone())
        .map_err(|e| checkpoint_error(&path, e))?;
    Ok(())
}

/// Restore an agent from `path`. The replay buffer starts empty and `seed`
/// drives the restored agent's sampling and noise.
pub fn load_agent<B: AutodiffBackend, P: AsRef<Path>>(
    path: P,
    device: &B::Device,
    seed: u64,
) -> Result<DdpgAgent<B>> {
    let path = record_path(path.as_ref());
    let path = path.as_path();
    if !path.exists() {
        return Err(TrainerError::Checkpoint {
            path: path.display().to_string(),
            reason: "checkpoint not found".to_string(),
        });
    }

    let record: AgentRecord<B> =
        <AgentRecorder as Recorder<B>>::load(&AgentRecorder::new(), path.to_path_buf(), device)
            .map_err(|e| checkpoint_error(path, e))?;
    let agent = DdpgAgent::from_record(record, device, seed)?;
    info!(path = %path.display(), step = agent.step(), "Loaded checkpoint");
    Ok(agent)
}

/// Path the recorder actually reads and writes for `path`
pub fn record_path(path: &Path) -> PathBuf {
    path.with_extension(EXTENSION)
}

/// Generate a checkpoint name with episode number
pub fn episode_name(prefix: &str, episode: usize) -> String {
    format!("{prefix}_episode_{episode:06}")
}

fn checkpoint_error(path: &Path, err: impl std::fmt::Display) -> TrainerError {
    TrainerError::Checkpoint {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_path() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path(), 5).unwrap();
        let path = checkpointer.checkpoint_path("model_v1");

        assert!(path.to_string_lossy().ends_with("model_v1.mpk"));
    }

    #[test]
    fn test_episode_name_sorts_by_episode() {
        assert_eq!(episode_name("ddpg", 100), "ddpg_episode_000100");
        assert!(episode_name("ddpg", 900) < episode_name("ddpg", 1000));
    }

    #[test]
    fn test_list_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path(), 2).unwrap();
        for episode in [100, 200, 300] {
            fs::write(checkpointer.checkpoint_path(&episode_name("ddpg", episode)), b"x").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(checkpointer.list_checkpoints().len(), 3);
        checkpointer.cleanup_old_checkpoints();

        assert_eq!(
            checkpointer.list_checkpoints(),
            vec!["ddpg_episode_000200", "ddpg_episode_000300"]
        );
        assert_eq!(
            checkpointer.latest_checkpoint().as_deref(),
            Some("ddpg_episode_000300")
        );
    }

    #[test]
    fn test_record_path_forces_extension() {
        assert_eq!(record_path(Path::new("run/agent.ckpt")), Path::new("run/agent.mpk"));
        assert_eq!(record_path(Path::new("run/agent")), Path::new("run/agent.mpk"));
        assert_eq!(record_path(Path::new("run/agent.mpk")), Path::new("run/agent.mpk"));
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_agent::<burn::backend::Autodiff<burn_ndarray::NdArray<f32>>, _>(
            dir.path().join("absent.mpk"),
            &Default::default(),
            0,
        );
        assert!(matches!(result, Err(TrainerError::Checkpoint { .. })));
    }
}
