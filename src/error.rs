use thiserror::Error;

use crate::distributed::FabricError;

/// Main error type for the trainer
#[derive(Error, Debug)]
pub enum TrainerError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Data errors
    #[error("Shape mismatch for {what}: expected {expected}, got {actual}")]
    Shape {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid training state: {0}")]
    State(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Persistence errors
    #[error("Checkpoint error at {path}: {reason}")]
    Checkpoint { path: String, reason: String },

    // Collective communication errors
    #[error("Synchronization failure: {0}")]
    Fabric(#[from] FabricError),

    // Worker failures
    #[error("Worker {rank} failed at episode {episode}, step {step}: {source}")]
    Worker {
        rank: usize,
        episode: usize,
        step: usize,
        #[source]
        source: Box<TrainerError>,
    },

    #[error("Worker {rank} panicked: {message}")]
    WorkerPanicked { rank: usize, message: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrainerError {
    /// Attach worker position to an error raised inside a worker routine.
    pub fn in_worker(self, rank: usize, episode: usize, step: usize) -> Self {
        match self {
            already @ TrainerError::Worker { .. } => already,
            other => TrainerError::Worker {
                rank,
                episode,
                step,
                source: Box::new(other),
            },
        }
    }

    /// Whether the error came from collective synchronization.
    pub fn is_fabric(&self) -> bool {
        match self {
            TrainerError::Fabric(_) => true,
            TrainerError::Worker { source, .. } => source.is_fabric(),
            _ => false,
        }
    }
}

/// Result type alias for TrainerError
pub type Result<T> = std::result::Result<T, TrainerError>;
