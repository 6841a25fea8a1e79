pub mod algorithms;
pub mod cli;
pub mod config;
pub mod distributed;
pub mod environment;
pub mod error;
pub mod logging;
pub mod memory;
pub mod networks;
pub mod training;

pub use algorithms::{AgentConfig, DdpgAgent, TrainMetrics};
pub use config::TrainingConfig;
pub use distributed::{DistributedTrainer, FabricError, WorkerReport};
pub use environment::{Environment, SimulatedTradingEnvironment, StepResult};
pub use error::{Result, TrainerError};
pub use memory::{ReplayBuffer, Transition};
pub use networks::TensorSet;

/// CPU training backend
pub type DefaultBackend = burn::backend::Autodiff<burn_ndarray::NdArray<f32>>;
