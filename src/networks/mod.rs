//! Neural Network Architectures
//!
//! Policy and value networks for the DDPG agent, plus flattened parameter
//! sets used for gradient accumulation, synchronization and target updates.

pub mod actor;
pub mod critic;
pub mod params;
pub mod stage;

pub use actor::{PolicyNetwork, PolicyNetworkConfig};
pub use critic::{ValueNetwork, ValueNetworkConfig};
pub use params::{soft_update, FlatTensor, TensorSet};
pub use stage::{DenseStage, StageSpec};
