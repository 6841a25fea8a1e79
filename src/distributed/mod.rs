//! Distributed Training
//!
//! Collective communication between workers and the trainer that drives
//! synchronized DDPG replicas.

pub mod fabric;
pub mod trainer;

pub use fabric::{ClusterFabric, FabricError, FabricGuard, LocalFabric, SoloFabric, SyncPoint};
pub use trainer::{DistributedTrainer, WorkerReport};
