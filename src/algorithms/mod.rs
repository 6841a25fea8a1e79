//! RL Algorithms
//!
//! DDPG agent and the gradient accumulation used by distributed training.

pub mod accumulation;
pub mod ddpg;

pub use accumulation::{AccumulatedCycle, CyclePhase, GradientAccumulator};
pub use ddpg::{
    bootstrap_targets, AgentConfig, AgentRecord, DdpgAgent, PolicyOptimizer, StepReport,
    SubBatchGradients, TrainMetrics, ValueOptimizer,
};
