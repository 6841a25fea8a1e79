//! Experience Memory
//!
//! Replay buffer for storing and sampling transitions.

pub mod replay_buffer;

pub use replay_buffer::{BatchTensors, ReplayBuffer, Transition, TransitionBatch};
