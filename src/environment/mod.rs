//! Trading Environments
//!
//! Gym-like interface consumed by the trainer, plus a simulated market used
//! when no real data source is plugged in.

mod trading;

pub use trading::{SimulatedTradingEnvironment, TradingEnvConfig};

/// Result of taking a step in an environment
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Observation after the action
    pub next_state: Vec<f32>,
    /// Reward signal
    pub reward: f32,
    /// Whether the episode ended
    pub done: bool,
    /// Account diagnostics
    pub info: StepInfo,
}

/// Account diagnostics reported with every step
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepInfo {
    pub balance: f64,
    pub portfolio_value: f64,
    pub num_trades: usize,
}

/// Environment driven by a continuous action vector
pub trait Environment {
    /// Start a new episode and return the initial observation
    fn reset(&mut self) -> Vec<f32>;

    /// Apply an action and advance one step
    fn step(&mut self, action: &[f32]) -> StepResult;

    /// Observation length
    fn state_dim(&self) -> usize;

    /// Action length
    fn action_dim(&self) -> usize;
}
