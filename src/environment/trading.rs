//! Simulated Trading Environment
//!
//! Single-asset account with stochastic trade outcomes. The first action
//! component is the trade signal and the second the position size fraction.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::{Environment, StepInfo, StepResult};

/// Signal magnitude below which the agent holds
const SIGNAL_THRESHOLD: f32 = 0.1;

/// Account features at the front of the observation
const ACCOUNT_FEATURES: usize = 4;

/// Trading environment configuration
#[derive(Debug, Clone)]
pub struct TradingEnvConfig {
    /// Starting cash
    pub initial_balance: f64,
    /// Fee charged on each trade (fraction of notional)
    pub transaction_fee: f64,
    /// Largest fraction of the balance committed to one trade
    pub max_position_size: f64,
    /// Maximum steps per episode
    pub max_steps: usize,
    /// Observation length; features past the account block are zero
    pub state_dim: usize,
    /// Mean/std of the price move after a buy
    pub buy_drift: (f64, f64),
    /// Mean/std of the price move after a sell
    pub sell_drift: (f64, f64),
}

impl Default for TradingEnvConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            transaction_fee: 0.003,
            max_position_size: 0.5,
            max_steps: 1000,
            state_dim: 20,
            buy_drift: (0.001, 0.02),
            sell_drift: (-0.001, 0.02),
        }
    }
}

/// Simulated trading environment
pub struct SimulatedTradingEnvironment {
    config: TradingEnvConfig,
    balance: f64,
    portfolio_value: f64,
    step_count: usize,
    num_trades: usize,
    rng: StdRng,
}

impl SimulatedTradingEnvironment {
    /// Create a new environment with a seeded outcome generator
    pub fn new(config: TradingEnvConfig, seed: u64) -> Self {
        Self {
            balance: config.initial_balance,
            portfolio_value: config.initial_balance,
            step_count: 0,
            num_trades: 0,
            rng: StdRng::seed_from_u64(seed),
            config,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::new(TradingEnvConfig::default(), seed)
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn num_trades(&self) -> usize {
        self.num_trades
    }

    /// Current observation
    pub fn observation(&self) -> Vec<f32> {
        let initial = self.config.initial_balance;
        let mut state = vec![0.0f32; self.config.state_dim.max(ACCOUNT_FEATURES)];
        state[0] = (self.balance / initial) as f32;
        state[1] = self.num_trades as f32 / self.config.max_steps.max(1) as f32;
        state[2] = (self.portfolio_value / initial) as f32;
        state[3] = self.step_count as f32 / self.config.max_steps.max(1) as f32;
        state.truncate(self.config.state_dim);
        state
    }

    /// Execute a trade and return the realized profit.
    ///
    /// Buys stake the amount plus fee and settle at the drawn move. Sells
    /// are fee-free and book the drawn move on the amount directly.
    fn trade(&mut self, signal: f32, size: f32) -> f64 {
        let fraction = f64::from(size.abs()) * self.config.max_position_size;
        let amount = self.balance * fraction;

        if signal > SIGNAL_THRESHOLD {
            let fee = amount * self.config.transaction_fee;
            if amount <= 0.0 || amount + fee > self.balance {
                return 0.0;
            }
            self.balance -= amount + fee;
            let change = self.price_move(self.config.buy_drift);
            let profit = amount * change;
            self.balance += amount + profit;
            self.num_trades += 1;
            profit
        } else if signal < -SIGNAL_THRESHOLD {
            let change = self.price_move(self.config.sell_drift);
            let profit = amount * change;
            self.balance += profit;
            self.num_trades += 1;
            profit
        } else {
            0.0
        }
    }

    fn price_move(&mut self, (mean, std): (f64, f64)) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        mean + std * z
    }
}

impl Environment for SimulatedTradingEnvironment {
    fn reset(&mut self) -> Vec<f32> {
        self.balance = self.config.initial_balance;
        self.portfolio_value = self.config.initial_balance;
        self.step_count = 0;
        self.num_trades = 0;
        self.observation()
    }

    fn step(&mut self, action: &[f32]) -> StepResult {
        let signal = action.first().copied().unwrap_or(0.0);
        let size = action.get(1).copied().unwrap_or(0.0);

        let profit = self.trade(signal, size);
        self.portfolio_value = self.balance;
        self.step_count += 1;

        let reward = (profit / self.config.initial_balance) as f32;
        let done = self.step_count >= self.config.max_steps || self.balance <= 0.0;

        StepResult {
            next_state: self.observation(),
            reward,
            done,
            info: StepInfo {
                balance: self.balance,
                portfolio_value: self.portfolio_value,
                num_trades: self.num_trades,
            },
        }
    }

    fn state_dim(&self) -> usize {
        self.config.state_dim
    }

    fn action_dim(&self) -> usize {
        2
    }
}
