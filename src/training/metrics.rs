//! Training metrics
//!
//! Per-episode statistics collected by each worker and averaged across the
//! group before rank 0 reports them.

use serde::{Deserialize, Serialize};

use crate::algorithms::AccumulatedCycle;
use crate::environment::StepInfo;
use crate::networks::{FlatTensor, TensorSet};

/// Number of scalars carried through aggregation
const FIELDS: usize = 8;

/// Statistics of one episode on one worker
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EpisodeMetrics {
    pub episode_reward: f32,
    pub episode_steps: usize,
    pub final_balance: f64,
    pub portfolio_value: f64,
    /// Mean over the episode's optimizer steps (0 without updates)
    pub actor_loss: f32,
    pub critic_loss: f32,
    pub q_value_mean: f32,
    pub training_updates: usize,
}

impl EpisodeMetrics {
    /// Record one environment step
    pub fn record_step(&mut self, reward: f32, info: &StepInfo) {
        self.episode_reward += reward;
        self.episode_steps += 1;
        self.final_balance = info.balance;
        self.portfolio_value = info.portfolio_value;
    }

    /// Record one synchronized optimizer step
    pub fn record_update(&mut self, cycle: &AccumulatedCycle) {
        self.actor_loss += cycle.actor_loss;
        self.critic_loss += cycle.critic_loss;
        self.q_value_mean += cycle.mean_q_value;
        self.training_updates += 1;
    }

    /// Turn summed losses into per-update means
    pub fn finish(&mut self) {
        if self.training_updates > 0 {
            let n = self.training_updates as f32;
            self.actor_loss /= n;
            self.critic_loss /= n;
            self.q_value_mean /= n;
        }
    }

    /// Pack into a set suitable for an averaging all-reduce
    pub fn to_tensor_set(&self) -> TensorSet {
        TensorSet::new(vec![FlatTensor {
            shape: vec![FIELDS],
            values: vec![
                self.episode_reward,
                self.episode_steps as f32,
                self.final_balance as f32,
                self.portfolio_value as f32,
                self.actor_loss,
                self.critic_loss,
                self.q_value_mean,
                self.training_updates as f32,
            ],
        }])
    }

    /// Unpack an averaged set. Counts become means across workers.
    pub fn from_tensor_set(set: &TensorSet) -> Option<AggregatedMetrics> {
        let values = &set.entries().first()?.values;
        if values.len() != FIELDS {
            return None;
        }
        Some(AggregatedMetrics {
            episode_reward: values[0],
            episode_steps: values[1],
            final_balance: f64::from(values[2]),
            portfolio_value: f64::from(values[3]),
            actor_loss: values[4],
            critic_loss: values[5],
            q_value_mean: values[6],
            training_updates: values[7],
        })
    }
}

/// Episode statistics averaged over all workers
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub episode_reward: f32,
    pub episode_steps: f32,
    pub final_balance: f64,
    pub portfolio_value: f64,
    pub actor_loss: f32,
    pub critic_loss: f32,
    pub q_value_mean: f32,
    pub training_updates: f32,
}

impl From<&EpisodeMetrics> for AggregatedMetrics {
    fn from(m: &EpisodeMetrics) -> Self {
        Self {
            episode_reward: m.episode_reward,
            episode_steps: m.episode_steps as f32,
            final_balance: m.final_balance,
            portfolio_value: m.portfolio_value,
            actor_loss: m.actor_loss,
            critic_loss: m.critic_loss,
            q_value_mean: m.q_value_mean,
            training_updates: m.training_updates as f32,
        }
    }
}
