//! Gradient accumulation across sub-batches
//!
//! Accumulated gradients live here rather than on the parameters, so value
//! and policy gradients never mix and nothing leaks between cycles.

use crate::error::{Result, TrainerError};
use crate::networks::TensorSet;

use super::ddpg::SubBatchGradients;

/// Where the accumulator is within one optimizer cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// No gradients held
    Idle,
    /// Sub-batches received so far
    Accumulating { received: usize },
    /// Gradients handed out for averaging and stepping
    Synchronizing,
}

/// Summed gradients and averaged loss statistics of a finished cycle
#[derive(Debug, Clone)]
pub struct AccumulatedCycle {
    pub value: TensorSet,
    pub policy: TensorSet,
    pub critic_loss: f32,
    pub actor_loss: f32,
    pub mean_q_value: f32,
}

/// Sums gradients of `steps` sub-batches
#[derive(Debug)]
pub struct GradientAccumulator {
    steps: usize,
    phase: CyclePhase,
    value: Option<TensorSet>,
    policy: Option<TensorSet>,
    critic_loss: f32,
    actor_loss: f32,
    mean_q_value: f32,
}

impl GradientAccumulator {
    pub fn new(steps: usize) -> Self {
        Self {
            steps: steps.max(1),
            phase: CyclePhase::Idle,
            value: None,
            policy: None,
            critic_loss: 0.0,
            actor_loss: 0.0,
            mean_q_value: 0.0,
        }
    }

    /// Sub-batches per cycle
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Loss scale applied to each sub-batch
    pub fn loss_scale(&self) -> f32 {
        1.0 / self.steps as f32
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Add one sub-batch. Returns true once the cycle is complete.
    pub fn add(&mut self, grads: SubBatchGradients) -> Result<bool> {
        let received = match self.phase {
            CyclePhase::Idle => 0,
            CyclePhase::Accumulating { received } if received < self.steps => received,
            _ => return Err(self.out_of_order("add")),
        };

        accumulate(&mut self.value, grads.value)?;
        accumulate(&mut self.policy, grads.policy)?;
        self.critic_loss += grads.critic_loss;
        self.actor_loss += grads.actor_loss;
        self.mean_q_value += grads.mean_q_value;

        let received = received + 1;
        self.phase = CyclePhase::Accumulating { received };
        Ok(received == self.steps)
    }

    /// Hand out the summed gradients of a complete cycle
    pub fn take(&mut self) -> Result<AccumulatedCycle> {
        match self.phase {
            CyclePhase::Accumulating { received } if received == self.steps => {}
            _ => return Err(self.out_of_order("take")),
        }
        let (Some(value), Some(policy)) = (self.value.take(), self.policy.take()) else {
            return Err(self.out_of_order("take"));
        };

        let n = self.steps as f32;
        let cycle = AccumulatedCycle {
            value,
            policy,
            critic_loss: self.critic_loss / n,
            actor_loss: self.actor_loss / n,
            mean_q_value: self.mean_q_value / n,
        };
        self.critic_loss = 0.0;
        self.actor_loss = 0.0;
        self.mean_q_value = 0.0;
        self.phase = CyclePhase::Synchronizing;
        Ok(cycle)
    }

    /// Mark the synchronized step as applied
    pub fn finish(&mut self) {
        self.reset();
    }

    /// Drop anything held and return to idle
    pub fn reset(&mut self) {
        self.value = None;
        self.policy = None;
        self.critic_loss = 0.0;
        self.actor_loss = 0.0;
        self.mean_q_value = 0.0;
        self.phase = CyclePhase::Idle;
    }

    fn out_of_order(&self, operation: &str) -> TrainerError {
        TrainerError::State(format!(
            "gradient accumulator cannot {operation} in phase {:?} ({} steps per cycle)",
            self.phase, self.steps
        ))
    }
}

fn accumulate(slot: &mut Option<TensorSet>, grads: TensorSet) -> Result<()> {
    match slot {
        Some(total) => total.add_assign(&grads),
        None => {
            *slot = Some(grads);
            Ok(())
        }
    }
}
