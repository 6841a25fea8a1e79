//! Replay Buffer
//!
//! Bounded experience replay for off-policy learning. Oldest transitions are
//! evicted first once the buffer is full.

use burn::prelude::*;
use burn::tensor::{Bool, TensorData};
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{Result, TrainerError};

/// A single transition in the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// State features before action
    pub state: Vec<f32>,
    /// Action taken
    pub action: Vec<f32>,
    /// Reward received
    pub reward: f32,
    /// Next state features
    pub next_state: Vec<f32>,
    /// Whether the episode terminated at this step
    pub terminal: bool,
}

impl Transition {
    /// Create a new transition
    pub fn new(
        state: Vec<f32>,
        action: Vec<f32>,
        reward: f32,
        next_state: Vec<f32>,
        terminal: bool,
    ) -> Self {
        Self {
            state,
            action,
            reward,
            next_state,
            terminal,
        }
    }

    /// Check vector lengths against the agent's dimensions
    pub fn validate(&self, state_dim: usize, action_dim: usize) -> Result<()> {
        check_len("state", state_dim, self.state.len())?;
        check_len("action", action_dim, self.action.len())?;
        check_len("next_state", state_dim, self.next_state.len())
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(TrainerError::Shape {
            what,
            expected,
            actual,
        })
    }
}

/// Sampled transitions stacked into row-major batch arrays
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionBatch {
    /// `[len, state_dim]`
    pub states: Vec<f32>,
    /// `[len, action_dim]`
    pub actions: Vec<f32>,
    /// `[len]`
    pub rewards: Vec<f32>,
    /// `[len, state_dim]`
    pub next_states: Vec<f32>,
    /// `[len]`
    pub terminals: Vec<bool>,
    pub state_dim: usize,
    pub action_dim: usize,
}

/// Batch arrays moved onto a device
#[derive(Debug, Clone)]
pub struct BatchTensors<B: Backend> {
    pub states: Tensor<B, 2>,
    pub actions: Tensor<B, 2>,
    pub rewards: Tensor<B, 2>,
    pub next_states: Tensor<B, 2>,
    pub terminals: Tensor<B, 2, Bool>,
}

impl TransitionBatch {
    /// Stack transitions into batch arrays
    pub fn from_transitions<'a, I>(transitions: I, state_dim: usize, action_dim: usize) -> Self
    where
        I: IntoIterator<Item = &'a Transition>,
    {
        let mut batch = Self {
            states: Vec::new(),
            actions: Vec::new(),
            rewards: Vec::new(),
            next_states: Vec::new(),
            terminals: Vec::new(),
            state_dim,
            action_dim,
        };
        for t in transitions {
            batch.states.extend_from_slice(&t.state);
            batch.actions.extend_from_slice(&t.action);
            batch.rewards.push(t.reward);
            batch.next_states.extend_from_slice(&t.next_state);
            batch.terminals.push(t.terminal);
        }
        batch
    }

    /// Number of transitions in the batch
    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    /// Create batch tensors on the given device
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> BatchTensors<B> {
        let n = self.len();
        BatchTensors {
            states: Tensor::from_data(
                TensorData::new(self.states.clone(), [n, self.state_dim]),
                device,
            ),
            actions: Tensor::from_data(
                TensorData::new(self.actions.clone(), [n, self.action_dim]),
                device,
            ),
            rewards: Tensor::from_data(TensorData::new(self.rewards.clone(), [n, 1]), device),
            next_states: Tensor::from_data(
                TensorData::new(self.next_states.clone(), [n, self.state_dim]),
                device,
            ),
            terminals: Tensor::from_data(TensorData::new(self.terminals.clone(), [n, 1]), device),
        }
    }
}

/// Replay buffer for experience storage
#[derive(Debug)]
pub struct ReplayBuffer {
    /// Storage for transitions, oldest first
    buffer: VecDeque<Transition>,
    /// Maximum capacity
    capacity: usize,
}

impl ReplayBuffer {
    /// Create a new replay buffer with given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(1 << 16)),
            capacity,
        }
    }

    /// Add a transition, evicting the oldest one when full
    pub fn push(&mut self, transition: Transition) {
        if self.capacity == 0 {
            return;
        }
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(transition);
    }

    /// Sample a random batch of transitions.
    ///
    /// The request is clamped to the current length. Indices are drawn
    /// uniformly without replacement within one call; separate calls are
    /// independent and may overlap.
    pub fn sample<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<&Transition> {
        let amount = batch_size.min(self.buffer.len());
        index::sample(rng, self.buffer.len(), amount)
            .into_iter()
            .map(|i| &self.buffer[i])
            .collect()
    }

    /// Sample and stack a batch for training
    pub fn sample_batch<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        state_dim: usize,
        action_dim: usize,
        rng: &mut R,
    ) -> TransitionBatch {
        TransitionBatch::from_transitions(self.sample(batch_size, rng), state_dim, action_dim)
    }

    /// Iterate over stored transitions, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.buffer.iter()
    }

    /// Clear all transitions
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Get current number of transitions
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Check if buffer has enough samples for training
    pub fn has_enough_samples(&self, min_samples: usize) -> bool {
        self.buffer.len() >= min_samples
    }

    /// Get buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get fill ratio (0.0 to 1.0)
    pub fn fill_ratio(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.buffer.len() as f32 / self.capacity as f32
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    fn make_transition(reward: f32, done: bool) -> Transition {
        Transition::new(vec![reward; 4], vec![0.0; 2], reward, vec![reward + 1.0; 4], done)
    }

    #[test]
    fn test_replay_buffer_push() {
        let mut buffer = ReplayBuffer::new(10);

        for i in 0..15 {
            buffer.push(make_transition(i as f32, false));
        }

        // Should only keep last 10
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.iter().next().unwrap().reward, 5.0);
        assert_eq!(buffer.fill_ratio(), 1.0);
    }

    #[test]
    fn test_replay_buffer_sample() {
        let mut buffer = ReplayBuffer::new(100);
        let mut rng = StdRng::seed_from_u64(7);

        for i in 0..50 {
            buffer.push(make_transition(i as f32, false));
        }

        let batch = buffer.sample(10, &mut rng);
        assert_eq!(batch.len(), 10);

        let mut rewards: Vec<f32> = batch.iter().map(|t| t.reward).collect();
        rewards.sort_by(|a, b| a.partial_cmp(b).unwrap());
        rewards.dedup();
        assert_eq!(rewards.len(), 10, "draws within one call are distinct");
    }

    #[test]
    fn test_sample_is_clamped_to_len() {
        let mut buffer = ReplayBuffer::new(100);
        let mut rng = StdRng::seed_from_u64(1);
        for i in 0..3 {
            buffer.push(make_transition(i as f32, false));
        }

        assert_eq!(buffer.sample(64, &mut rng).len(), 3);
        assert!(ReplayBuffer::new(8).sample(4, &mut rng).is_empty());
    }

    #[test]
    fn test_batch_tensors_shapes() {
        let mut buffer = ReplayBuffer::new(16);
        let mut rng = StdRng::seed_from_u64(3);
        for i in 0..6 {
            buffer.push(make_transition(i as f32, i == 5));
        }

        let batch = buffer.sample_batch(4, 4, 2, &mut rng);
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.states.len(), 16);

        let device = Default::default();
        let tensors = batch.to_tensors::<TestBackend>(&device);
        assert_eq!(tensors.states.dims(), [4, 4]);
        assert_eq!(tensors.actions.dims(), [4, 2]);
        assert_eq!(tensors.rewards.dims(), [4, 1]);
        assert_eq!(tensors.next_states.dims(), [4, 4]);
        assert_eq!(tensors.terminals.dims(), [4, 1]);
    }

    #[test]
    fn test_transition_validation() {
        let t = make_transition(0.0, false);
        assert!(t.validate(4, 2).is_ok());
        assert!(matches!(
            t.validate(5, 2),
            Err(TrainerError::Shape { what: "state", .. })
        ));
    }

    proptest! {
        /// After any sequence of pushes the buffer holds exactly the most
        /// recent `capacity` transitions, in insertion order.
        #[test]
        fn test_fifo_eviction_law(capacity in 1usize..64, pushes in 0usize..200) {
            let mut buffer = ReplayBuffer::new(capacity);
            for i in 0..pushes {
                buffer.push(make_transition(i as f32, false));
            }

            let kept: Vec<f32> = buffer.iter().map(|t| t.reward).collect();
            let expected: Vec<f32> = (pushes.saturating_sub(capacity)..pushes)
                .map(|i| i as f32)
                .collect();
            prop_assert_eq!(kept, expected);
            prop_assert!(buffer.len() <= capacity);
        }
    }
}
