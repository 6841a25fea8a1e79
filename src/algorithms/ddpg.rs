//! Deep Deterministic Policy Gradient
//!
//! Off-policy actor-critic agent with target networks, Gaussian exploration
//! noise and a replay buffer.
//!
//! Updates can be driven in two ways:
//! - [`DdpgAgent::train_step`] performs a complete single-process update.
//! - [`DdpgAgent::sub_batch_gradients`] and [`DdpgAgent::apply_gradients`]
//!   split an update so gradients can be accumulated and averaged across
//!   workers before the optimizers step.

use burn::module::{AutodiffModule, Module};
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{AdamW, AdamWConfig, Optimizer};
use burn::prelude::*;
use burn::record::Record;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Bool, ElementConversion, TensorData};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{Result, TrainerError};
use crate::memory::{ReplayBuffer, Transition, TransitionBatch};
use crate::networks::{
    soft_update, PolicyNetwork, PolicyNetworkConfig, TensorSet, ValueNetwork, ValueNetworkConfig,
};
use crate::training::{load_agent, save_agent};

/// Policy optimizer type
pub type PolicyOptimizer<B> =
    OptimizerAdaptor<AdamW<<B as AutodiffBackend>::InnerBackend>, PolicyNetwork<B>, B>;

/// Value optimizer type
pub type ValueOptimizer<B> =
    OptimizerAdaptor<AdamW<<B as AutodiffBackend>::InnerBackend>, ValueNetwork<B>, B>;

/// Hyperparameters of one agent replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub state_dim: usize,
    pub action_dim: usize,
    pub hidden_dim: usize,
    pub lr_actor: f64,
    pub lr_critic: f64,
    /// Discount factor
    pub gamma: f32,
    /// Soft target update rate
    pub tau: f32,
    /// Exploration noise standard deviation
    pub noise_std: f32,
    pub max_grad_norm: f32,
    pub dropout: f64,
    pub buffer_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_dim: 20,
            action_dim: 2,
            hidden_dim: 256,
            lr_actor: 1e-4,
            lr_critic: 1e-3,
            gamma: 0.99,
            tau: 0.005,
            noise_std: 0.1,
            max_grad_norm: 1.0,
            dropout: 0.1,
            buffer_capacity: 100_000,
        }
    }
}

impl AgentConfig {
    pub fn policy_config(&self) -> PolicyNetworkConfig {
        PolicyNetworkConfig::new(self.state_dim, self.action_dim)
            .with_hidden_dim(self.hidden_dim)
            .with_dropout(self.dropout)
    }

    pub fn value_config(&self) -> ValueNetworkConfig {
        ValueNetworkConfig::new(self.state_dim, self.action_dim)
            .with_hidden_dim(self.hidden_dim)
            .with_dropout(self.dropout)
    }

    fn optimizer_config() -> AdamWConfig {
        AdamWConfig::new()
            .with_epsilon(1e-8)
            .with_weight_decay(1e-2)
    }
}

/// Losses and Q estimate of one optimizer step
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub actor_loss: f32,
    pub critic_loss: f32,
    pub mean_q_value: f32,
    /// Optimizer steps taken so far, including this one
    pub step: usize,
}

/// Gradients of one sub-batch, kept separate per network
#[derive(Debug, Clone)]
pub struct SubBatchGradients {
    pub value: TensorSet,
    pub policy: TensorSet,
    pub critic_loss: f32,
    pub actor_loss: f32,
    pub mean_q_value: f32,
}

/// Global gradient norms measured before clipping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub value_grad_norm: f32,
    pub policy_grad_norm: f32,
}

/// Bootstrapped targets `r + γ · Q'(s', π'(s'))`, with the bootstrap term
/// zeroed on terminal transitions
pub fn bootstrap_targets<B: Backend>(
    rewards: Tensor<B, 2>,
    next_q: Tensor<B, 2>,
    terminals: Tensor<B, 2, Bool>,
    gamma: f32,
) -> Tensor<B, 2> {
    rewards + next_q.mask_fill(terminals, 0.0).mul_scalar(gamma)
}

/// Full checkpoint of an agent: live and target networks, optimizer state,
/// step counter and the hyperparameters as JSON
#[derive(Record)]
pub struct AgentRecord<B: AutodiffBackend> {
    pub policy: <PolicyNetwork<B> as Module<B>>::Record,
    pub value: <ValueNetwork<B> as Module<B>>::Record,
    pub policy_target: <PolicyNetwork<B> as Module<B>>::Record,
    pub value_target: <ValueNetwork<B> as Module<B>>::Record,
    pub policy_optimizer: <PolicyOptimizer<B> as Optimizer<PolicyNetwork<B>, B>>::Record,
    pub value_optimizer: <ValueOptimizer<B> as Optimizer<ValueNetwork<B>, B>>::Record,
    pub step: usize,
    pub hyperparameters: String,
}

/// DDPG agent
pub struct DdpgAgent<B: AutodiffBackend> {
    config: AgentConfig,
    policy: PolicyNetwork<B>,
    value: ValueNetwork<B>,
    policy_target: PolicyNetwork<B>,
    value_target: ValueNetwork<B>,
    policy_optimizer: PolicyOptimizer<B>,
    value_optimizer: ValueOptimizer<B>,
    buffer: ReplayBuffer,
    rng: StdRng,
    noise: Normal<f32>,
    step: usize,
    device: B::Device,
}

impl<B: AutodiffBackend> DdpgAgent<B> {
    /// Create an agent with freshly initialized networks.
    ///
    /// Targets start as exact copies of the live networks. `seed` drives
    /// replay sampling and exploration noise.
    pub fn new(config: AgentConfig, device: &B::Device, seed: u64) -> Result<Self> {
        let policy = config.policy_config().init::<B>(device);
        let value = config.value_config().init::<B>(device);
        let noise = exploration_noise(config.noise_std)?;

        debug!(
            state_dim = config.state_dim,
            action_dim = config.action_dim,
            hidden_dim = config.hidden_dim,
            seed,
            "DDPG agent initialized"
        );

        Ok(Self {
            policy_target: policy.clone(),
            value_target: value.clone(),
            policy,
            value,
            policy_optimizer: AgentConfig::optimizer_config().init(),
            value_optimizer: AgentConfig::optimizer_config().init(),
            buffer: ReplayBuffer::new(config.buffer_capacity),
            rng: StdRng::seed_from_u64(seed),
            noise,
            step: 0,
            device: device.clone(),
            config,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Optimizer steps taken
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn policy(&self) -> &PolicyNetwork<B> {
        &self.policy
    }

    pub fn value(&self) -> &ValueNetwork<B> {
        &self.value
    }

    pub fn policy_target(&self) -> &PolicyNetwork<B> {
        &self.policy_target
    }

    pub fn value_target(&self) -> &ValueNetwork<B> {
        &self.value_target
    }

    /// Select an action for one state.
    ///
    /// The policy runs in inference mode. With `explore`, Gaussian noise is
    /// added and the result clamped back to [-1, 1].
    pub fn select_action(&mut self, state: &[f32], explore: bool) -> Result<Vec<f32>> {
        if state.len() != self.config.state_dim {
            return Err(TrainerError::Shape {
                what: "state",
                expected: self.config.state_dim,
                actual: state.len(),
            });
        }

        let input = Tensor::<B::InnerBackend, 2>::from_data(
            TensorData::new(state.to_vec(), [1, state.len()]).convert::<B::FloatElem>(),
            &self.device,
        );
        let mut action: Vec<f32> = self
            .policy
            .valid()
            .forward(input)
            .to_data()
            .iter::<f32>()
            .collect();

        if explore {
            for a in &mut action {
                *a = (*a + self.noise.sample(&mut self.rng)).clamp(-1.0, 1.0);
            }
        }
        Ok(action)
    }

    /// Validate and store a transition
    pub fn store_transition(&mut self, transition: Transition) -> Result<()> {
        transition.validate(self.config.state_dim, self.config.action_dim)?;
        self.buffer.push(transition);
        Ok(())
    }

    /// Draw a batch of `batch_size` transitions (clamped to the buffer length)
    pub fn sample_batch(&mut self, batch_size: usize) -> TransitionBatch {
        self.buffer.sample_batch(
            batch_size,
            self.config.state_dim,
            self.config.action_dim,
            &mut self.rng,
        )
    }

    /// One complete update: value step, then policy step against the updated
    /// value network, then soft target updates.
    ///
    /// Returns `None` without touching any state when the buffer holds fewer
    /// than `batch_size` transitions.
    pub fn train_step(&mut self, batch_size: usize) -> Result<Option<TrainMetrics>> {
        if batch_size == 0 || !self.buffer.has_enough_samples(batch_size) {
            return Ok(None);
        }
        let batch = self.sample_batch(batch_size);

        let (critic_loss, mean_q_value, value_grads) = self.value_gradients(&batch, 1.0)?;
        self.step_value(value_grads)?;

        let (actor_loss, policy_grads) = self.policy_gradients(&batch, 1.0)?;
        self.step_policy(policy_grads)?;

        self.step += 1;
        Ok(Some(TrainMetrics {
            actor_loss,
            critic_loss,
            mean_q_value,
            step: self.step,
        }))
    }

    /// Gradients of both losses on one sub-batch without stepping.
    ///
    /// Both losses are multiplied by `scale` before backpropagation. The value
    /// set holds only value-loss gradients and the policy set only
    /// policy-loss gradients.
    pub fn sub_batch_gradients(
        &self,
        batch: &TransitionBatch,
        scale: f32,
    ) -> Result<SubBatchGradients> {
        let (critic_loss, mean_q_value, value) = self.value_gradients(batch, scale)?;
        let (actor_loss, policy) = self.policy_gradients(batch, scale)?;
        Ok(SubBatchGradients {
            value,
            policy,
            critic_loss,
            actor_loss,
            mean_q_value,
        })
    }

    /// Clip and apply externally accumulated gradients, then soft-update both
    /// targets and advance the step counter
    pub fn apply_gradients(
        &mut self,
        value_grads: TensorSet,
        policy_grads: TensorSet,
    ) -> Result<StepReport> {
        let value_grad_norm = self.step_value(value_grads)?;
        let policy_grad_norm = self.step_policy(policy_grads)?;
        self.step += 1;

        Ok(StepReport {
            step: self.step,
            value_grad_norm,
            policy_grad_norm,
        })
    }

    /// Polyak-average both targets towards the live networks with `tau`
    pub fn soft_update_targets(&mut self, tau: f32) -> Result<()> {
        self.value_target = soft_update(&self.value, self.value_target.clone(), tau)?;
        self.policy_target = soft_update(&self.policy, self.policy_target.clone(), tau)?;
        Ok(())
    }

    /// Copy live parameters into both targets
    pub fn hard_sync_targets(&mut self) -> Result<()> {
        self.soft_update_targets(1.0)
    }

    pub fn policy_parameters(&self) -> TensorSet {
        TensorSet::from_module(&self.policy)
    }

    pub fn value_parameters(&self) -> TensorSet {
        TensorSet::from_module(&self.value)
    }

    pub fn policy_target_parameters(&self) -> TensorSet {
        TensorSet::from_module(&self.policy_target)
    }

    pub fn value_target_parameters(&self) -> TensorSet {
        TensorSet::from_module(&self.value_target)
    }

    /// Overwrite the live networks, leaving targets and optimizer state alone
    pub fn load_live_parameters(&mut self, policy: &TensorSet, value: &TensorSet) -> Result<()> {
        self.policy = policy.load_into(self.policy.clone())?;
        self.value = value.load_into(self.value.clone())?;
        Ok(())
    }

    /// All four parameter sets in the order policy, value, policy target,
    /// value target
    pub fn replica_parameters(&self) -> TensorSet {
        self.policy_parameters()
            .concat(self.value_parameters())
            .concat(self.policy_target_parameters())
            .concat(self.value_target_parameters())
    }

    /// Overwrite all four parameter sets from [`Self::replica_parameters`] output
    pub fn load_replica_parameters(&mut self, params: TensorSet) -> Result<()> {
        let n_policy = self.policy_parameters().len();
        let n_value = self.value_parameters().len();

        let (policy, rest) = params.split_at(n_policy)?;
        let (value, rest) = rest.split_at(n_value)?;
        let (policy_target, value_target) = rest.split_at(n_policy)?;

        self.load_live_parameters(&policy, &value)?;
        self.policy_target = policy_target.load_into(self.policy_target.clone())?;
        self.value_target = value_target.load_into(self.value_target.clone())?;
        Ok(())
    }

    /// Snapshot everything needed to resume training
    pub fn to_record(&self) -> Result<AgentRecord<B>> {
        Ok(AgentRecord {
            policy: self.policy.clone().into_record(),
            value: self.value.clone().into_record(),
            policy_target: self.policy_target.clone().into_record(),
            value_target: self.value_target.clone().into_record(),
            policy_optimizer: self.policy_optimizer.to_record(),
            value_optimizer: self.value_optimizer.to_record(),
            step: self.step,
            hyperparameters: serde_json::to_string(&self.config)?,
        })
    }

    /// Write a checkpoint file
    pub fn save(&self, path: &Path) -> Result<()> {
        save_agent(self, path)
    }

    /// Restore an agent from a checkpoint file
    pub fn load(path: &Path, device: &B::Device, seed: u64) -> Result<Self> {
        load_agent(path, device, seed)
    }

    /// Rebuild an agent from a record. The replay buffer starts empty.
    pub fn from_record(record: AgentRecord<B>, device: &B::Device, seed: u64) -> Result<Self> {
        let config: AgentConfig = serde_json::from_str(&record.hyperparameters)?;
        let fresh = Self::new(config, device, seed)?;

        Ok(Self {
            policy: fresh.policy.load_record(record.policy),
            value: fresh.value.load_record(record.value),
            policy_target: fresh.policy_target.load_record(record.policy_target),
            value_target: fresh.value_target.load_record(record.value_target),
            policy_optimizer: fresh.policy_optimizer.load_record(record.policy_optimizer),
            value_optimizer: fresh.value_optimizer.load_record(record.value_optimizer),
            step: record.step,
            ..fresh
        })
    }

    fn target_q(&self, batch: &TransitionBatch) -> Tensor<B, 2> {
        let tensors = batch.to_tensors::<B::InnerBackend>(&self.device);
        let next_actions = self.policy_target.valid().forward(tensors.next_states.clone());
        let next_q = self
            .value_target
            .valid()
            .forward(tensors.next_states, next_actions);
        let targets = bootstrap_targets(tensors.rewards, next_q, tensors.terminals, self.config.gamma);
        Tensor::from_inner(targets)
    }

    fn value_gradients(&self, batch: &TransitionBatch, scale: f32) -> Result<(f32, f32, TensorSet)> {
        ensure_batch(batch)?;
        let target_q = self.target_q(batch);
        let tensors = batch.to_tensors::<B>(&self.device);

        let q = self.value.forward(tensors.states, tensors.actions);
        let mean_q = q.clone().detach().mean().into_scalar().elem::<f32>();
        let loss = MseLoss::new().forward(q, target_q, Reduction::Mean);
        let loss_value = loss.clone().into_scalar().elem::<f32>();

        let grads = loss.mul_scalar(scale).backward();
        Ok((loss_value, mean_q, TensorSet::from_gradients::<B, _>(&self.value, &grads)))
    }

    fn policy_gradients(&self, batch: &TransitionBatch, scale: f32) -> Result<(f32, TensorSet)> {
        ensure_batch(batch)?;
        let tensors = batch.to_tensors::<B>(&self.device);

        let actions = self.policy.forward(tensors.states.clone());
        let loss = self.value.forward(tensors.states, actions).mean().neg();
        let loss_value = loss.clone().into_scalar().elem::<f32>();

        // Value parameters also receive gradients here; only the policy's are kept
        let grads = loss.mul_scalar(scale).backward();
        Ok((loss_value, TensorSet::from_gradients::<B, _>(&self.policy, &grads)))
    }

    fn step_value(&mut self, mut grads: TensorSet) -> Result<f32> {
        let norm = grads.clip_norm(self.config.max_grad_norm);
        let grads = grads.to_gradients_params::<B, _>(&self.value)?;
        self.value = self
            .value_optimizer
            .step(self.config.lr_critic, self.value.clone(), grads);
        self.value_target = soft_update(&self.value, self.value_target.clone(), self.config.tau)?;
        Ok(norm)
    }

    fn step_policy(&mut self, mut grads: TensorSet) -> Result<f32> {
        let norm = grads.clip_norm(self.config.max_grad_norm);
        let grads = grads.to_gradients_params::<B, _>(&self.policy)?;
        self.policy = self
            .policy_optimizer
            .step(self.config.lr_actor, self.policy.clone(), grads);
        self.policy_target =
            soft_update(&self.policy, self.policy_target.clone(), self.config.tau)?;
        Ok(norm)
    }
}

fn exploration_noise(std: f32) -> Result<Normal<f32>> {
    Normal::new(0.0, std)
        .map_err(|e| TrainerError::InvalidConfig(format!("noise_std {std}: {e}")))
}

fn ensure_batch(batch: &TransitionBatch) -> Result<()> {
    if batch.is_empty() {
        return Err(TrainerError::Shape {
            what: "training batch",
            expected: 1,
            actual: 0,
        });
    }
    Ok(())
}
