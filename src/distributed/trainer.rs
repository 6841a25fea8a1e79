//! Distributed Trainer
//!
//! Runs one DDPG replica per worker. Replicas start from rank 0's
//! parameters and stay identical because every optimizer step consumes the
//! same all-reduced gradients.
//!
//! Per worker:
//! 1. bind a device and build the agent (or restore it from a checkpoint)
//! 2. broadcast rank 0's parameters
//! 3. run episodes; every `train_freq` steps run one accumulation cycle of
//!    `accumulation_steps` sub-batches, then all-reduce and step
//! 4. aggregate metrics every `log_interval` episodes; rank 0 logs them and
//!    checkpoints every `checkpoint_interval` episodes
//! 5. pass a final barrier

use std::any::Any;
use std::thread;
use std::time::Duration;

use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, error, info, warn};

use crate::algorithms::{AccumulatedCycle, DdpgAgent, GradientAccumulator};
use crate::config::TrainingConfig;
use crate::environment::{Environment, SimulatedTradingEnvironment, TradingEnvConfig};
use crate::error::{Result, TrainerError};
use crate::memory::Transition;
use crate::networks::TensorSet;
use crate::training::{load_agent, Checkpointer, EpisodeMetrics};

use super::fabric::{ClusterFabric, FabricGuard, LocalFabric, SoloFabric, SyncPoint};

/// Outcome of one worker's run
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub rank: usize,
    pub episodes: usize,
    /// Synchronized optimizer steps taken
    pub optimizer_steps: usize,
    pub last_metrics: Option<EpisodeMetrics>,
    /// Live and target parameters at exit
    pub parameters: TensorSet,
}

/// State owned by a single worker
struct WorkerState<B: AutodiffBackend> {
    rank: usize,
    agent: DdpgAgent<B>,
    accumulator: GradientAccumulator,
    cycle: u64,
    checkpointer: Option<Checkpointer>,
}

/// Launches and supervises training workers
pub struct DistributedTrainer<B: AutodiffBackend> {
    config: TrainingConfig,
    devices: Vec<B::Device>,
}

impl<B: AutodiffBackend> DistributedTrainer<B> {
    /// Create a trainer; workers are bound to `devices[rank % devices.len()]`
    pub fn new(config: TrainingConfig, devices: Vec<B::Device>) -> Result<Self> {
        config.validate()?;
        if devices.is_empty() {
            return Err(TrainerError::InvalidConfig(
                "at least one device is required".to_string(),
            ));
        }
        Ok(Self { config, devices })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train with `config.world_size` workers on the simulated environment
    pub fn run(&self) -> Result<Vec<WorkerReport>> {
        self.launch(self.config.world_size)
    }

    /// Train with `world_size` workers on the simulated environment
    pub fn launch(&self, world_size: usize) -> Result<Vec<WorkerReport>> {
        let max_steps = self.config.max_steps_per_episode;
        let state_dim = self.config.state_dim;
        let seed = self.config.seed;
        self.launch_with(world_size, |rank| {
            SimulatedTradingEnvironment::new(
                TradingEnvConfig {
                    max_steps,
                    state_dim,
                    ..Default::default()
                },
                seed.wrapping_add(rank as u64),
            )
        })
    }

    /// Train with `world_size` workers, building each worker's environment
    /// with `make_env(rank)`.
    ///
    /// Blocks until every worker exits. Any worker error or panic fails the
    /// whole run.
    pub fn launch_with<E, F>(&self, world_size: usize, make_env: F) -> Result<Vec<WorkerReport>>
    where
        E: Environment,
        F: Fn(usize) -> E + Sync,
    {
        if world_size == 0 {
            return Err(TrainerError::InvalidConfig("world_size must be > 0".to_string()));
        }
        info!(
            world_size,
            batch_size = self.config.batch_size,
            accumulation_steps = self.config.accumulation_steps,
            effective_batch_size = self.config.batch_size
                * self.config.accumulation_steps
                * world_size,
            "Starting distributed training"
        );
        B::seed(self.config.seed);

        if world_size == 1 {
            let fabric = SoloFabric::new();
            let report = self.run_worker(&fabric, &make_env)?;
            info!("Training completed");
            return Ok(vec![report]);
        }

        let timeout = Duration::from_secs(self.config.sync_timeout_secs);
        let fabrics = LocalFabric::group(world_size, timeout)?;
        let make_env = &make_env;

        let outcomes: Vec<Result<WorkerReport>> = thread::scope(|scope| {
            let handles: Vec<_> = fabrics
                .iter()
                .map(|fabric| {
                    thread::Builder::new()
                        .name(format!("ddpg-worker-{}", fabric.rank()))
                        .spawn_scoped(scope, move || {
                            self.run_worker(fabric, make_env)
                        })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|payload| {
                        Err(TrainerError::WorkerPanicked {
                            rank,
                            message: panic_message(payload.as_ref()),
                        })
                    }),
                    Err(e) => Err(TrainerError::Io(e)),
                })
                .collect()
        });

        let mut reports = Vec::with_capacity(world_size);
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => failures.push(e),
            }
        }

        // Report the root cause rather than peers that failed because of it
        if let Some(index) = failures.iter().position(|e| !e.is_fabric()) {
            return Err(failures.swap_remove(index));
        }
        if let Some(first) = failures.into_iter().next() {
            return Err(first);
        }

        info!("Training completed");
        Ok(reports)
    }

    fn device_for(&self, rank: usize) -> B::Device {
        self.devices[rank % self.devices.len()].clone()
    }

    /// The fabric guard is armed before the environment is built, so a
    /// failing `make_env` still releases peers.
    fn run_worker<E, F>(&self, fabric: &dyn ClusterFabric, make_env: &F) -> Result<WorkerReport>
    where
        E: Environment,
        F: Fn(usize) -> E,
    {
        let _guard = FabricGuard::new(fabric);
        let rank = fabric.rank();
        let mut env = make_env(rank);

        let result = self
            .setup_worker(fabric, &env)
            .map_err(|e| e.in_worker(rank, 0, 0))
            .and_then(|state| self.train_worker(fabric, &mut env, state));

        if let Err(e) = &result {
            error!(rank, error = %e, "Worker failed");
        }
        result
    }

    fn setup_worker<E: Environment>(
        &self,
        fabric: &dyn ClusterFabric,
        env: &E,
    ) -> Result<WorkerState<B>> {
        let rank = fabric.rank();
        let config = &self.config;
        if env.state_dim() != config.state_dim {
            return Err(TrainerError::Shape {
                what: "environment state",
                expected: config.state_dim,
                actual: env.state_dim(),
            });
        }
        if env.action_dim() != config.action_dim {
            return Err(TrainerError::Shape {
                what: "environment action",
                expected: config.action_dim,
                actual: env.action_dim(),
            });
        }

        let device = self.device_for(rank);
        let seed = config.seed.wrapping_add(rank as u64);
        info!(rank, device = ?device, "Worker bound to device");

        let mut agent = match &config.resume_from {
            Some(path) => {
                let agent = load_agent::<B, _>(path, &device, seed)?;
                let restored = agent.config();
                if restored.state_dim != config.state_dim
                    || restored.action_dim != config.action_dim
                {
                    return Err(TrainerError::InvalidConfig(format!(
                        "checkpoint {} was trained with state_dim={} action_dim={}",
                        path.display(),
                        restored.state_dim,
                        restored.action_dim
                    )));
                }
                agent
            }
            None => DdpgAgent::new(config.agent_config(), &device, seed)?,
        };

        let params = fabric.broadcast(SyncPoint::Initialize, agent.replica_parameters())?;
        agent.load_replica_parameters(params)?;
        debug!(rank, step = agent.step(), "Replica parameters synchronized");

        let checkpointer = if rank == 0 {
            Some(Checkpointer::new(
                &config.checkpoint_dir,
                config.max_checkpoints,
            )?)
        } else {
            None
        };

        Ok(WorkerState {
            rank,
            agent,
            accumulator: GradientAccumulator::new(config.accumulation_steps),
            cycle: 0,
            checkpointer,
        })
    }

    fn train_worker<E: Environment>(
        &self,
        fabric: &dyn ClusterFabric,
        env: &mut E,
        mut state: WorkerState<B>,
    ) -> Result<WorkerReport> {
        let rank = state.rank;
        let mut last_metrics = None;

        for episode in 0..self.config.episodes {
            let metrics = self
                .run_episode(fabric, env, &mut state)
                .and_then(|metrics| {
                    if episode % self.config.log_interval == 0 {
                        self.report_metrics(fabric, episode, &metrics)?;
                    }
                    Ok(metrics)
                })
                .map_err(|e| e.in_worker(rank, episode, state.agent.step()))?;

            if episode > 0 && episode % self.config.checkpoint_interval == 0 {
                if let Some(checkpointer) = &state.checkpointer {
                    if let Err(e) = checkpointer.save_episode(&state.agent, episode) {
                        warn!(rank, episode, error = %e, "Checkpoint save failed, continuing");
                    }
                }
            }
            last_metrics = Some(metrics);
        }

        fabric.barrier(SyncPoint::Shutdown).map_err(|e| {
            TrainerError::from(e).in_worker(rank, self.config.episodes, state.agent.step())
        })?;

        Ok(WorkerReport {
            rank,
            episodes: self.config.episodes,
            optimizer_steps: state.agent.step(),
            last_metrics,
            parameters: state.agent.replica_parameters(),
        })
    }

    fn run_episode<E: Environment>(
        &self,
        fabric: &dyn ClusterFabric,
        env: &mut E,
        state: &mut WorkerState<B>,
    ) -> Result<EpisodeMetrics> {
        let config = &self.config;
        let mut metrics = EpisodeMetrics::default();
        let mut observation = env.reset();

        for step in 0..config.max_steps_per_episode {
            let action = state.agent.select_action(&observation, true)?;
            let result = env.step(&action);
            state.agent.store_transition(Transition::new(
                observation,
                action,
                result.reward,
                result.next_state.clone(),
                result.done,
            ))?;
            metrics.record_step(result.reward, &result.info);

            if step % config.train_freq == 0
                && state.agent.buffer().has_enough_samples(config.batch_size)
            {
                let cycle = self.run_cycle(fabric, state)?;
                metrics.record_update(&cycle);
            }

            observation = result.next_state;
            if result.done {
                break;
            }
        }

        metrics.finish();
        Ok(metrics)
    }

    /// One accumulation cycle ending in a synchronized optimizer step
    fn run_cycle(
        &self,
        fabric: &dyn ClusterFabric,
        state: &mut WorkerState<B>,
    ) -> Result<AccumulatedCycle> {
        let scale = state.accumulator.loss_scale();
        let mut complete = false;
        while !complete {
            let batch = state.agent.sample_batch(self.config.batch_size);
            let grads = state.agent.sub_batch_gradients(&batch, scale)?;
            complete = state.accumulator.add(grads)?;
        }

        let cycle = state.accumulator.take()?;
        let n_value = cycle.value.len();
        let payload = cycle.value.clone().concat(cycle.policy.clone());
        let averaged =
            fabric.all_reduce_average(SyncPoint::Gradients { cycle: state.cycle }, payload)?;
        let (value, policy) = averaged.split_at(n_value)?;

        let report = state.agent.apply_gradients(value, policy)?;
        state.accumulator.finish();
        state.cycle += 1;

        debug!(
            rank = state.rank,
            step = report.step,
            critic_loss = cycle.critic_loss,
            actor_loss = cycle.actor_loss,
            value_grad_norm = report.value_grad_norm,
            policy_grad_norm = report.policy_grad_norm,
            "Optimizer step"
        );
        Ok(cycle)
    }

    fn report_metrics(
        &self,
        fabric: &dyn ClusterFabric,
        episode: usize,
        metrics: &EpisodeMetrics,
    ) -> Result<()> {
        let averaged = fabric.all_reduce_average(
            SyncPoint::Metrics {
                episode: episode as u64,
            },
            metrics.to_tensor_set(),
        )?;
        if fabric.rank() != 0 {
            return Ok(());
        }

        let Some(m) = EpisodeMetrics::from_tensor_set(&averaged) else {
            return Err(TrainerError::State(
                "aggregated metrics have an unexpected layout".to_string(),
            ));
        };
        info!(
            "Episode {}/{}: reward={:.4}, steps={:.0}, balance={:.2}, actor_loss={:.4}, critic_loss={:.4}, q={:.4}, updates={:.0}",
            episode,
            self.config.episodes,
            m.episode_reward,
            m.episode_steps,
            m.final_balance,
            m.actor_loss,
            m.critic_loss,
            m.q_value_mean,
            m.training_updates
        );
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{StepInfo, StepResult};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_config(dir: &std::path::Path) -> TrainingConfig {
        TrainingConfig {
            batch_size: 8,
            accumulation_steps: 2,
            state_dim: 20,
            action_dim: 2,
            hidden_dim: 8,
            episodes: 2,
            max_steps_per_episode: 12,
            buffer_capacity: 64,
            log_interval: 1,
            checkpoint_interval: 1,
            checkpoint_dir: dir.to_path_buf(),
            sync_timeout_secs: 30,
            ..Default::default()
        }
    }

    struct PanickingEnv;

    impl Environment for PanickingEnv {
        fn reset(&mut self) -> Vec<f32> {
            panic!("market feed unavailable")
        }

        fn step(&mut self, _action: &[f32]) -> StepResult {
            StepResult {
                next_state: vec![0.0; 20],
                reward: 0.0,
                done: true,
                info: StepInfo::default(),
            }
        }

        fn state_dim(&self) -> usize {
            20
        }

        fn action_dim(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_single_worker_run_trains_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let trainer =
            DistributedTrainer::<TestBackend>::new(tiny_config(dir.path()), vec![Default::default()])
                .unwrap();

        let reports = trainer.launch(1).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].optimizer_steps > 0);
        assert!(reports[0].last_metrics.is_some());

        // episode 1 is checkpointed by rank 0
        let checkpointer = Checkpointer::new(dir.path(), 5).unwrap();
        assert!(checkpointer.exists(&crate::training::episode_name("ddpg", 1)));
    }

    #[test]
    fn test_worker_panic_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let trainer =
            DistributedTrainer::<TestBackend>::new(tiny_config(dir.path()), vec![Default::default()])
                .unwrap();

        let result = trainer.launch_with(2, |_| PanickingEnv);
        assert!(matches!(result, Err(TrainerError::WorkerPanicked { .. })));
    }

    #[test]
    fn test_environment_construction_panic_releases_peers() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            sync_timeout_secs: 30,
            ..tiny_config(dir.path())
        };
        let trainer =
            DistributedTrainer::<TestBackend>::new(config, vec![Default::default()]).unwrap();

        let started = std::time::Instant::now();
        let result = trainer.launch_with(2, |rank| {
            if rank == 1 {
                panic!("market feed unavailable");
            }
            SimulatedTradingEnvironment::with_seed(rank as u64)
        });

        assert!(matches!(
            result,
            Err(TrainerError::WorkerPanicked { rank: 1, .. })
        ));
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "peer waited {:?} for a worker that never started",
            started.elapsed()
        );
    }

    #[test]
    fn test_environment_shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            state_dim: 12,
            ..tiny_config(dir.path())
        };
        let trainer =
            DistributedTrainer::<TestBackend>::new(config, vec![Default::default()]).unwrap();

        let result =
            trainer.launch_with(1, |rank| SimulatedTradingEnvironment::with_seed(rank as u64));
        assert!(matches!(
            result,
            Err(TrainerError::Worker { rank: 0, .. })
        ));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
