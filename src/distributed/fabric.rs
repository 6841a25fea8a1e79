//! Collective communication between workers
//!
//! A [`ClusterFabric`] gives each worker its rank and the collectives the
//! trainer needs: averaging all-reduce, broadcast from rank 0 and a barrier.
//! Every collective carries a [`SyncPoint`] so workers that reach different
//! points fail fast instead of silently mixing payloads.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::networks::TensorSet;

/// Failures of collective operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FabricError {
    #[error("rank {rank} timed out after {waited:?} waiting for peers at {point}")]
    Timeout {
        rank: usize,
        point: SyncPoint,
        waited: Duration,
    },

    #[error("rank {rank} left the group")]
    PeerDeparted { rank: usize },

    #[error("workers out of step: rank 0 reached {expected}, rank {rank} reached {found}")]
    Desync {
        rank: usize,
        expected: SyncPoint,
        found: SyncPoint,
    },

    #[error("payload from rank {rank} does not match rank 0's layout")]
    PayloadMismatch { rank: usize },

    #[error("fabric already torn down on rank {rank}")]
    TornDown { rank: usize },

    #[error("invalid group: {0}")]
    InvalidGroup(String),
}

/// Identifies one collective call; all ranks must pass the same point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPoint {
    /// Initial parameter broadcast
    Initialize,
    /// Gradient all-reduce of one optimizer cycle
    Gradients { cycle: u64 },
    /// Metric aggregation for one episode
    Metrics { episode: u64 },
    /// Final barrier before teardown
    Shutdown,
}

impl fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPoint::Initialize => write!(f, "initialize"),
            SyncPoint::Gradients { cycle } => write!(f, "gradients#{cycle}"),
            SyncPoint::Metrics { episode } => write!(f, "metrics@episode{episode}"),
            SyncPoint::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Collective operations available to a worker
pub trait ClusterFabric: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise mean of every rank's set. All ranks receive the same
    /// values.
    fn all_reduce_average(&self, point: SyncPoint, set: TensorSet)
        -> Result<TensorSet, FabricError>;

    /// Rank 0's set, delivered to every rank
    fn broadcast(&self, point: SyncPoint, set: TensorSet) -> Result<TensorSet, FabricError>;

    /// Block until every rank arrives
    fn barrier(&self, point: SyncPoint) -> Result<(), FabricError>;

    /// Leave the group. Peers blocked in a collective fail with
    /// [`FabricError::PeerDeparted`]. Idempotent.
    fn teardown(&self);
}

/// Tears the fabric down when dropped, including during unwinding
pub struct FabricGuard<'a> {
    fabric: &'a dyn ClusterFabric,
}

impl<'a> FabricGuard<'a> {
    pub fn new(fabric: &'a dyn ClusterFabric) -> Self {
        Self { fabric }
    }
}

impl Drop for FabricGuard<'_> {
    fn drop(&mut self) {
        self.fabric.teardown();
    }
}

// ============================================================================
// Single worker
// ============================================================================

/// Fabric for a world of one; every collective is the identity
#[derive(Debug, Default)]
pub struct SoloFabric {
    torn_down: AtomicBool,
}

impl SoloFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> Result<(), FabricError> {
        if self.torn_down.load(Ordering::Acquire) {
            Err(FabricError::TornDown { rank: 0 })
        } else {
            Ok(())
        }
    }
}

impl ClusterFabric for SoloFabric {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_average(
        &self,
        _point: SyncPoint,
        set: TensorSet,
    ) -> Result<TensorSet, FabricError> {
        self.check()?;
        Ok(set)
    }

    fn broadcast(&self, _point: SyncPoint, set: TensorSet) -> Result<TensorSet, FabricError> {
        self.check()?;
        Ok(set)
    }

    fn barrier(&self, _point: SyncPoint) -> Result<(), FabricError> {
        self.check()
    }

    fn teardown(&self) {
        self.torn_down.store(true, Ordering::Release);
    }
}

// ============================================================================
// In-process group
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Reduction {
    Average,
    FromRoot,
}

struct Exchange {
    generation: u64,
    arrived: usize,
    contributions: Vec<Option<(SyncPoint, TensorSet)>>,
    outcome: Option<Result<TensorSet, FabricError>>,
    departed: Vec<bool>,
    failure: Option<FabricError>,
}

struct Collective {
    world_size: usize,
    timeout: Duration,
    state: Mutex<Exchange>,
    arrivals: Condvar,
}

/// One member of a group of workers sharing a process.
///
/// The last rank to arrive at a collective computes the result in rank
/// order and publishes it to the others, so every rank sees bit-identical
/// values.
pub struct LocalFabric {
    rank: usize,
    shared: Arc<Collective>,
    torn_down: AtomicBool,
}

impl LocalFabric {
    /// Create connected members for ranks `0..world_size`
    pub fn group(world_size: usize, timeout: Duration) -> Result<Vec<LocalFabric>, FabricError> {
        if world_size == 0 {
            return Err(FabricError::InvalidGroup("world size must be > 0".to_string()));
        }
        let shared = Arc::new(Collective {
            world_size,
            timeout,
            state: Mutex::new(Exchange {
                generation: 0,
                arrived: 0,
                contributions: vec![None; world_size],
                outcome: None,
                departed: vec![false; world_size],
                failure: None,
            }),
            arrivals: Condvar::new(),
        });

        Ok((0..world_size)
            .map(|rank| LocalFabric {
                rank,
                shared: Arc::clone(&shared),
                torn_down: AtomicBool::new(false),
            })
            .collect())
    }

    fn exchange(
        &self,
        point: SyncPoint,
        set: TensorSet,
        reduction: Reduction,
    ) -> Result<TensorSet, FabricError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(FabricError::TornDown { rank: self.rank });
        }

        let shared = &self.shared;
        let mut state = shared.state.lock();
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        if let Some(rank) = state.departed.iter().position(|&d| d) {
            return Err(FabricError::PeerDeparted { rank });
        }

        let generation = state.generation;
        state.contributions[self.rank] = Some((point, set));
        state.arrived += 1;

        if state.arrived == shared.world_size {
            let contributions: Vec<(SyncPoint, TensorSet)> =
                state.contributions.iter_mut().filter_map(Option::take).collect();
            let outcome = reduce(contributions, reduction);
            if let Err(err) = &outcome {
                warn!(rank = self.rank, error = %err, "Collective failed");
                state.failure = Some(err.clone());
            }
            state.outcome = Some(outcome.clone());
            state.arrived = 0;
            state.generation += 1;
            shared.arrivals.notify_all();
            return outcome;
        }

        let deadline = Instant::now() + shared.timeout;
        while state.generation == generation {
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            if let Some(rank) = state.departed.iter().position(|&d| d) {
                let err = FabricError::PeerDeparted { rank };
                state.failure = Some(err.clone());
                shared.arrivals.notify_all();
                return Err(err);
            }
            if shared.arrivals.wait_until(&mut state, deadline).timed_out()
                && state.generation == generation
            {
                let err = FabricError::Timeout {
                    rank: self.rank,
                    point,
                    waited: shared.timeout,
                };
                state.failure = Some(err.clone());
                shared.arrivals.notify_all();
                return Err(err);
            }
        }

        match &state.outcome {
            Some(outcome) => outcome.clone(),
            None => Err(FabricError::TornDown { rank: self.rank }),
        }
    }
}

fn reduce(
    contributions: Vec<(SyncPoint, TensorSet)>,
    reduction: Reduction,
) -> Result<TensorSet, FabricError> {
    let Some((expected, root)) = contributions.first() else {
        return Ok(TensorSet::default());
    };
    for (rank, (found, _)) in contributions.iter().enumerate() {
        if found != expected {
            return Err(FabricError::Desync {
                rank,
                expected: *expected,
                found: *found,
            });
        }
    }

    match reduction {
        Reduction::FromRoot => Ok(root.clone()),
        Reduction::Average => {
            if let Some(rank) = contributions
                .iter()
                .position(|(_, set)| !set.same_layout(root))
            {
                return Err(FabricError::PayloadMismatch { rank });
            }
            let sets: Vec<TensorSet> = contributions.into_iter().map(|(_, set)| set).collect();
            TensorSet::mean(&sets).map_err(|_| FabricError::PayloadMismatch { rank: 0 })
        }
    }
}

impl ClusterFabric for LocalFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_average(
        &self,
        point: SyncPoint,
        set: TensorSet,
    ) -> Result<TensorSet, FabricError> {
        self.exchange(point, set, Reduction::Average)
    }

    fn broadcast(&self, point: SyncPoint, set: TensorSet) -> Result<TensorSet, FabricError> {
        self.exchange(point, set, Reduction::FromRoot)
    }

    fn barrier(&self, point: SyncPoint) -> Result<(), FabricError> {
        self.exchange(point, TensorSet::default(), Reduction::FromRoot)
            .map(|_| ())
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.shared.state.lock();
        state.departed[self.rank] = true;
        self.shared.arrivals.notify_all();
        debug!(rank = self.rank, "Left collective group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::FlatTensor;
    use std::thread;

    fn set(values: Vec<f32>) -> TensorSet {
        TensorSet::new(vec![FlatTensor {
            shape: vec![values.len()],
            values,
        }])
    }

    fn run_group<T, F>(world_size: usize, timeout: Duration, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&LocalFabric) -> T + Sync,
    {
        let fabrics = LocalFabric::group(world_size, timeout).unwrap();
        thread::scope(|scope| {
            let handles: Vec<_> = fabrics
                .iter()
                .map(|fabric| {
                    let f = &f;
                    scope.spawn(move || f(fabric))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_solo_fabric_is_identity() {
        let fabric = SoloFabric::new();
        let reduced = fabric
            .all_reduce_average(SyncPoint::Gradients { cycle: 0 }, set(vec![1.0, 2.0]))
            .unwrap();
        assert_eq!(reduced, set(vec![1.0, 2.0]));

        fabric.teardown();
        assert!(fabric.barrier(SyncPoint::Shutdown).is_err());
    }

    #[test]
    fn test_all_reduce_average_is_identical_on_every_rank() {
        let results = run_group(3, Duration::from_secs(5), |fabric| {
            let r = fabric.rank() as f32;
            fabric
                .all_reduce_average(SyncPoint::Gradients { cycle: 0 }, set(vec![r, 10.0 * r]))
                .unwrap()
        });

        for result in &results {
            assert_eq!(result, &set(vec![1.0, 10.0]));
        }
    }

    #[test]
    fn test_broadcast_delivers_root_payload() {
        let results = run_group(2, Duration::from_secs(5), |fabric| {
            let own = set(vec![fabric.rank() as f32 + 7.0]);
            fabric.broadcast(SyncPoint::Initialize, own).unwrap()
        });
        assert!(results.iter().all(|r| r == &set(vec![7.0])));
    }

    #[test]
    fn test_repeated_collectives_stay_in_step() {
        let results = run_group(2, Duration::from_secs(5), |fabric| {
            let mut last = TensorSet::default();
            for cycle in 0..50 {
                last = fabric
                    .all_reduce_average(
                        SyncPoint::Gradients { cycle },
                        set(vec![(fabric.rank() + cycle as usize) as f32]),
                    )
                    .unwrap();
            }
            fabric.barrier(SyncPoint::Shutdown).unwrap();
            last
        });
        assert!(results.iter().all(|r| r == &set(vec![49.5])));
    }

    #[test]
    fn test_mismatched_sync_points_fail_on_all_ranks() {
        let results = run_group(2, Duration::from_secs(5), |fabric| {
            let point = if fabric.rank() == 0 {
                SyncPoint::Gradients { cycle: 3 }
            } else {
                SyncPoint::Metrics { episode: 3 }
            };
            fabric.all_reduce_average(point, set(vec![1.0]))
        });
        for result in results {
            assert!(matches!(result, Err(FabricError::Desync { rank: 1, .. })));
        }
    }

    #[test]
    fn test_departed_peer_unblocks_waiters() {
        let results = run_group(2, Duration::from_secs(30), |fabric| {
            if fabric.rank() == 1 {
                fabric.teardown();
                return Ok(TensorSet::default());
            }
            fabric.all_reduce_average(SyncPoint::Gradients { cycle: 0 }, set(vec![1.0]))
        });
        assert!(matches!(
            results[0],
            Err(FabricError::PeerDeparted { rank: 1 })
        ));
    }

    #[test]
    fn test_missing_peer_times_out() {
        let fabrics = LocalFabric::group(2, Duration::from_millis(50)).unwrap();
        let result = fabrics[0].barrier(SyncPoint::Shutdown);
        assert!(matches!(result, Err(FabricError::Timeout { rank: 0, .. })));

        // the group stays failed afterwards
        assert!(fabrics[1].barrier(SyncPoint::Shutdown).is_err());
    }

    #[test]
    fn test_layout_mismatch_is_reported() {
        let results = run_group(2, Duration::from_secs(5), |fabric| {
            let payload = if fabric.rank() == 0 {
                set(vec![1.0])
            } else {
                set(vec![1.0, 2.0])
            };
            fabric.all_reduce_average(SyncPoint::Gradients { cycle: 0 }, payload)
        });
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(FabricError::PayloadMismatch { rank: 1 }))));
    }
}
