use ddpg_trader::distributed::{ClusterFabric, LocalFabric, SyncPoint};
use ddpg_trader::{DefaultBackend, DistributedTrainer, TrainingConfig};
use std::time::Duration;

fn two_worker_config(dir: &std::path::Path) -> TrainingConfig {
    TrainingConfig {
        batch_size: 16,
        accumulation_steps: 2,
        world_size: 2,
        hidden_dim: 16,
        episodes: 2,
        max_steps_per_episode: 24,
        buffer_capacity: 256,
        log_interval: 1,
        checkpoint_interval: 100,
        checkpoint_dir: dir.to_path_buf(),
        sync_timeout_secs: 60,
        ..Default::default()
    }
}

/// After synchronized cycles every replica holds bit-identical live and
/// target parameters.
#[test]
fn replicas_stay_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = DistributedTrainer::<DefaultBackend>::new(
        two_worker_config(dir.path()),
        vec![Default::default()],
    )
    .unwrap();

    let reports = trainer.run().expect("two-worker run should succeed");
    assert_eq!(reports.len(), 2);

    let (a, b) = (&reports[0], &reports[1]);
    assert!(a.optimizer_steps > 0, "workers should have trained");
    assert_eq!(a.optimizer_steps, b.optimizer_steps);
    assert_eq!(
        a.parameters, b.parameters,
        "replica parameters diverged between rank 0 and rank 1"
    );
}

/// The effective batch per optimizer step covers every worker's sub-batches.
#[test]
fn effective_batch_size_formula() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_worker_config(dir.path());
    assert_eq!(config.effective_batch_size(), 16 * 2 * 2);
}

/// A worker that never shows up turns into a timeout, not a hang.
#[test]
fn absent_peer_times_out() {
    let fabrics = LocalFabric::group(3, Duration::from_millis(100)).unwrap();

    let result = std::thread::scope(|scope| {
        let peer = scope.spawn(|| fabrics[1].barrier(SyncPoint::Initialize));
        let own = fabrics[0].barrier(SyncPoint::Initialize);
        (own, peer.join().unwrap())
    });

    assert!(result.0.is_err());
    assert!(result.1.is_err());
}
