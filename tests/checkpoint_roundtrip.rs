use ddpg_trader::training::Checkpointer;
use ddpg_trader::{AgentConfig, DdpgAgent, DefaultBackend, Transition};

fn config() -> AgentConfig {
    AgentConfig {
        state_dim: 5,
        action_dim: 2,
        hidden_dim: 12,
        buffer_capacity: 500,
        dropout: 0.0,
        ..Default::default()
    }
}

fn trained_agent() -> DdpgAgent<DefaultBackend> {
    let mut agent = DdpgAgent::new(config(), &Default::default(), 3).unwrap();
    for i in 0..200 {
        let x = (i as f32 * 0.37).sin();
        agent
            .store_transition(Transition::new(
                vec![x; 5],
                vec![x, -x],
                x * 0.1,
                vec![x * 0.9; 5],
                i % 40 == 39,
            ))
            .unwrap();
    }
    for _ in 0..3 {
        agent.train_step(32).unwrap().unwrap();
    }
    agent
}

/// Saving then loading reproduces parameters, targets, step and optimizer
/// state.
#[test]
fn checkpoint_roundtrip_restores_full_state() {
    let dir = tempfile::tempdir().unwrap();
    let checkpointer = Checkpointer::new(dir.path(), 5).unwrap();

    let mut original = trained_agent();
    checkpointer.save_episode(&original, 100).unwrap();

    let name = checkpointer.latest_checkpoint().expect("checkpoint listed");
    let mut restored: DdpgAgent<DefaultBackend> =
        checkpointer.load(&name, &Default::default(), 3).unwrap();

    assert_eq!(restored.step(), 3);
    assert_eq!(restored.config(), original.config());
    assert_eq!(restored.replica_parameters(), original.replica_parameters());
    assert!(restored.buffer().is_empty());

    // Identical gradients give identical updates only if the optimizer
    // moments were restored too.
    let value_grads = original.value_parameters();
    let policy_grads = original.policy_parameters();
    original
        .apply_gradients(value_grads.clone(), policy_grads.clone())
        .unwrap();
    restored.apply_gradients(value_grads, policy_grads).unwrap();

    let diff = original
        .replica_parameters()
        .max_abs_diff(&restored.replica_parameters())
        .unwrap();
    assert!(diff < 1e-6, "post-restore updates diverged by {diff}");
}

#[test]
fn agent_save_and_load_by_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.mpk");

    let agent = trained_agent();
    agent.save(&path).unwrap();

    let restored = DdpgAgent::<DefaultBackend>::load(&path, &Default::default(), 9).unwrap();
    assert_eq!(restored.policy_parameters(), agent.policy_parameters());
    assert_eq!(
        restored.value_target_parameters(),
        agent.value_target_parameters()
    );
}

/// Any extension handed to `save` is handed back to `load` unchanged.
#[test]
fn agent_roundtrip_through_foreign_extension() {
    let dir = tempfile::tempdir().unwrap();
    let agent = trained_agent();

    for name in ["agent.ckpt", "agent_no_extension"] {
        let path = dir.path().join(name);
        agent.save(&path).unwrap();

        let restored = DdpgAgent::<DefaultBackend>::load(&path, &Default::default(), 1).unwrap();
        assert_eq!(restored.step(), agent.step());
        assert_eq!(restored.replica_parameters(), agent.replica_parameters());
    }
}
