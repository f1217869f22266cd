//! Rollouts through the real perception -> controller -> environment -> dynamics chain

use std::path::Path;

use yume_evolution::pipeline::{build_pool, init_artifacts, load_evaluator};
use yume_evolution::{
    CancelToken, CheckpointStore, Controller, StopReason, Trainer, TrainingConfig,
};
use yume_models::env;

fn config_in(dir: &Path) -> TrainingConfig {
    TrainingConfig {
        n_workers: 2,
        pop_size: 4,
        n_samples: 2,
        n_epochs: 2,
        time_limit: 60,
        latent_size: 4,
        hidden_size: 6,
        target_return: None,
        perception_path: dir.join("perception.ron"),
        dynamics_path: dir.join("dynamics.ron"),
        checkpoint_dir: dir.join("checkpoints"),
        ..Default::default()
    }
}

#[test]
fn test_evaluate_returns_k_finite_results() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    init_artifacts(&config, dir.path(), 3).unwrap();
    let evaluator = load_evaluator(&config).unwrap();

    let params: Vec<f64> = (0..evaluator.layout().parameter_count())
        .map(|i| ((i as f64) * 0.61).sin())
        .collect();
    let mut env = env::make(&config.env_name).unwrap();

    for k in [1, 3, 7] {
        let results = evaluator
            .evaluate(env.as_mut(), &params, k, config.time_limit, 11, &CancelToken::new())
            .unwrap();
        assert_eq!(results.len(), k);
        for r in results {
            assert!(r.total_return.is_finite());
            assert!(r.steps <= config.time_limit);
        }
    }
}

#[test]
fn test_evaluate_is_idempotent_for_fixed_seed() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    init_artifacts(&config, dir.path(), 3).unwrap();
    let evaluator = load_evaluator(&config).unwrap();

    let params: Vec<f64> = (0..evaluator.layout().parameter_count())
        .map(|i| ((i as f64) * 1.3).cos() * 0.5)
        .collect();

    let run = |seed| {
        let mut env = env::make(&config.env_name).unwrap();
        evaluator
            .evaluate(env.as_mut(), &params, 4, config.time_limit, seed, &CancelToken::new())
            .unwrap()
    };
    assert_eq!(run(5), run(5));
}

#[test]
fn test_pendulum_continuous_controller() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        env_name: "Pendulum-v1".to_string(),
        discrete_action_space: false,
        action_size: 1,
        ..config_in(dir.path())
    };
    config.validate().unwrap();
    init_artifacts(&config, dir.path(), 8).unwrap();
    let evaluator = load_evaluator(&config).unwrap();

    let params = vec![0.1; evaluator.layout().parameter_count()];
    let mut env = env::make(&config.env_name).unwrap();
    let results = evaluator
        .evaluate(env.as_mut(), &params, 2, 50, 0, &CancelToken::new())
        .unwrap();
    for r in results {
        // Pendulum rewards are costs: never positive
        assert!(r.total_return <= 0.0);
        assert_eq!(r.steps, 50);
    }
}

#[test]
fn test_short_training_run_on_cartpole() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    init_artifacts(&config, dir.path(), 21).unwrap();

    let evaluator = load_evaluator(&config).unwrap();
    let pool = build_pool(&config, evaluator.clone()).unwrap();
    let store = CheckpointStore::new(&config.checkpoint_dir).unwrap();
    let mut trainer = Trainer::new(config.clone(), pool, Some(store)).unwrap();
    let outcome = trainer.run(|_| {}).unwrap();

    assert_eq!(outcome.stop_reason, StopReason::GenerationCap);
    assert_eq!(outcome.generations, 2);
    let best = outcome.best.unwrap();
    // CartPole pays 1 per surviving step
    assert!(best.fitness >= 1.0 && best.fitness <= config.time_limit as f64);

    // The checkpoint alone is enough to replay the controller
    let checkpoint = CheckpointStore::new(&config.checkpoint_dir)
        .unwrap()
        .load()
        .unwrap();
    let controller: Controller = checkpoint.controller().unwrap();
    let mut env = env::make(&checkpoint.env_name).unwrap();
    let replay = evaluator
        .rollout(env.as_mut(), &controller.parameters, config.time_limit, 0, &CancelToken::new())
        .unwrap();
    assert!(replay.total_return.is_finite());
}
