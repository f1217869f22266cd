//! Wiring from a validated configuration to a ready-to-run evaluator and pool

use std::path::{Path, PathBuf};
use std::sync::Arc;

use yume_models::artifact;
use yume_models::{LinearEncoder, LstmDynamics, ModelError, env};

use crate::config::TrainingConfig;
use crate::error::{EvolutionError, Result};
use crate::evaluator::{EnvWorker, Evaluator};
use crate::pool::{PoolConfig, RolloutWorker, WorkerPool};

/// Load both artifacts and check them against the configuration and environment
pub fn load_evaluator(config: &TrainingConfig) -> Result<Arc<Evaluator>> {
    let spec = env::spec(&config.env_name).ok_or_else(|| {
        EvolutionError::Configuration(format!("unknown environment '{}'", config.env_name))
    })?;

    let perception: LinearEncoder = artifact::load(&config.perception_path)?;
    let dynamics: LstmDynamics = artifact::load(&config.dynamics_path)?;

    if perception.observation_size != spec.observation_size {
        return Err(EvolutionError::ArtifactLoad(ModelError::ArtifactLoad {
            path: config.perception_path.clone(),
            reason: format!(
                "encodes {} observation values, {} produces {}",
                perception.observation_size, spec.name, spec.observation_size
            ),
        }));
    }

    let evaluator = Evaluator::new(
        Arc::new(perception),
        Arc::new(dynamics),
        config.controller_layout(),
        config.discount,
        config.penalty,
    )?;
    Ok(Arc::new(evaluator))
}

/// Start `n_workers` workers, each with its own environment instance
pub fn build_pool(config: &TrainingConfig, evaluator: Arc<Evaluator>) -> Result<WorkerPool> {
    let env_name = config.env_name.clone();
    WorkerPool::new(PoolConfig::from_training(config), move |worker| {
        let env = env::make(&env_name).map_err(|e| EvolutionError::WorkerStartup {
            worker,
            reason: e.to_string(),
        })?;
        let worker: Box<dyn RolloutWorker> = Box::new(EnvWorker::new(evaluator.clone(), env)?);
        Ok(worker)
    })
}

/// Write untrained perception and dynamics artifacts matching the configuration
pub fn init_artifacts(config: &TrainingConfig, dir: &Path, seed: u64) -> Result<(PathBuf, PathBuf)> {
    let spec = env::spec(&config.env_name).ok_or_else(|| {
        EvolutionError::Configuration(format!("unknown environment '{}'", config.env_name))
    })?;

    let perception = LinearEncoder::random(spec.observation_size, config.latent_size, seed);
    let dynamics = LstmDynamics::random(
        config.latent_size,
        config.action_size,
        config.hidden_size,
        seed.wrapping_add(1),
    );

    let perception_path = dir.join("perception.ron");
    let dynamics_path = dir.join("dynamics.ron");
    artifact::save(&perception, &perception_path)?;
    artifact::save(&dynamics, &dynamics_path)?;

    log::info!(
        "Wrote untrained artifacts for {} to {} (latent {}, hidden {})",
        spec.name,
        dir.display(),
        config.latent_size,
        config.hidden_size
    );
    Ok((perception_path, dynamics_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            n_workers: 2,
            latent_size: 3,
            hidden_size: 4,
            perception_path: dir.join("perception.ron"),
            dynamics_path: dir.join("dynamics.ron"),
            checkpoint_dir: dir.join("checkpoints"),
            ..Default::default()
        }
    }

    #[test]
    fn test_init_then_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config_in(dir.path());
        init_artifacts(&config, dir.path(), 5)?;

        let evaluator = load_evaluator(&config)?;
        assert_eq!(evaluator.layout().parameter_count(), (3 + 4) * 2 + 2);
        assert_eq!(evaluator.observation_size(), 4);

        let pool = build_pool(&config, evaluator)?;
        assert_eq!(pool.n_workers(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_artifact_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert!(matches!(
            load_evaluator(&config),
            Err(EvolutionError::ArtifactLoad(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch_is_load_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config_in(dir.path());
        init_artifacts(&config, dir.path(), 5)?;

        let wider = TrainingConfig {
            hidden_size: 8,
            ..config
        };
        assert!(matches!(
            load_evaluator(&wider),
            Err(EvolutionError::ArtifactLoad(_))
        ));
        Ok(())
    }
}
