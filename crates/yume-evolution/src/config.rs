//! Training configuration with layered loading
//!
//! Configuration is loaded from multiple sources (lowest to highest priority):
//! 1. Compiled defaults
//! 2. `yume.ron` in the working directory, or an explicit file
//! 3. Environment variables prefixed with `YUME_`
//!
//! Example environment variable: `YUME_POP_SIZE=32`

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use yume_models::{ActionSpace, env};

use crate::controller::{ActionPolicy, ControllerLayout};
use crate::error::{EvolutionError, Result};
use crate::fitness::FitnessAggregation;

/// Full configuration surface of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Environment name, see `yume_models::env::available()`
    pub env_name: String,
    /// Concurrent rollout workers
    pub n_workers: usize,
    /// Candidates sampled per generation
    pub pop_size: usize,
    /// Rollouts per candidate, averaged into its fitness
    pub n_samples: usize,
    /// Initial CMA-ES step size
    pub sigma: f64,
    /// Generation cap
    pub n_epochs: usize,
    /// Stop as soon as the best fitness reaches this value
    pub target_return: Option<f64>,
    pub discrete_action_space: bool,
    /// Number of discrete choices (discrete mode only)
    pub n_actions: usize,
    /// Width of the action vector fed to the dynamics model
    pub action_size: usize,
    pub latent_size: usize,
    pub hidden_size: usize,
    /// Hard cap on steps per rollout
    pub time_limit: usize,
    /// Master seed for sampling and environment resets
    pub seed: u64,
    pub perception_path: PathBuf,
    pub dynamics_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// Return assigned to failed rollouts and to jobs that exhaust their retries
    pub penalty: f64,
    /// Per-step reward discount (1.0 = undiscounted return)
    pub discount: f64,
    pub aggregation: FitnessAggregation,
    /// Generations without best-ever improvement before giving up
    pub patience: Option<usize>,
    /// Improvement smaller than this does not reset the patience counter
    pub min_improvement: f64,
    /// Step size below which the search counts as converged
    pub sigma_floor: f64,
    /// Wall-clock allowance per environment step, scales the job budget
    pub step_timeout_ms: u64,
    /// Resubmissions of a timed-out job before it is penalized
    pub max_retries: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            env_name: "CartPole-v1".to_string(),
            n_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            pop_size: 16,
            n_samples: 4,
            sigma: 0.1,
            n_epochs: 100,
            target_return: Some(475.0),
            discrete_action_space: true,
            n_actions: 2,
            action_size: 2,
            latent_size: 8,
            hidden_size: 16,
            time_limit: 500,
            seed: 0,
            perception_path: PathBuf::from("artifacts/perception.ron"),
            dynamics_path: PathBuf::from("artifacts/dynamics.ron"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            penalty: 0.0,
            discount: 1.0,
            aggregation: FitnessAggregation::Mean,
            patience: None,
            min_improvement: 0.0,
            sigma_floor: 1e-8,
            step_timeout_ms: 20,
            max_retries: 1,
        }
    }
}

impl TrainingConfig {
    /// Load configuration with layered priority:
    /// 1. Compiled defaults (lowest priority)
    /// 2. `path` if given (must exist), otherwise `yume.ron` if present
    /// 3. Environment variables prefixed with `YUME_` (highest priority)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Ron).required(true),
            None => File::with_name("yume")
                .format(FileFormat::Ron)
                .required(false),
        };

        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("YUME")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| EvolutionError::Configuration(format!("failed to read config: {}", e)))?;

        config
            .try_deserialize()
            .map_err(|e| EvolutionError::Configuration(format!("failed to parse config: {}", e)))
    }

    /// Check every constraint and report all violations at once
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.n_workers < 1 {
            problems.push("n_workers must be at least 1".to_string());
        }
        if self.pop_size < 1 {
            problems.push("pop_size must be at least 1".to_string());
        }
        if self.n_samples < 1 {
            problems.push("n_samples must be at least 1".to_string());
        }
        if self.n_epochs < 1 {
            problems.push("n_epochs must be at least 1".to_string());
        }
        if self.time_limit < 1 {
            problems.push("time_limit must be at least 1".to_string());
        }
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            problems.push(format!("sigma must be positive and finite, got {}", self.sigma));
        }
        if !self.penalty.is_finite() {
            problems.push("penalty must be finite".to_string());
        }
        if !(self.discount > 0.0 && self.discount <= 1.0) {
            problems.push(format!("discount must be in (0, 1], got {}", self.discount));
        }
        if self.latent_size < 1 || self.hidden_size < 1 || self.action_size < 1 {
            problems.push("latent_size, hidden_size and action_size must be at least 1".to_string());
        }
        if let Some(target) = self.target_return
            && !target.is_finite()
        {
            problems.push("target_return must be finite".to_string());
        }
        if let FitnessAggregation::Percentile(p) = self.aggregation
            && !(0.0..=100.0).contains(&p)
        {
            problems.push(format!("aggregation percentile must be in [0, 100], got {}", p));
        }
        if !self.min_improvement.is_finite() || self.min_improvement < 0.0 {
            problems.push("min_improvement must be finite and non-negative".to_string());
        }
        if !self.sigma_floor.is_finite() || self.sigma_floor < 0.0 {
            problems.push("sigma_floor must be finite and non-negative".to_string());
        }
        if self.step_timeout_ms == 0 {
            problems.push("step_timeout_ms must be positive".to_string());
        }

        if self.discrete_action_space {
            if self.n_actions < 2 {
                problems.push("discrete action space needs n_actions >= 2".to_string());
            }
            if self.action_size != self.n_actions {
                problems.push(format!(
                    "discrete actions are one-hot encoded: action_size ({}) must equal n_actions ({})",
                    self.action_size, self.n_actions
                ));
            }
        }

        match env::spec(&self.env_name) {
            None => problems.push(format!(
                "unknown environment '{}', available: {:?}",
                self.env_name,
                env::available()
            )),
            Some(spec) => match (spec.action_space, self.discrete_action_space) {
                (ActionSpace::Discrete(n), true) if n != self.n_actions => problems.push(format!(
                    "{} has {} discrete actions, n_actions is {}",
                    spec.name, n, self.n_actions
                )),
                (ActionSpace::Continuous(n), false) if n != self.action_size => {
                    problems.push(format!(
                        "{} expects {} continuous action values, action_size is {}",
                        spec.name, n, self.action_size
                    ))
                }
                (ActionSpace::Continuous(_), true) => problems.push(format!(
                    "{} has a continuous action space, set discrete_action_space = false",
                    spec.name
                )),
                (ActionSpace::Discrete(_), false) => problems.push(format!(
                    "{} has a discrete action space, set discrete_action_space = true",
                    spec.name
                )),
                _ => {}
            },
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EvolutionError::Configuration(problems.join("; ")))
        }
    }

    /// Controller shape implied by this configuration
    pub fn controller_layout(&self) -> ControllerLayout {
        let policy = if self.discrete_action_space {
            ActionPolicy::Discrete {
                n_actions: self.n_actions,
            }
        } else {
            ActionPolicy::Continuous {
                action_size: self.action_size,
            }
        };
        ControllerLayout {
            latent_size: self.latent_size,
            hidden_size: self.hidden_size,
            policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrainingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.env_name, "CartPole-v1");
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.aggregation, FitnessAggregation::Mean);
    }

    #[test]
    fn test_invalid_pop_and_workers_reported_together() {
        let config = TrainingConfig {
            pop_size: 0,
            n_workers: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("pop_size"));
        assert!(err.contains("n_workers"));
    }

    #[test]
    fn test_unknown_environment() {
        let config = TrainingConfig {
            env_name: "Atlantis-v0".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EvolutionError::Configuration(_))
        ));
    }

    #[test]
    fn test_action_space_mismatch() {
        let config = TrainingConfig {
            env_name: "Pendulum-v1".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrainingConfig {
            env_name: "Pendulum-v1".to_string(),
            discrete_action_space: false,
            action_size: 1,
            target_return: None,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_numeric_ranges() {
        for config in [
            TrainingConfig {
                sigma: 0.0,
                ..Default::default()
            },
            TrainingConfig {
                discount: 1.5,
                ..Default::default()
            },
            TrainingConfig {
                penalty: f64::NEG_INFINITY,
                ..Default::default()
            },
            TrainingConfig {
                aggregation: FitnessAggregation::Percentile(120.0),
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }
    }

    #[test]
    fn test_load_from_ron_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ron");
        std::fs::write(&path, "(pop_size: 8, n_samples: 2, sigma: 0.5)").unwrap();

        let config = TrainingConfig::load(Some(&path)).unwrap();
        assert_eq!(config.pop_size, 8);
        assert_eq!(config.n_samples, 2);
        assert_eq!(config.sigma, 0.5);
        // Untouched fields keep their defaults
        assert_eq!(config.time_limit, 500);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        // No yume.ron next to the crate manifest
        let config = TrainingConfig::load(None).unwrap();
        assert_eq!(config.pop_size, 16);
        assert_eq!(config.env_name, "CartPole-v1");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let result = TrainingConfig::load(Some(Path::new("/no/such/yume.ron")));
        assert!(matches!(result, Err(EvolutionError::Configuration(_))));
    }
}
