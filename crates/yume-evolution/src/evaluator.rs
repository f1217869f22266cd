//! Rollouts of one controller candidate in a real environment
//!
//! Each step runs the full perception -> controller -> environment ->
//! dynamics chain. A rollout never fails the generation: environment
//! errors, model errors, panics and non-finite returns all turn into a
//! `Failed` result carrying the configured penalty.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use yume_models::{Dynamics, Environment, ModelError, Perception};

use crate::controller::{ActionPolicy, ControllerLayout};
use crate::error::{EvolutionError, Result};
use crate::pool::{Job, RolloutWorker};

/// Shared flag telling a running evaluation to stop early
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The evaluation was abandoned because its token was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutStatus {
    /// The environment terminated or truncated the episode
    Completed,
    /// `time_limit` steps were taken without the episode ending
    TimeLimit,
    /// Something went wrong; the return is the penalty
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RolloutResult {
    pub total_return: f64,
    pub steps: usize,
    pub status: RolloutStatus,
}

impl RolloutResult {
    pub fn failed(penalty: f64, steps: usize) -> Self {
        Self {
            total_return: penalty,
            steps,
            status: RolloutStatus::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == RolloutStatus::Failed
    }
}

enum RolloutError {
    Cancelled,
    Failed { steps: usize, reason: String },
}

/// Perception and dynamics models plus the controller shape, shared read-only by all workers
pub struct Evaluator {
    perception: Arc<dyn Perception>,
    dynamics: Arc<dyn Dynamics>,
    layout: ControllerLayout,
    discount: f64,
    penalty: f64,
}

impl Evaluator {
    /// Check that the models and controller agree on every dimension
    pub fn new(
        perception: Arc<dyn Perception>,
        dynamics: Arc<dyn Dynamics>,
        layout: ControllerLayout,
        discount: f64,
        penalty: f64,
    ) -> Result<Self> {
        let action_width = match layout.policy {
            ActionPolicy::Discrete { n_actions } => n_actions,
            ActionPolicy::Continuous { action_size } => action_size,
        };
        let checks = [
            ("perception latent size", layout.latent_size, perception.latent_size()),
            ("dynamics latent size", layout.latent_size, dynamics.latent_size()),
            ("dynamics hidden size", layout.hidden_size, dynamics.hidden_size()),
            ("dynamics action size", action_width, dynamics.action_size()),
        ];
        for (what, expected, actual) in checks {
            if expected != actual {
                return Err(EvolutionError::ArtifactLoad(ModelError::Dimension {
                    what: what.to_string(),
                    expected,
                    actual,
                }));
            }
        }

        Ok(Self {
            perception,
            dynamics,
            layout,
            discount,
            penalty,
        })
    }

    pub fn layout(&self) -> &ControllerLayout {
        &self.layout
    }

    pub fn penalty(&self) -> f64 {
        self.penalty
    }

    pub fn observation_size(&self) -> usize {
        self.perception.observation_size()
    }

    /// Run a single episode of at most `time_limit` steps
    pub fn rollout(
        &self,
        env: &mut dyn Environment,
        parameters: &[f64],
        time_limit: usize,
        seed: u64,
        cancel: &CancelToken,
    ) -> std::result::Result<RolloutResult, Cancelled> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.try_rollout(env, parameters, time_limit, seed, cancel)
        }));

        let (steps, reason) = match outcome {
            Ok(Ok(result)) if result.total_return.is_finite() => return Ok(result),
            Ok(Ok(result)) => (result.steps, "non-finite return".to_string()),
            Ok(Err(RolloutError::Cancelled)) => return Err(Cancelled),
            Ok(Err(RolloutError::Failed { steps, reason })) => (steps, reason),
            Err(panic) => (0, format!("panicked: {}", panic_message(&*panic))),
        };

        log::warn!(
            "Rollout on {} (seed {}) failed after {} steps: {}",
            env.spec().name,
            seed,
            steps,
            reason
        );
        Ok(RolloutResult::failed(self.penalty, steps))
    }

    /// Run `rollout_count` independent episodes with seeds derived from `seed_base`
    pub fn evaluate(
        &self,
        env: &mut dyn Environment,
        parameters: &[f64],
        rollout_count: usize,
        time_limit: usize,
        seed_base: u64,
        cancel: &CancelToken,
    ) -> std::result::Result<Vec<RolloutResult>, Cancelled> {
        (0..rollout_count)
            .map(|k| {
                let seed = derive_seed(seed_base, k);
                self.rollout(env, parameters, time_limit, seed, cancel)
            })
            .collect()
    }

    fn try_rollout(
        &self,
        env: &mut dyn Environment,
        parameters: &[f64],
        time_limit: usize,
        seed: u64,
        cancel: &CancelToken,
    ) -> std::result::Result<RolloutResult, RolloutError> {
        self.layout
            .check_parameters(parameters)
            .map_err(|e| failed(0, e))?;

        let mut observation = env.reset(seed).map_err(|e| failed(0, e))?;
        let mut state = self.dynamics.initial_state();
        let mut total_return = 0.0;
        let mut weight = 1.0;

        for t in 0..time_limit {
            if cancel.is_cancelled() {
                return Err(RolloutError::Cancelled);
            }

            let latent = self
                .perception
                .encode(&observation)
                .map_err(|e| failed(t, e))?;
            let action = self
                .layout
                .act(&latent, &state.h, parameters)
                .map_err(|e| failed(t, e))?;
            let step = env.step(&action).map_err(|e| failed(t, e))?;

            total_return += weight * step.reward;
            weight *= self.discount;

            if step.done() {
                return Ok(RolloutResult {
                    total_return,
                    steps: t + 1,
                    status: RolloutStatus::Completed,
                });
            }

            state = self
                .dynamics
                .step(&latent, &action, &state)
                .map_err(|e| failed(t + 1, e))?;
            observation = step.observation;
        }

        Ok(RolloutResult {
            total_return,
            steps: time_limit,
            status: RolloutStatus::TimeLimit,
        })
    }
}

fn failed(steps: usize, err: impl std::fmt::Display) -> RolloutError {
    RolloutError::Failed {
        steps,
        reason: err.to_string(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Deterministic per-rollout seed from a job seed and the rollout index
pub fn derive_seed(seed_base: u64, index: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed_base.hash(&mut hasher);
    index.hash(&mut hasher);
    hasher.finish()
}

/// Pool worker owning one environment instance
pub struct EnvWorker {
    evaluator: Arc<Evaluator>,
    env: Box<dyn Environment>,
}

impl EnvWorker {
    pub fn new(evaluator: Arc<Evaluator>, env: Box<dyn Environment>) -> Result<Self> {
        let spec = env.spec();
        if spec.observation_size != evaluator.observation_size() {
            return Err(EvolutionError::ArtifactLoad(ModelError::Dimension {
                what: format!("{} observation size", spec.name),
                expected: evaluator.observation_size(),
                actual: spec.observation_size,
            }));
        }
        Ok(Self { evaluator, env })
    }
}

impl RolloutWorker for EnvWorker {
    fn run(
        &mut self,
        job: &Job,
        cancel: &CancelToken,
    ) -> std::result::Result<Vec<RolloutResult>, Cancelled> {
        self.evaluator.evaluate(
            self.env.as_mut(),
            &job.parameters,
            job.rollout_count,
            job.time_limit,
            job.seed,
            cancel,
        )
    }
}
