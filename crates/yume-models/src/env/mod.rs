//! Environment abstraction for controller rollouts
//!
//! Mirrors the gym-style reset/step loop. Environments are not shared:
//! every worker owns its own instance, so the trait only requires `Send`.

mod cartpole;
mod pendulum;

pub use cartpole::CartPole;
pub use pendulum::Pendulum;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Raw observation as produced by an environment
pub type Observation = Vec<f32>;

/// Shape of the action an environment accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionSpace {
    /// One of `n` choices
    Discrete(usize),
    /// Vector of `n` values in [-1, 1]
    Continuous(usize),
}

impl ActionSpace {
    pub fn size(&self) -> usize {
        match self {
            ActionSpace::Discrete(n) | ActionSpace::Continuous(n) => *n,
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, ActionSpace::Discrete(_))
    }
}

/// Action passed to an environment (and fed back into the dynamics model)
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Discrete(usize),
    Continuous(Vec<f32>),
}

impl Action {
    /// Encode as a dense vector of `width` values.
    ///
    /// Discrete actions become one-hot, continuous actions are copied and
    /// zero-padded or truncated.
    pub fn to_vec(&self, width: usize) -> Vec<f32> {
        let mut encoded = vec![0.0; width];
        match self {
            Action::Discrete(choice) => {
                if let Some(slot) = encoded.get_mut(*choice) {
                    *slot = 1.0;
                }
            }
            Action::Continuous(values) => {
                for (slot, value) in encoded.iter_mut().zip(values) {
                    *slot = *value;
                }
            }
        }
        encoded
    }
}

/// Outcome of a single environment step
#[derive(Debug, Clone)]
pub struct Step {
    pub observation: Observation,
    pub reward: f64,
    /// Episode ended because of the task itself (pole fell, goal reached)
    pub terminated: bool,
    /// Episode ended because the environment's own step cap was reached
    pub truncated: bool,
}

impl Step {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Static description of an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvSpec {
    pub name: String,
    pub observation_size: usize,
    pub action_space: ActionSpace,
    /// Built-in episode cap (the trainer's `time_limit` may be lower)
    pub max_steps: usize,
    /// Return at which the task counts as solved
    pub solved_threshold: f64,
}

impl fmt::Display for EnvSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (obs={}, act={:?}, solved>={})",
            self.name, self.observation_size, self.action_space, self.solved_threshold
        )
    }
}

/// A simulated task driven one step at a time
pub trait Environment: Send {
    /// Start a new episode. The same seed must yield the same initial state.
    fn reset(&mut self, seed: u64) -> ModelResult<Observation>;

    /// Apply an action and advance one step
    fn step(&mut self, action: &Action) -> ModelResult<Step>;

    fn spec(&self) -> &EnvSpec;
}

/// Look up the spec of a built-in environment
pub fn spec(name: &str) -> Option<EnvSpec> {
    match name {
        CartPole::NAME => Some(CartPole::spec()),
        Pendulum::NAME => Some(Pendulum::spec()),
        _ => None,
    }
}

/// Names of all built-in environments
pub fn available() -> &'static [&'static str] {
    &[CartPole::NAME, Pendulum::NAME]
}

/// Create a fresh environment instance by name
pub fn make(name: &str) -> ModelResult<Box<dyn Environment>> {
    match name {
        CartPole::NAME => Ok(Box::new(CartPole::new())),
        Pendulum::NAME => Ok(Box::new(Pendulum::new())),
        other => Err(ModelError::UnknownEnvironment(other.to_string())),
    }
}

pub(crate) fn invalid_action(env: &str, action: &Action) -> ModelError {
    ModelError::Environment {
        env: env.to_string(),
        reason: format!("unsupported action {:?}", action),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discrete_action_one_hot() {
        assert_eq!(Action::Discrete(2).to_vec(4), vec![0.0, 0.0, 1.0, 0.0]);
        // Out of range choice encodes as all zeros rather than panicking
        assert_eq!(Action::Discrete(9).to_vec(2), vec![0.0, 0.0]);
    }

    #[test]
    fn test_continuous_action_padding() {
        let action = Action::Continuous(vec![0.5, -0.25]);
        assert_eq!(action.to_vec(3), vec![0.5, -0.25, 0.0]);
        assert_eq!(action.to_vec(1), vec![0.5]);
    }

    #[test]
    fn test_registry() {
        for name in available() {
            let env = make(name).unwrap();
            assert_eq!(env.spec().name, *name);
            assert_eq!(spec(name).as_ref(), Some(env.spec()));
        }
        assert!(matches!(
            make("Nope-v0"),
            Err(ModelError::UnknownEnvironment(_))
        ));
    }
}
