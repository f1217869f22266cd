//! Linear controller: `[latent ; hidden] -> action`
//!
//! The controller is the only thing the search optimizes. Its parameters
//! are a flat vector of `(latent + hidden) * outputs` weights followed by
//! `outputs` biases, row-major per output.

use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use yume_models::Action;

use crate::error::{EvolutionError, Result};

/// Immutable flat parameter vector, cheap to hand to several workers
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterVector(Arc<[f64]>);

impl ParameterVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values.into())
    }

    pub fn zeros(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl Deref for ParameterVector {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

impl From<Vec<f64>> for ParameterVector {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

impl Serialize for ParameterVector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.as_slice().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParameterVector {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        Vec::<f64>::deserialize(deserializer).map(Self::new)
    }
}

/// How controller outputs become an environment action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionPolicy {
    /// `tanh` of each output, so values land in [-1, 1]
    Continuous { action_size: usize },
    /// Index of the largest output (lowest index wins ties)
    Discrete { n_actions: usize },
}

impl ActionPolicy {
    pub fn output_size(&self) -> usize {
        match self {
            ActionPolicy::Continuous { action_size } => *action_size,
            ActionPolicy::Discrete { n_actions } => *n_actions,
        }
    }
}

/// Shape of the controller, fixed for a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerLayout {
    pub latent_size: usize,
    pub hidden_size: usize,
    pub policy: ActionPolicy,
}

impl ControllerLayout {
    pub fn input_size(&self) -> usize {
        self.latent_size + self.hidden_size
    }

    pub fn output_size(&self) -> usize {
        self.policy.output_size()
    }

    /// Number of values the search optimizes
    pub fn parameter_count(&self) -> usize {
        self.input_size() * self.output_size() + self.output_size()
    }

    pub fn check_parameters(&self, parameters: &[f64]) -> Result<()> {
        let expected = self.parameter_count();
        if parameters.len() != expected {
            return Err(EvolutionError::ParameterCount {
                expected,
                actual: parameters.len(),
            });
        }
        Ok(())
    }

    /// Map the current latent vector and recurrent hidden state to an action.
    ///
    /// Pure: the same inputs always give the same action.
    pub fn act(&self, latent: &[f32], hidden: &[f32], parameters: &[f64]) -> Result<Action> {
        self.check_parameters(parameters)?;
        if latent.len() != self.latent_size || hidden.len() != self.hidden_size {
            return Err(EvolutionError::Configuration(format!(
                "controller expects latent {} + hidden {}, got {} + {}",
                self.latent_size,
                self.hidden_size,
                latent.len(),
                hidden.len()
            )));
        }

        let inputs = self.input_size();
        let outputs = self.output_size();
        let (weights, bias) = parameters.split_at(inputs * outputs);

        let raw: Vec<f64> = weights
            .chunks_exact(inputs)
            .zip(bias)
            .map(|(row, b)| {
                row.iter()
                    .zip(latent.iter().chain(hidden))
                    .map(|(w, x)| w * f64::from(*x))
                    .sum::<f64>()
                    + b
            })
            .collect();

        Ok(match self.policy {
            ActionPolicy::Continuous { .. } => {
                Action::Continuous(raw.iter().map(|v| v.tanh() as f32).collect())
            }
            ActionPolicy::Discrete { .. } => Action::Discrete(argmax(&raw)),
        })
    }
}

/// First index of the maximum; NaN never wins
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] || (values[best].is_nan() && !v.is_nan()) {
            best = i;
        }
    }
    best
}

/// A controller bound to concrete parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub layout: ControllerLayout,
    pub parameters: ParameterVector,
}

impl Controller {
    pub fn new(layout: ControllerLayout, parameters: ParameterVector) -> Result<Self> {
        layout.check_parameters(&parameters)?;
        Ok(Self { layout, parameters })
    }

    pub fn act(&self, latent: &[f32], hidden: &[f32]) -> Result<Action> {
        self.layout.act(latent, hidden, &self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discrete(latent_size: usize, hidden_size: usize, n_actions: usize) -> ControllerLayout {
        ControllerLayout {
            latent_size,
            hidden_size,
            policy: ActionPolicy::Discrete { n_actions },
        }
    }

    #[test]
    fn test_parameter_count() {
        let layout = discrete(32, 256, 3);
        assert_eq!(layout.parameter_count(), (32 + 256) * 3 + 3);

        let layout = ControllerLayout {
            latent_size: 8,
            hidden_size: 16,
            policy: ActionPolicy::Continuous { action_size: 1 },
        };
        assert_eq!(layout.parameter_count(), 25);
    }

    #[test]
    fn test_wrong_parameter_count_rejected() {
        let layout = discrete(2, 2, 2);
        let result = layout.act(&[0.0; 2], &[0.0; 2], &[0.0; 3]);
        assert!(matches!(
            result,
            Err(EvolutionError::ParameterCount {
                expected: 10,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_discrete_argmax() {
        let layout = discrete(1, 1, 2);
        // output 0 = x0, output 1 = -x0, no bias
        let params = [1.0, 0.0, -1.0, 0.0, 0.0, 0.0];
        assert_eq!(
            layout.act(&[1.0], &[0.0], &params).unwrap(),
            Action::Discrete(0)
        );
        assert_eq!(
            layout.act(&[-1.0], &[0.0], &params).unwrap(),
            Action::Discrete(1)
        );
    }

    #[test]
    fn test_discrete_tie_picks_lowest_index() {
        let layout = discrete(1, 1, 3);
        let params = vec![0.0; layout.parameter_count()];
        assert_eq!(
            layout.act(&[0.3], &[0.7], &params).unwrap(),
            Action::Discrete(0)
        );
    }

    #[test]
    fn test_continuous_is_bounded() {
        let layout = ControllerLayout {
            latent_size: 2,
            hidden_size: 1,
            policy: ActionPolicy::Continuous { action_size: 2 },
        };
        let params = vec![100.0; layout.parameter_count()];
        let Action::Continuous(values) = layout.act(&[1.0, 1.0], &[1.0], &params).unwrap() else {
            panic!("expected continuous action");
        };
        assert_eq!(values.len(), 2);
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_act_is_deterministic() {
        let layout = discrete(3, 2, 4);
        let params: Vec<f64> = (0..layout.parameter_count())
            .map(|i| (i as f64 * 0.37).sin())
            .collect();
        let a = layout.act(&[0.1, -0.2, 0.3], &[0.5, -0.5], &params).unwrap();
        let b = layout.act(&[0.1, -0.2, 0.3], &[0.5, -0.5], &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_argmax_skips_nan() {
        assert_eq!(argmax(&[f64::NAN, 1.0, 0.5]), 1);
        assert_eq!(argmax(&[2.0, 2.0]), 0);
    }
}
