//! Dynamics model: recurrent memory over latent states and actions
//!
//! An LSTM cell consumes `[latent, action]` each step. Only the recurrent
//! state is needed at control time; the predictive head that forecasts the
//! next latent is a training concern and is not part of this artifact.

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, expect_len};
use crate::env::Action;
use crate::error::{ModelError, ModelResult};
use crate::math::{add_matvec, affine, glorot, sigmoid};

/// Recurrent state threaded through a rollout
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HiddenState {
    /// Exposed to the controller
    pub h: Vec<f32>,
    /// LSTM cell memory
    pub c: Vec<f32>,
}

impl HiddenState {
    pub fn zeros(hidden_size: usize) -> Self {
        Self {
            h: vec![0.0; hidden_size],
            c: vec![0.0; hidden_size],
        }
    }
}

/// Read-only sequence model, shared by every worker
pub trait Dynamics: Send + Sync {
    fn latent_size(&self) -> usize;

    /// Width of the dense action encoding the model was trained on
    fn action_size(&self) -> usize;

    fn hidden_size(&self) -> usize;

    fn initial_state(&self) -> HiddenState {
        HiddenState::zeros(self.hidden_size())
    }

    /// Advance the recurrent state by one environment step
    fn step(&self, latent: &[f32], action: &Action, state: &HiddenState)
    -> ModelResult<HiddenState>;
}

/// Single-layer LSTM over `[latent, action]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmDynamics {
    pub latent_size: usize,
    pub action_size: usize,
    pub hidden_size: usize,
    /// `4*hidden x (latent + action)`, gate order input, forget, cell, output
    pub input_weights: Vec<f32>,
    /// `4*hidden x hidden`
    pub recurrent_weights: Vec<f32>,
    /// `4*hidden`
    pub bias: Vec<f32>,
}

impl LstmDynamics {
    /// Untrained cell with Glorot weights and forget-gate bias of 1
    pub fn random(latent_size: usize, action_size: usize, hidden_size: usize, seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let input_size = latent_size + action_size;
        let gates = 4 * hidden_size;

        let mut bias = vec![0.0; gates];
        for b in &mut bias[hidden_size..2 * hidden_size] {
            *b = 1.0;
        }

        Self {
            latent_size,
            action_size,
            hidden_size,
            input_weights: glorot(&mut rng, input_size, gates, gates * input_size),
            recurrent_weights: glorot(&mut rng, hidden_size, gates, gates * hidden_size),
            bias,
        }
    }

    fn input_size(&self) -> usize {
        self.latent_size + self.action_size
    }
}

impl Dynamics for LstmDynamics {
    fn latent_size(&self) -> usize {
        self.latent_size
    }

    fn action_size(&self) -> usize {
        self.action_size
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn step(
        &self,
        latent: &[f32],
        action: &Action,
        state: &HiddenState,
    ) -> ModelResult<HiddenState> {
        if latent.len() != self.latent_size {
            return Err(ModelError::dimension(
                "dynamics latent input",
                self.latent_size,
                latent.len(),
            ));
        }
        if state.h.len() != self.hidden_size || state.c.len() != self.hidden_size {
            return Err(ModelError::dimension(
                "dynamics hidden state",
                self.hidden_size,
                state.h.len().min(state.c.len()),
            ));
        }

        let mut input = Vec::with_capacity(self.input_size());
        input.extend_from_slice(latent);
        input.extend(action.to_vec(self.action_size));

        let mut gates = affine(&self.input_weights, &self.bias, &input);
        add_matvec(&mut gates, &self.recurrent_weights, &state.h);

        let n = self.hidden_size;
        let mut next = HiddenState::zeros(n);
        for k in 0..n {
            let i = sigmoid(gates[k]);
            let f = sigmoid(gates[n + k]);
            let g = gates[2 * n + k].tanh();
            let o = sigmoid(gates[3 * n + k]);
            next.c[k] = f * state.c[k] + i * g;
            next.h[k] = o * next.c[k].tanh();
        }

        if next.h.iter().chain(&next.c).any(|v| !v.is_finite()) {
            return Err(ModelError::Inference {
                model: Self::KIND,
                reason: "hidden state diverged".to_string(),
            });
        }
        Ok(next)
    }
}

impl Artifact for LstmDynamics {
    const KIND: &'static str = "dynamics";

    fn validate(&self) -> ModelResult<()> {
        if self.latent_size == 0 || self.action_size == 0 || self.hidden_size == 0 {
            return Err(ModelError::Inference {
                model: Self::KIND,
                reason: "latent, action and hidden sizes must be non-zero".to_string(),
            });
        }
        let gates = 4 * self.hidden_size;
        expect_len(
            "dynamics input_weights",
            &self.input_weights,
            gates * self.input_size(),
        )?;
        expect_len(
            "dynamics recurrent_weights",
            &self.recurrent_weights,
            gates * self.hidden_size,
        )?;
        expect_len("dynamics bias", &self.bias, gates)?;
        Ok(())
    }
}
