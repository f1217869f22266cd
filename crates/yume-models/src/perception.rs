//! Perception model: compresses an observation into a latent vector
//!
//! The encoder is the inference half of a variational autoencoder. It
//! predicts a diagonal Gaussian (`mu`, `logsigma`) per observation; rollouts
//! consume `mu` so that a fixed observation always maps to the same latent.

use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, expect_len};
use crate::error::{ModelError, ModelResult};
use crate::math::{affine, glorot};

/// Read-only observation encoder, shared by every worker
pub trait Perception: Send + Sync {
    fn observation_size(&self) -> usize;

    fn latent_size(&self) -> usize;

    /// Encode one observation into a latent vector of `latent_size()` values
    fn encode(&self, observation: &[f32]) -> ModelResult<Vec<f32>>;
}

/// Single affine Gaussian encoder head
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearEncoder {
    pub observation_size: usize,
    pub latent_size: usize,
    /// `latent_size x observation_size`, row-major
    pub mu_weights: Vec<f32>,
    pub mu_bias: Vec<f32>,
    /// `latent_size x observation_size`, row-major
    pub logsigma_weights: Vec<f32>,
    pub logsigma_bias: Vec<f32>,
}

impl LinearEncoder {
    /// Untrained encoder with Glorot-initialized weights
    pub fn random(observation_size: usize, latent_size: usize, seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let count = observation_size * latent_size;
        Self {
            observation_size,
            latent_size,
            mu_weights: glorot(&mut rng, observation_size, latent_size, count),
            mu_bias: vec![0.0; latent_size],
            logsigma_weights: vec![0.0; count],
            // Start with a narrow posterior
            logsigma_bias: vec![-3.0; latent_size],
        }
    }

    /// Posterior parameters `(mu, logsigma)` for one observation
    pub fn distribution(&self, observation: &[f32]) -> ModelResult<(Vec<f32>, Vec<f32>)> {
        if observation.len() != self.observation_size {
            return Err(ModelError::dimension(
                "perception input",
                self.observation_size,
                observation.len(),
            ));
        }
        let mu = affine(&self.mu_weights, &self.mu_bias, observation);
        let logsigma = affine(&self.logsigma_weights, &self.logsigma_bias, observation);
        Ok((mu, logsigma))
    }

    /// Reparameterized draw `z = mu + exp(logsigma) * eps`
    pub fn sample(&self, observation: &[f32], seed: u64) -> ModelResult<Vec<f32>> {
        let (mu, logsigma) = self.distribution(observation)?;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        Ok(mu
            .iter()
            .zip(&logsigma)
            .map(|(m, s)| {
                let eps: f32 = StandardNormal.sample(&mut rng);
                m + s.exp() * eps
            })
            .collect())
    }
}

impl Perception for LinearEncoder {
    fn observation_size(&self) -> usize {
        self.observation_size
    }

    fn latent_size(&self) -> usize {
        self.latent_size
    }

    fn encode(&self, observation: &[f32]) -> ModelResult<Vec<f32>> {
        let (mu, _) = self.distribution(observation)?;
        if mu.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::Inference {
                model: Self::KIND,
                reason: "latent vector is not finite".to_string(),
            });
        }
        Ok(mu)
    }
}

impl Artifact for LinearEncoder {
    const KIND: &'static str = "perception";

    fn validate(&self) -> ModelResult<()> {
        if self.observation_size == 0 || self.latent_size == 0 {
            return Err(ModelError::Inference {
                model: Self::KIND,
                reason: "observation and latent sizes must be non-zero".to_string(),
            });
        }
        let count = self.observation_size * self.latent_size;
        expect_len("perception mu_weights", &self.mu_weights, count)?;
        expect_len("perception mu_bias", &self.mu_bias, self.latent_size)?;
        expect_len("perception logsigma_weights", &self.logsigma_weights, count)?;
        expect_len("perception logsigma_bias", &self.logsigma_bias, self.latent_size)?;
        Ok(())
    }
}
