//! Full-covariance CMA-ES over controller parameters
//!
//! Maximizes fitness. The distribution is sampled with `ask`, updated from
//! the ranked fitness of that population with `tell`, and walks an explicit
//! phase machine:
//!
//! ```text
//! Initialized -> Sampling -> Evaluating -> Updating -> Sampling | Converged | Terminated
//! ```
//!
//! Constants follow Hansen's CMA-ES tutorial (2016).

use std::fmt;

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::controller::ParameterVector;
use crate::error::{EvolutionError, Result};

const SIGMA_MIN: f64 = 1e-12;
const SIGMA_MAX: f64 = 1e6;
/// Condition number beyond which the covariance is regularized
const MAX_CONDITION: f64 = 1e14;
/// Smallest eigenvalue after regularization, relative to the largest
const REGULARIZATION: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPhase {
    Initialized,
    Sampling,
    Evaluating,
    Updating,
    Converged,
    Terminated,
}

impl SearchPhase {
    fn can_transition_to(self, next: SearchPhase) -> bool {
        use SearchPhase::*;
        matches!(
            (self, next),
            (Initialized, Sampling)
                | (Sampling, Evaluating)
                | (Evaluating, Updating)
                | (Updating, Sampling)
                | (Initialized | Sampling, Converged | Terminated)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, SearchPhase::Converged | SearchPhase::Terminated)
    }
}

impl fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of one distribution update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateReport {
    /// Covariance had to be regularized or reset
    pub regularized: bool,
    pub sigma: f64,
    /// Ratio of largest to smallest covariance eigenvalue
    pub condition: f64,
}

pub struct CmaEs {
    dimension: usize,
    lambda: usize,
    weights: DVector<f64>,
    mu_eff: f64,
    c_sigma: f64,
    d_sigma: f64,
    c_c: f64,
    c_1: f64,
    c_mu: f64,
    expected_norm: f64,

    mean: DVector<f64>,
    sigma: f64,
    initial_sigma: f64,
    covariance: DMatrix<f64>,
    p_c: DVector<f64>,
    p_sigma: DVector<f64>,
    /// Eigenvectors of the covariance (B)
    basis: DMatrix<f64>,
    /// Square roots of the covariance eigenvalues (diagonal of D)
    scales: DVector<f64>,

    generation: usize,
    phase: SearchPhase,
    rng: Xoshiro256PlusPlus,
}

impl CmaEs {
    /// Start a search around `mean` with step size `sigma` and `pop_size` candidates per generation
    pub fn new(mean: Vec<f64>, sigma: f64, pop_size: usize, seed: u64) -> Result<Self> {
        if mean.is_empty() {
            return Err(EvolutionError::Configuration(
                "search dimension must be at least 1".to_string(),
            ));
        }
        if pop_size == 0 {
            return Err(EvolutionError::Configuration(
                "pop_size must be at least 1".to_string(),
            ));
        }
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(EvolutionError::Configuration(format!(
                "sigma must be positive and finite, got {}",
                sigma
            )));
        }
        if mean.iter().any(|v| !v.is_finite()) {
            return Err(EvolutionError::Configuration(
                "initial mean contains non-finite values".to_string(),
            ));
        }

        let dimension = mean.len();
        let n = dimension as f64;
        let lambda = pop_size;
        let mu = (lambda / 2).max(1);

        // w_i = ln(mu + 1/2) - ln(i), normalized to sum to one
        let raw: Vec<f64> = (0..mu)
            .map(|i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln())
            .collect();
        let total: f64 = raw.iter().sum();
        let weights = DVector::from_iterator(mu, raw.iter().map(|w| w / total));
        let mu_eff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let c_sigma = (mu_eff + 2.0) / (n + mu_eff + 5.0);
        let d_sigma = 1.0 + 2.0 * (((mu_eff - 1.0) / (n + 1.0)).sqrt() - 1.0).max(0.0) + c_sigma;
        let c_c = (4.0 + mu_eff / n) / (n + 4.0 + 2.0 * mu_eff / n);
        let c_1 = 2.0 / ((n + 1.3).powi(2) + mu_eff);
        let c_mu = (2.0 * (mu_eff - 2.0 + 1.0 / mu_eff) / ((n + 2.0).powi(2) + mu_eff))
            .min(1.0 - c_1)
            .max(0.0);
        let expected_norm = n.sqrt() * (1.0 - 1.0 / (4.0 * n) + 1.0 / (21.0 * n * n));

        log::debug!(
            "CMA-ES: n={} lambda={} mu={} mu_eff={:.2} c_sigma={:.4} d_sigma={:.4} c_c={:.4} c_1={:.5} c_mu={:.5}",
            dimension,
            lambda,
            mu,
            mu_eff,
            c_sigma,
            d_sigma,
            c_c,
            c_1,
            c_mu
        );

        Ok(Self {
            dimension,
            lambda,
            weights,
            mu_eff,
            c_sigma,
            d_sigma,
            c_c,
            c_1,
            c_mu,
            expected_norm,
            mean: DVector::from_vec(mean),
            sigma,
            initial_sigma: sigma,
            covariance: DMatrix::identity(dimension, dimension),
            p_c: DVector::zeros(dimension),
            p_sigma: DVector::zeros(dimension),
            basis: DMatrix::identity(dimension, dimension),
            scales: DVector::from_element(dimension, 1.0),
            generation: 0,
            phase: SearchPhase::Initialized,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        })
    }

    /// Draw `pop_size` candidates from `N(mean, sigma^2 C)`
    pub fn ask(&mut self) -> Result<Vec<ParameterVector>> {
        match self.phase {
            SearchPhase::Initialized => self.transition(SearchPhase::Sampling),
            SearchPhase::Sampling => {}
            phase => {
                return Err(EvolutionError::SearchPhase {
                    phase,
                    action: "sample a population",
                });
            }
        }

        let transform = &self.basis * DMatrix::from_diagonal(&self.scales);
        let population = (0..self.lambda)
            .map(|_| {
                let z: DVector<f64> = DVector::from_iterator(
                    self.dimension,
                    (0..self.dimension).map(|_| StandardNormal.sample(&mut self.rng)),
                );
                let x = &self.mean + self.sigma * (&transform * z);
                ParameterVector::new(x.iter().copied().collect())
            })
            .collect();

        self.transition(SearchPhase::Evaluating);
        Ok(population)
    }

    /// Update the distribution from the fitness of the population returned by `ask`.
    ///
    /// `fitness[i]` belongs to `population[i]`; higher is better and ties go
    /// to the lower index.
    pub fn tell(
        &mut self,
        population: &[ParameterVector],
        fitness: &[f64],
    ) -> Result<UpdateReport> {
        if self.phase != SearchPhase::Evaluating {
            return Err(EvolutionError::SearchPhase {
                phase: self.phase,
                action: "update from fitness",
            });
        }
        if population.len() != self.lambda || fitness.len() != self.lambda {
            return Err(EvolutionError::InvalidJobs(format!(
                "expected {} candidates with fitness, got {} candidates and {} values",
                self.lambda,
                population.len(),
                fitness.len()
            )));
        }
        if let Some(bad) = population.iter().find(|p| p.len() != self.dimension) {
            return Err(EvolutionError::ParameterCount {
                expected: self.dimension,
                actual: bad.len(),
            });
        }
        self.transition(SearchPhase::Updating);

        let ranking = rank(fitness);
        let old_mean = self.mean.clone();

        // Selected steps y_i = (x_i - m) / sigma, best first
        let steps: Vec<DVector<f64>> = ranking
            .iter()
            .take(self.weights.len())
            .map(|&i| (DVector::from_column_slice(&population[i]) - &old_mean) / self.sigma)
            .collect();

        let mut y_w = DVector::zeros(self.dimension);
        for (w, y) in self.weights.iter().zip(&steps) {
            y_w += *w * y;
        }
        self.mean = &old_mean + self.sigma * &y_w;

        // C^{-1/2} from the decomposition used for sampling this generation
        let inv_scales = self.scales.map(|d| 1.0 / d.max(1e-300));
        let c_inv_sqrt =
            &self.basis * DMatrix::from_diagonal(&inv_scales) * self.basis.transpose();

        self.p_sigma = (1.0 - self.c_sigma) * &self.p_sigma
            + (self.c_sigma * (2.0 - self.c_sigma) * self.mu_eff).sqrt() * (&c_inv_sqrt * &y_w);

        let n = self.dimension as f64;
        let p_sigma_norm = self.p_sigma.norm();
        let decay = 1.0 - (1.0 - self.c_sigma).powi(2 * (self.generation as i32 + 1));
        let h_sigma = if p_sigma_norm / decay.sqrt() < (1.4 + 2.0 / (n + 1.0)) * self.expected_norm
        {
            1.0
        } else {
            0.0
        };

        self.p_c = (1.0 - self.c_c) * &self.p_c
            + h_sigma * (self.c_c * (2.0 - self.c_c) * self.mu_eff).sqrt() * &y_w;

        let mut rank_mu = DMatrix::zeros(self.dimension, self.dimension);
        for (w, y) in self.weights.iter().zip(&steps) {
            rank_mu += *w * y * y.transpose();
        }

        let delta_h = (1.0 - h_sigma) * self.c_c * (2.0 - self.c_c);
        self.covariance = (1.0 - self.c_1 - self.c_mu + self.c_1 * delta_h) * &self.covariance
            + self.c_1 * &self.p_c * self.p_c.transpose()
            + self.c_mu * rank_mu;

        self.sigma *= ((self.c_sigma / self.d_sigma) * (p_sigma_norm / self.expected_norm - 1.0)).exp();
        if !self.sigma.is_finite() {
            log::warn!(
                "CMA-ES generation {}: step size diverged, restoring {}",
                self.generation,
                self.initial_sigma
            );
            self.sigma = self.initial_sigma;
        }
        self.sigma = self.sigma.clamp(SIGMA_MIN, SIGMA_MAX);

        let (regularized, condition) = self.repair_covariance();
        self.generation += 1;
        self.transition(SearchPhase::Sampling);

        Ok(UpdateReport {
            regularized,
            sigma: self.sigma,
            condition,
        })
    }

    /// Symmetrize, decompose and regularize the covariance; refresh the sampling transform
    fn repair_covariance(&mut self) -> (bool, f64) {
        self.covariance = (&self.covariance + self.covariance.transpose()) * 0.5;

        let mut regularized = false;
        let finite = self.covariance.iter().all(|v| v.is_finite())
            && self.mean.iter().all(|v| v.is_finite());
        if !finite {
            log::warn!(
                "CMA-ES generation {}: non-finite distribution, resetting covariance",
                self.generation
            );
            self.reset_shape();
            return (true, 1.0);
        }

        let mut eigen = SymmetricEigen::new(self.covariance.clone());
        let (min, max) = extremes(&eigen.eigenvalues);

        if !max.is_finite() || !min.is_finite() || max <= 0.0 {
            log::warn!(
                "CMA-ES generation {}: degenerate covariance (max eigenvalue {:e}), resetting",
                self.generation,
                max
            );
            self.reset_shape();
            return (true, 1.0);
        }

        if min <= max / MAX_CONDITION {
            let shift = max * REGULARIZATION - min;
            log::warn!(
                "CMA-ES generation {}: ill-conditioned covariance (eigenvalues {:e}..{:e}), adding {:e} I",
                self.generation,
                min,
                max,
                shift
            );
            self.covariance += DMatrix::identity(self.dimension, self.dimension) * shift;
            eigen = SymmetricEigen::new(self.covariance.clone());
            regularized = true;
        }

        let (min, max) = extremes(&eigen.eigenvalues);
        self.scales = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
        self.basis = eigen.eigenvectors;
        (regularized, max / min.max(f64::MIN_POSITIVE))
    }

    fn reset_shape(&mut self) {
        let n = self.dimension;
        self.covariance = DMatrix::identity(n, n);
        self.basis = DMatrix::identity(n, n);
        self.scales = DVector::from_element(n, 1.0);
        self.p_c = DVector::zeros(n);
        self.p_sigma = DVector::zeros(n);
        if self.mean.iter().any(|v| !v.is_finite()) {
            self.mean = self.mean.map(|v| if v.is_finite() { v } else { 0.0 });
        }
    }

    /// Stop the search because a convergence criterion was met
    pub fn converge(&mut self) -> Result<()> {
        self.finish(SearchPhase::Converged)
    }

    /// Stop the search because the generation cap was reached
    pub fn terminate(&mut self) -> Result<()> {
        self.finish(SearchPhase::Terminated)
    }

    fn finish(&mut self, phase: SearchPhase) -> Result<()> {
        if !matches!(self.phase, SearchPhase::Initialized | SearchPhase::Sampling) {
            return Err(EvolutionError::SearchPhase {
                phase: self.phase,
                action: "finish the search",
            });
        }
        self.transition(phase);
        Ok(())
    }

    fn transition(&mut self, next: SearchPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal search phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    pub fn mean(&self) -> &[f64] {
        self.mean.as_slice()
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Completed updates
    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn pop_size(&self) -> usize {
        self.lambda
    }

    /// Recombination weights of the selected candidates, best first
    pub fn weights(&self) -> &[f64] {
        self.weights.as_slice()
    }
}

/// Candidate indices sorted best first; ties keep index order, non-finite values rank last
pub(crate) fn rank(fitness: &[f64]) -> Vec<usize> {
    let key = |i: usize| {
        let f = fitness[i];
        if f.is_finite() { f } else { f64::NEG_INFINITY }
    };
    let mut order: Vec<usize> = (0..fitness.len()).collect();
    order.sort_by(|&a, &b| key(b).total_cmp(&key(a)).then(a.cmp(&b)));
    order
}

fn extremes(values: &DVector<f64>) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere(x: &[f64]) -> f64 {
        -x.iter().map(|v| (v - 1.0).powi(2)).sum::<f64>()
    }

    fn assert_symmetric_psd(c: &DMatrix<f64>) {
        let n = c.nrows();
        for i in 0..n {
            for j in 0..n {
                assert!((c[(i, j)] - c[(j, i)]).abs() < 1e-12, "asymmetric at ({}, {})", i, j);
            }
        }
        let eigen = SymmetricEigen::new(c.clone());
        let max = eigen.eigenvalues.max();
        assert!(eigen.eigenvalues.iter().all(|&v| v >= -1e-12 * max.max(1.0)));
    }

    #[test]
    fn test_weights() {
        let es = CmaEs::new(vec![0.0; 3], 0.5, 4, 0).unwrap();
        let w = es.weights();
        assert_eq!(w.len(), 2);
        assert!((w[0] - 0.8042).abs() < 1e-3);
        assert!((w[1] - 0.1958).abs() < 1e-3);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_ask_is_seeded() {
        let mut a = CmaEs::new(vec![0.0; 5], 0.3, 6, 42).unwrap();
        let mut b = CmaEs::new(vec![0.0; 5], 0.3, 6, 42).unwrap();
        let mut c = CmaEs::new(vec![0.0; 5], 0.3, 6, 43).unwrap();
        let pa = a.ask().unwrap();
        assert_eq!(pa, b.ask().unwrap());
        assert_ne!(pa, c.ask().unwrap());
    }

    #[test]
    fn test_phase_machine() {
        let mut es = CmaEs::new(vec![0.0; 2], 0.5, 4, 1).unwrap();
        assert_eq!(es.phase(), SearchPhase::Initialized);
        assert!(es.tell(&[], &[]).is_err());

        let population = es.ask().unwrap();
        assert_eq!(es.phase(), SearchPhase::Evaluating);
        assert!(matches!(
            es.ask(),
            Err(EvolutionError::SearchPhase {
                phase: SearchPhase::Evaluating,
                ..
            })
        ));

        es.tell(&population, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(es.phase(), SearchPhase::Sampling);
        assert_eq!(es.generation(), 1);

        es.converge().unwrap();
        assert_eq!(es.phase(), SearchPhase::Converged);
        assert!(es.ask().is_err());
        assert!(es.terminate().is_err());
    }

    #[test]
    fn test_tell_rejects_wrong_length() {
        let mut es = CmaEs::new(vec![0.0; 2], 0.5, 4, 1).unwrap();
        let population = es.ask().unwrap();
        assert!(es.tell(&population, &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_rank_breaks_ties_by_index() {
        assert_eq!(rank(&[1.0, 5.0, 3.0, 2.0]), vec![1, 2, 3, 0]);
        assert_eq!(rank(&[2.0, 2.0, 2.0]), vec![0, 1, 2]);
        assert_eq!(rank(&[f64::NAN, 0.0, f64::INFINITY]), vec![1, 0, 2]);
    }

    #[test]
    fn test_single_candidate_moves_mean_onto_it() {
        let mut es = CmaEs::new(vec![0.0; 3], 0.5, 1, 9).unwrap();
        let population = es.ask().unwrap();
        es.tell(&population, &[0.0]).unwrap();
        for (m, x) in es.mean().iter().zip(population[0].iter()) {
            assert!((m - x).abs() < 1e-12);
        }
        assert_symmetric_psd(es.covariance());
    }

    #[test]
    fn test_covariance_stays_symmetric_psd() {
        let mut es = CmaEs::new(vec![0.0; 6], 0.8, 10, 3).unwrap();
        for _ in 0..60 {
            let population = es.ask().unwrap();
            let fitness: Vec<f64> = population.iter().map(|p| sphere(p)).collect();
            es.tell(&population, &fitness).unwrap();
            assert_symmetric_psd(es.covariance());
            assert!(es.sigma() >= SIGMA_MIN && es.sigma() <= SIGMA_MAX);
        }
    }

    #[test]
    fn test_optimizes_sphere() {
        let mut es = CmaEs::new(vec![0.0; 4], 0.5, 8, 11).unwrap();
        for _ in 0..150 {
            let population = es.ask().unwrap();
            let fitness: Vec<f64> = population.iter().map(|p| sphere(p)).collect();
            es.tell(&population, &fitness).unwrap();
        }
        assert!(sphere(es.mean()) > -1e-3, "mean {:?}", es.mean());
    }

    #[test]
    fn test_flat_fitness_does_not_break_distribution() {
        let mut es = CmaEs::new(vec![0.0; 3], 1.0, 6, 5).unwrap();
        for _ in 0..200 {
            let population = es.ask().unwrap();
            es.tell(&population, &vec![0.0; 6]).unwrap();
            assert_symmetric_psd(es.covariance());
            assert!(es.mean().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_degenerate_covariance_is_regularized() {
        let mut es = CmaEs::new(vec![0.0; 3], 1.0, 4, 5).unwrap();
        es.covariance = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 0.0, 0.0]));
        let (regularized, condition) = es.repair_covariance();
        assert!(regularized);
        assert!(condition <= 1.0 / REGULARIZATION * 1.01);
        assert_symmetric_psd(es.covariance());

        es.covariance[(0, 1)] = f64::NAN;
        let (regularized, _) = es.repair_covariance();
        assert!(regularized);
        assert_eq!(es.covariance(), &DMatrix::identity(3, 3));
    }

    #[test]
    fn test_rejects_invalid_construction() {
        assert!(CmaEs::new(vec![], 0.5, 4, 0).is_err());
        assert!(CmaEs::new(vec![0.0], 0.0, 4, 0).is_err());
        assert!(CmaEs::new(vec![0.0], 0.5, 0, 0).is_err());
        assert!(CmaEs::new(vec![f64::NAN], 0.5, 4, 0).is_err());
    }
}
