//! Aggregation of noisy rollout returns into a single fitness value

use serde::{Deserialize, Serialize};

/// Strategy for collapsing `n_samples` rollout returns into one fitness
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum FitnessAggregation {
    /// Average return (unbiased under evaluation noise)
    #[default]
    Mean,

    /// Worst-case return (rewards robustness)
    Min,

    /// Median return (robust to outlier episodes)
    Median,

    /// Return at the given percentile in [0, 100]
    Percentile(f64),
}

impl FitnessAggregation {
    /// Aggregate returns; `None` when there is nothing to aggregate
    pub fn aggregate(&self, returns: &[f64]) -> Option<f64> {
        if returns.is_empty() {
            return None;
        }

        let value = match self {
            FitnessAggregation::Mean => returns.iter().sum::<f64>() / returns.len() as f64,
            FitnessAggregation::Min => returns.iter().copied().fold(f64::INFINITY, f64::min),
            FitnessAggregation::Median => median(&sorted(returns)),
            FitnessAggregation::Percentile(p) => {
                let sorted = sorted(returns);
                let idx = ((p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64).round();
                sorted[(idx as usize).min(sorted.len() - 1)]
            }
        };
        Some(value)
    }
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len().is_multiple_of(2) {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Summary of a population's fitness values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitnessStats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

impl FitnessStats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                mean: 0.0,
                median: 0.0,
                min: 0.0,
                max: 0.0,
                std_dev: 0.0,
            };
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n;
        let sorted = sorted(values);

        Self {
            mean,
            median: median(&sorted),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            std_dev: variance.sqrt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_mean() {
        let scores = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(FitnessAggregation::Mean.aggregate(&scores), Some(30.0));
    }

    #[test]
    fn test_aggregation_min() {
        let scores = [10.0, 20.0, 5.0, 40.0];
        assert_eq!(FitnessAggregation::Min.aggregate(&scores), Some(5.0));
    }

    #[test]
    fn test_aggregation_median() {
        assert_eq!(
            FitnessAggregation::Median.aggregate(&[30.0, 10.0, 20.0]),
            Some(20.0)
        );
        // Even number of scores
        assert_eq!(
            FitnessAggregation::Median.aggregate(&[10.0, 20.0, 30.0, 40.0]),
            Some(25.0)
        );
    }

    #[test]
    fn test_aggregation_percentile() {
        let scores = [50.0, 10.0, 40.0, 20.0, 30.0];
        assert_eq!(
            FitnessAggregation::Percentile(25.0).aggregate(&scores),
            Some(20.0)
        );
        assert_eq!(
            FitnessAggregation::Percentile(100.0).aggregate(&scores),
            Some(50.0)
        );
        assert_eq!(
            FitnessAggregation::Percentile(0.0).aggregate(&scores),
            Some(10.0)
        );
    }

    #[test]
    fn test_aggregation_empty() {
        assert_eq!(FitnessAggregation::Mean.aggregate(&[]), None);
    }

    #[test]
    fn test_stats() {
        let stats = FitnessStats::from_values(&[10.0, 20.0, 30.0, 40.0, 50.0]);
        assert_eq!(stats.mean, 30.0);
        assert_eq!(stats.median, 30.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 50.0);
        // variance = (400 + 100 + 0 + 100 + 400) / 5 = 200
        assert!((stats.std_dev - 200f64.sqrt()).abs() < 1e-9);
    }
}
