//! Error taxonomy for the controller search
//!
//! Only startup problems (configuration, artifacts) and broken
//! infrastructure (checkpoint I/O, a dead worker pool) surface as errors.
//! Rollout failures, worker timeouts and covariance degeneracies are
//! contained where they happen and show up in the generation report instead.

use std::path::PathBuf;

use thiserror::Error;
use yume_models::ModelError;

pub type Result<T> = std::result::Result<T, EvolutionError>;

#[derive(Debug, Error)]
pub enum EvolutionError {
    /// Invalid hyperparameters or inconsistent settings; fatal before generation 0
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Perception/dynamics artifact missing, corrupt or of the wrong shape
    #[error("failed to load model artifact: {0}")]
    ArtifactLoad(#[source] ModelError),

    /// A worker could not be constructed (e.g. environment creation failed)
    #[error("failed to start worker {worker}: {reason}")]
    WorkerStartup { worker: usize, reason: String },

    /// Every worker thread is gone or the pool was already shut down
    #[error("worker pool unavailable: {0}")]
    WorkerPool(String),

    /// A generation was submitted with missing or duplicate candidate indices
    #[error("invalid job batch: {0}")]
    InvalidJobs(String),

    /// Search distribution used out of order (e.g. update before sampling)
    #[error("search distribution is in phase {phase:?}, cannot {action}")]
    SearchPhase {
        phase: crate::cmaes::SearchPhase,
        action: &'static str,
    },

    #[error("parameter vector has {actual} values, controller expects {expected}")]
    ParameterCount { expected: usize, actual: usize },

    #[error("checkpoint {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EvolutionError {
    pub(crate) fn checkpoint(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Checkpoint {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<ModelError> for EvolutionError {
    fn from(err: ModelError) -> Self {
        EvolutionError::ArtifactLoad(err)
    }
}
