//! Error types for environments and model artifacts

use std::path::PathBuf;

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    /// The environment rejected an action or failed to advance
    #[error("environment '{env}' failed: {reason}")]
    Environment { env: String, reason: String },

    /// A forward pass produced unusable output
    #[error("inference failed in {model}: {reason}")]
    Inference { model: &'static str, reason: String },

    /// Tensor or vector length does not match what the model declares
    #[error("{what}: expected dimension {expected}, got {actual}")]
    Dimension {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// Artifact could not be read or is structurally unusable
    #[error("failed to load artifact {path}: {reason}")]
    ArtifactLoad { path: PathBuf, reason: String },

    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl ModelError {
    pub(crate) fn dimension(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::Dimension {
            what: what.into(),
            expected,
            actual,
        }
    }
}
