//! Environments and pretrained model artifacts for Yume
//!
//! This crate holds everything the controller search consumes but never
//! mutates:
//! - The `Environment` trait plus built-in simulated tasks
//! - The perception model (observation -> latent vector)
//! - The dynamics model (latent + action -> recurrent hidden state)
//! - Artifact loading with dimensionality checks

pub mod artifact;
pub mod dynamics;
pub mod env;
pub mod error;
mod math;
pub mod perception;

pub use dynamics::{Dynamics, HiddenState, LstmDynamics};
pub use env::{Action, ActionSpace, EnvSpec, Environment, Observation, Step};
pub use error::{ModelError, ModelResult};
pub use perception::{LinearEncoder, Perception};
