//! Evolutionary controller search for Yume
//!
//! CMA-ES samples candidate controllers, a pool of rollout workers scores
//! each one in its own environment instance, and the driver feeds ranked
//! fitness back into the search distribution until a stop condition holds.
//!
//! ```text
//! Trainer -> CmaEs::ask -> WorkerPool -> EnvWorker -> Evaluator
//!    ^                                                   |
//!    +---------- CmaEs::tell <- fitness per candidate <--+
//! ```

pub mod checkpoint;
pub mod cmaes;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod evaluator;
pub mod fitness;
pub mod pipeline;
pub mod pool;

pub use checkpoint::{CheckpointStore, ControllerCheckpoint};
pub use cmaes::{CmaEs, SearchPhase, UpdateReport};
pub use config::TrainingConfig;
pub use controller::{ActionPolicy, Controller, ControllerLayout, ParameterVector};
pub use driver::{
    BestSolution, GenerationStats, SearchState, StopReason, Trainer, TrainingOutcome,
};
pub use error::{EvolutionError, Result};
pub use evaluator::{CancelToken, Cancelled, EnvWorker, Evaluator, RolloutResult, RolloutStatus};
pub use fitness::{FitnessAggregation, FitnessStats};
pub use pool::{GenerationReport, GenerationResult, Job, PoolConfig, RolloutWorker, WorkerPool};
