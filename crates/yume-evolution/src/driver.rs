//! Optimization driver: sample, evaluate, update, check, checkpoint
//!
//! The driver exclusively owns the search state. Workers only ever see
//! immutable parameter vectors inside jobs, and the distribution is
//! mutated only once a whole generation has been scored.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointStore, ControllerCheckpoint};
use crate::cmaes::{CmaEs, rank};
use crate::config::TrainingConfig;
use crate::controller::{ControllerLayout, ParameterVector};
use crate::error::{EvolutionError, Result};
use crate::evaluator::derive_seed;
use crate::fitness::FitnessStats;
use crate::pool::{GenerationReport, GenerationResult, Job, WorkerPool};

/// Best controller seen so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestSolution {
    pub parameters: ParameterVector,
    pub fitness: f64,
    /// Generation in which it was found
    pub generation: usize,
}

/// Everything the driver mutates between generations
pub struct SearchState {
    pub cmaes: CmaEs,
    /// Completed generations
    pub generation: usize,
    pub best: Option<BestSolution>,
    /// Generations since the best-ever fitness last improved by `min_improvement`
    pub stall: usize,
}

impl SearchState {
    pub fn best_fitness(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.fitness)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Best-ever fitness reached `target_return`
    TargetReached,
    /// No improvement for `patience` generations
    Stalled,
    /// Step size fell below `sigma_floor`
    StepSizeCollapsed,
    /// `n_epochs` generations completed
    GenerationCap,
}

impl StopReason {
    /// Converged as opposed to cut off by the generation cap
    pub fn is_converged(&self) -> bool {
        !matches!(self, StopReason::GenerationCap)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::TargetReached => "target return reached",
            StopReason::Stalled => "no improvement within patience",
            StopReason::StepSizeCollapsed => "step size collapsed",
            StopReason::GenerationCap => "generation cap reached",
        };
        f.write_str(text)
    }
}

/// Per-generation summary
#[derive(Debug, Clone)]
pub struct GenerationStats {
    pub generation: usize,
    pub best: f64,
    pub mean: f64,
    pub worst: f64,
    pub best_ever: f64,
    pub sigma: f64,
    /// Covariance was regularized during this update
    pub regularized: bool,
    pub report: GenerationReport,
}

impl fmt::Display for GenerationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Gen {:4} | best {:9.3} | mean {:9.3} | worst {:9.3} | best ever {:9.3} | sigma {:.4}",
            self.generation, self.best, self.mean, self.worst, self.best_ever, self.sigma
        )?;
        if !self.report.is_clean() {
            write!(
                f,
                " | timeouts {} retries {} penalized {} failed rollouts {} replaced workers {}",
                self.report.timeouts,
                self.report.retries,
                self.report.penalized_jobs,
                self.report.failed_rollouts,
                self.report.replaced_workers
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub best: Option<BestSolution>,
    /// Completed generations, including those before a resume
    pub generations: usize,
    pub stop_reason: StopReason,
    pub history: Vec<GenerationStats>,
}

pub struct Trainer {
    config: TrainingConfig,
    layout: ControllerLayout,
    pool: WorkerPool,
    store: Option<CheckpointStore>,
    state: SearchState,
}

impl Trainer {
    /// Fresh search centred on the zero controller
    pub fn new(
        config: TrainingConfig,
        pool: WorkerPool,
        store: Option<CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = config.controller_layout();
        let cmaes = CmaEs::new(
            vec![0.0; layout.parameter_count()],
            config.sigma,
            config.pop_size,
            config.seed,
        )?;

        log::info!(
            "Searching {} controller parameters on {} (population {}, {} rollouts each, {} workers)",
            layout.parameter_count(),
            config.env_name,
            config.pop_size,
            config.n_samples,
            pool.n_workers()
        );

        Ok(Self {
            config,
            layout,
            pool,
            store,
            state: SearchState {
                cmaes,
                generation: 0,
                best: None,
                stall: 0,
            },
        })
    }

    /// Continue from a checkpoint: the search is re-centred on the stored
    /// best controller and best-ever fitness and generation count carry over.
    pub fn resume(
        config: TrainingConfig,
        pool: WorkerPool,
        store: Option<CheckpointStore>,
        checkpoint: ControllerCheckpoint,
    ) -> Result<Self> {
        config.validate()?;
        let layout = config.controller_layout();
        if checkpoint.layout != layout {
            return Err(EvolutionError::Configuration(format!(
                "checkpoint controller {:?} does not match configured {:?}",
                checkpoint.layout, layout
            )));
        }
        if checkpoint.env_name != config.env_name {
            return Err(EvolutionError::Configuration(format!(
                "checkpoint was trained on {}, configured environment is {}",
                checkpoint.env_name, config.env_name
            )));
        }

        let cmaes = CmaEs::new(
            checkpoint.parameters.to_vec(),
            config.sigma,
            config.pop_size,
            derive_seed(config.seed, checkpoint.generation),
        )?;

        log::info!(
            "Resuming from generation {} with best fitness {:.3}",
            checkpoint.generation,
            checkpoint.best_fitness
        );

        Ok(Self {
            config,
            layout,
            pool,
            store,
            state: SearchState {
                cmaes,
                generation: checkpoint.generation,
                best: Some(BestSolution {
                    parameters: checkpoint.parameters,
                    fitness: checkpoint.best_fitness,
                    generation: checkpoint.best_generation,
                }),
                stall: 0,
            },
        })
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Run generations until a stop condition holds
    pub fn run(&mut self, mut on_generation: impl FnMut(&GenerationStats)) -> Result<TrainingOutcome> {
        let mut history = Vec::new();

        let stop_reason = loop {
            if let Some(reason) = self.stop_reason() {
                break reason;
            }
            let stats = self.run_generation()?;
            on_generation(&stats);
            history.push(stats);
        };

        if stop_reason.is_converged() {
            self.state.cmaes.converge()?;
        } else {
            self.state.cmaes.terminate()?;
        }

        match &self.state.best {
            Some(best) => log::info!(
                "Search finished after {} generations ({}): best fitness {:.3} from generation {}",
                self.state.generation,
                stop_reason,
                best.fitness,
                best.generation
            ),
            None => log::info!(
                "Search finished after {} generations ({})",
                self.state.generation,
                stop_reason
            ),
        }

        Ok(TrainingOutcome {
            best: self.state.best.clone(),
            generations: self.state.generation,
            stop_reason,
            history,
        })
    }

    /// Sample, evaluate and update once, then checkpoint
    pub fn run_generation(&mut self) -> Result<GenerationStats> {
        let generation = self.state.generation;
        let population = self.state.cmaes.ask()?;

        let generation_seed = derive_seed(self.config.seed, generation);
        let jobs = population
            .iter()
            .enumerate()
            .map(|(index, parameters)| Job {
                index,
                parameters: parameters.clone(),
                rollout_count: self.config.n_samples,
                time_limit: self.config.time_limit,
                seed: derive_seed(generation_seed, index),
            })
            .collect();

        let GenerationResult { fitness, report } = self.pool.evaluate_generation(jobs)?;
        let update = self.state.cmaes.tell(&population, &fitness)?;

        let Some(&champion) = rank(&fitness).first() else {
            return Err(EvolutionError::InvalidJobs("generation produced no fitness".to_string()));
        };
        let champion_fitness = fitness[champion];

        let previous = self.state.best_fitness();
        let improved = previous.is_none_or(|best| champion_fitness > best);
        if improved {
            self.state.best = Some(BestSolution {
                parameters: population[champion].clone(),
                fitness: champion_fitness,
                generation,
            });
        }
        let significant = previous.is_none_or(|best| champion_fitness > best + self.config.min_improvement);
        self.state.stall = if significant { 0 } else { self.state.stall + 1 };
        self.state.generation += 1;

        self.save_checkpoint()?;

        let summary = FitnessStats::from_values(&fitness);
        let stats = GenerationStats {
            generation,
            best: summary.max,
            mean: summary.mean,
            worst: summary.min,
            best_ever: self.state.best_fitness().unwrap_or(summary.max),
            sigma: update.sigma,
            regularized: update.regularized,
            report,
        };
        log::info!("{}", stats);
        Ok(stats)
    }

    fn stop_reason(&self) -> Option<StopReason> {
        if let (Some(target), Some(best)) = (self.config.target_return, self.state.best_fitness())
            && best >= target
        {
            return Some(StopReason::TargetReached);
        }
        if let Some(patience) = self.config.patience
            && self.state.stall >= patience
        {
            return Some(StopReason::Stalled);
        }
        if self.state.cmaes.sigma() < self.config.sigma_floor {
            return Some(StopReason::StepSizeCollapsed);
        }
        if self.state.generation >= self.config.n_epochs {
            return Some(StopReason::GenerationCap);
        }
        None
    }

    fn save_checkpoint(&self) -> Result<()> {
        let (Some(store), Some(best)) = (&self.store, &self.state.best) else {
            return Ok(());
        };
        let checkpoint = ControllerCheckpoint::new(
            self.config.env_name.clone(),
            self.layout,
            best.parameters.clone(),
            best.fitness,
            best.generation,
            self.state.generation,
        );
        store.save(&checkpoint)
    }
}
