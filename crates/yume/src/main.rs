use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use yume_evolution::evaluator::derive_seed;
use yume_evolution::pipeline::{build_pool, init_artifacts, load_evaluator};
use yume_evolution::{CancelToken, CheckpointStore, Trainer, TrainingConfig};
use yume_models::env;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (RON); defaults to ./yume.ron when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search for a controller with CMA-ES
    Train {
        /// Generation cap
        #[arg(long)]
        generations: Option<usize>,

        /// Candidates per generation
        #[arg(long)]
        population: Option<usize>,

        /// Parallel rollout workers
        #[arg(long)]
        workers: Option<usize>,

        /// Rollouts per candidate
        #[arg(long)]
        samples: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Continue from the checkpoint in the checkpoint directory
        #[arg(long)]
        resume: bool,
    },

    /// Run a checkpointed controller and print its returns
    Play {
        /// Checkpoint directory (defaults to the configured one)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        #[arg(long, default_value = "5")]
        episodes: usize,

        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Write untrained perception and dynamics artifacts
    InitArtifacts {
        #[arg(long, default_value = "artifacts")]
        out: PathBuf,

        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = TrainingConfig::load(args.config.as_deref()).context("Failed to load config")?;

    match args.command {
        Command::Train {
            generations,
            population,
            workers,
            samples,
            seed,
            resume,
        } => {
            let config = TrainingConfig {
                n_epochs: generations.unwrap_or(config.n_epochs),
                pop_size: population.unwrap_or(config.pop_size),
                n_workers: workers.unwrap_or(config.n_workers),
                n_samples: samples.unwrap_or(config.n_samples),
                seed: seed.unwrap_or(config.seed),
                ..config
            };
            run_training(config, resume)
        }
        Command::Play {
            checkpoint,
            episodes,
            seed,
        } => run_play(config, checkpoint, episodes, seed),
        Command::InitArtifacts { out, seed } => {
            config.validate().context("Invalid configuration")?;
            let (perception, dynamics) = init_artifacts(&config, &out, seed)
                .with_context(|| format!("Failed to write artifacts to {}", out.display()))?;
            println!("Perception: {}", perception.display());
            println!("Dynamics:   {}", dynamics.display());
            Ok(())
        }
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} gens ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

fn run_training(config: TrainingConfig, resume: bool) -> anyhow::Result<()> {
    config.validate().context("Invalid configuration")?;

    log::info!("Starting controller search");
    log::info!("  Environment: {}", config.env_name);
    log::info!("  Generations: {}", config.n_epochs);
    log::info!("  Population: {}", config.pop_size);
    log::info!("  Rollouts per candidate: {}", config.n_samples);
    log::info!("  Workers: {}", config.n_workers);
    log::info!("  Checkpoints: {}", config.checkpoint_dir.display());

    let evaluator = load_evaluator(&config).context("Failed to load model artifacts")?;
    let pool = build_pool(&config, evaluator).context("Failed to start rollout workers")?;
    let store = CheckpointStore::new(&config.checkpoint_dir)
        .context("Failed to open checkpoint directory")?;

    let previous = if resume {
        let checkpoint = store.load_latest().context("Failed to read checkpoint")?;
        if checkpoint.is_none() {
            log::warn!(
                "No checkpoint in {}, starting a fresh search",
                config.checkpoint_dir.display()
            );
        }
        checkpoint
    } else {
        None
    };

    let mut trainer = match previous {
        Some(checkpoint) => Trainer::resume(config.clone(), pool, Some(store), checkpoint)?,
        None => Trainer::new(config.clone(), pool, Some(store))?,
    };

    let pb = ProgressBar::new(config.n_epochs as u64);
    pb.set_style(progress_style());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_position(trainer.state().generation.min(config.n_epochs) as u64);

    let outcome = trainer.run(|stats| {
        pb.println(stats.to_string());
        if stats.regularized {
            pb.println("   covariance regularized this generation");
        }
        pb.set_message(format!("best {:.2}", stats.best_ever));
        pb.inc(1);
    })?;
    pb.finish_with_message(format!("{}", outcome.stop_reason));

    match outcome.best {
        Some(best) => println!(
            "Best fitness {:.3} (generation {}) after {} generations: {}",
            best.fitness, best.generation, outcome.generations, outcome.stop_reason
        ),
        None => println!(
            "No candidate evaluated after {} generations: {}",
            outcome.generations, outcome.stop_reason
        ),
    }
    Ok(())
}

fn run_play(
    config: TrainingConfig,
    checkpoint_dir: Option<PathBuf>,
    episodes: usize,
    seed: u64,
) -> anyhow::Result<()> {
    let dir = checkpoint_dir.unwrap_or_else(|| config.checkpoint_dir.clone());
    let store = CheckpointStore::new(&dir).context("Failed to open checkpoint directory")?;
    let checkpoint = store
        .load()
        .with_context(|| format!("Failed to load checkpoint from {}", dir.display()))?;

    // The checkpoint decides environment and controller shape
    let config = TrainingConfig {
        env_name: checkpoint.env_name.clone(),
        ..config
    };
    if checkpoint.layout != config.controller_layout() {
        bail!(
            "checkpoint controller {:?} does not match configured {:?}",
            checkpoint.layout,
            config.controller_layout()
        );
    }

    let evaluator = load_evaluator(&config).context("Failed to load model artifacts")?;
    let controller = checkpoint.controller()?;
    let mut env = env::make(&config.env_name)?;

    println!(
        "Playing {} controller from generation {} (best fitness {:.3})",
        checkpoint.env_name, checkpoint.best_generation, checkpoint.best_fitness
    );

    let mut total = 0.0;
    for episode in 0..episodes {
        let result = evaluator
            .rollout(
                env.as_mut(),
                &controller.parameters,
                config.time_limit,
                derive_seed(seed, episode),
                &CancelToken::new(),
            )
            .map_err(|_| anyhow::anyhow!("rollout cancelled"))?;
        println!(
            "Episode {:3}: return {:9.3} in {:4} steps ({:?})",
            episode, result.total_return, result.steps, result.status
        );
        total += result.total_return;
    }
    if episodes > 0 {
        println!("Mean return: {:.3}", total / episodes as f64);
    }
    Ok(())
}
