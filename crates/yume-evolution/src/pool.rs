//! Fixed-size pool of rollout workers
//!
//! Every worker thread owns its own environment (through a `RolloutWorker`)
//! and pulls jobs from a shared queue. The pool hands out one job per
//! candidate, collects exactly one fitness per candidate and returns them
//! indexed by candidate, whatever order the workers finish in.
//!
//! Every outstanding job carries a deadline: a queue allowance from the
//! moment it is dispatched, then its wall-clock budget once a worker picks
//! it up. A job that misses its deadline is cancelled and resubmitted up to
//! `max_retries` times, after which the candidate gets the penalty fitness.
//! The worker that was running it is retired and replaced by a fresh one,
//! so a rollout stuck inside the environment neither holds the generation
//! nor shrinks the pool. Results from an abandoned attempt are ignored.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::TrainingConfig;
use crate::controller::ParameterVector;
use crate::error::{EvolutionError, Result};
use crate::evaluator::{CancelToken, Cancelled, RolloutResult};
use crate::fitness::FitnessAggregation;

/// How long `shutdown` waits for worker threads before detaching them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One candidate's evaluation request
#[derive(Debug, Clone)]
pub struct Job {
    /// Candidate position in the population
    pub index: usize,
    pub parameters: ParameterVector,
    pub rollout_count: usize,
    pub time_limit: usize,
    /// Base seed, each rollout derives its own from it
    pub seed: u64,
}

/// Something that can evaluate a job on the calling thread
pub trait RolloutWorker: Send {
    fn run(
        &mut self,
        job: &Job,
        cancel: &CancelToken,
    ) -> std::result::Result<Vec<RolloutResult>, Cancelled>;
}

/// Builds the worker with the given id, at startup and whenever a stuck worker is replaced
type WorkerFactory = Box<dyn Fn(usize) -> Result<Box<dyn RolloutWorker>> + Send>;

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub n_workers: usize,
    /// Wall-clock allowance per environment step
    pub step_timeout: Duration,
    pub max_retries: usize,
    pub penalty: f64,
    pub aggregation: FitnessAggregation,
}

impl PoolConfig {
    pub fn from_training(config: &TrainingConfig) -> Self {
        Self {
            n_workers: config.n_workers,
            step_timeout: Duration::from_millis(config.step_timeout_ms),
            max_retries: config.max_retries,
            penalty: config.penalty,
            aggregation: config.aggregation,
        }
    }

    /// Wall-clock budget of a running job
    fn budget(&self, job: &Job) -> Duration {
        let steps = job.time_limit.saturating_mul(job.rollout_count.max(1));
        self.step_timeout
            .saturating_mul(steps.min(u32::MAX as usize) as u32)
    }

    /// Time from dispatch until a job queued behind `queued` others must have finished
    fn queue_allowance(&self, job: &Job, queued: usize) -> Duration {
        let rounds = queued.div_ceil(self.n_workers.max(1)) + 1;
        self.budget(job)
            .saturating_mul(rounds.min(u32::MAX as usize) as u32)
    }
}

/// What went wrong (and was contained) while evaluating a generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub timeouts: usize,
    pub retries: usize,
    /// Jobs that exhausted their retries and got the penalty fitness
    pub penalized_jobs: usize,
    /// Individual rollouts that failed inside otherwise completed jobs
    pub failed_rollouts: usize,
    /// Workers retired after missing a deadline and replaced with fresh ones
    pub replaced_workers: usize,
}

impl GenerationReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Fitness per candidate, indexed like the submitted jobs
    pub fitness: Vec<f64>,
    pub report: GenerationReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    batch: u64,
    index: usize,
    attempt: usize,
}

struct Task {
    ticket: Ticket,
    job: Job,
    cancel: CancelToken,
}

enum Event {
    Started {
        ticket: Ticket,
        worker: usize,
    },
    Finished {
        ticket: Ticket,
        fitness: f64,
        failed_rollouts: usize,
    },
    Cancelled {
        ticket: Ticket,
    },
    Panicked {
        ticket: Ticket,
        worker: usize,
        reason: String,
    },
}

impl Event {
    fn ticket(&self) -> Ticket {
        match self {
            Event::Started { ticket, .. }
            | Event::Finished { ticket, .. }
            | Event::Cancelled { ticket }
            | Event::Panicked { ticket, .. } => *ticket,
        }
    }
}

struct Slot {
    job: Job,
    attempt: usize,
    cancel: CancelToken,
    /// Queue allowance until a worker starts the attempt, then the job budget
    deadline: Instant,
    /// Worker running the live attempt
    worker: Option<usize>,
    fitness: Option<f64>,
}

struct WorkerThread {
    id: usize,
    /// Set when the pool has given up on this worker; it exits after its current job
    retired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct WorkerPool {
    config: PoolConfig,
    factory: WorkerFactory,
    task_tx: Option<Sender<Task>>,
    task_rx: Arc<Mutex<Receiver<Task>>>,
    event_tx: Sender<Event>,
    event_rx: Receiver<Event>,
    workers: Vec<WorkerThread>,
    /// Retired workers that were still inside an abandoned job
    detached: Vec<WorkerThread>,
    next_id: usize,
    batch: u64,
}

impl WorkerPool {
    /// Build `n_workers` workers on the calling thread, then start one thread per worker.
    ///
    /// Fails if any worker cannot be constructed; nothing is spawned in that case.
    /// The factory is kept to replace workers that get stuck inside a job.
    pub fn new<F>(config: PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn(usize) -> Result<Box<dyn RolloutWorker>> + Send + 'static,
    {
        if config.n_workers == 0 {
            return Err(EvolutionError::Configuration(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let factory: WorkerFactory = Box::new(factory);
        let built = (0..config.n_workers)
            .map(|i| make_worker(&factory, i))
            .collect::<Result<Vec<_>>>()?;

        let (task_tx, task_rx) = mpsc::channel::<Task>();
        let (event_tx, event_rx) = mpsc::channel::<Event>();

        let mut pool = Self {
            next_id: built.len(),
            config,
            factory,
            task_tx: Some(task_tx),
            task_rx: Arc::new(Mutex::new(task_rx)),
            event_tx,
            event_rx,
            workers: Vec::with_capacity(built.len()),
            detached: Vec::new(),
            batch: 0,
        };
        for (i, worker) in built.into_iter().enumerate() {
            pool.spawn(i, worker)?;
        }

        log::info!("Started {} rollout workers", pool.workers.len());
        Ok(pool)
    }

    /// Live workers; retired ones are not counted
    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Evaluate one job per candidate and block until every candidate has a fitness.
    ///
    /// Job indices must be exactly `0..jobs.len()` in any order. Returns
    /// within roughly the queue allowance of the slowest job times
    /// `max_retries + 1`, whatever the workers do.
    pub fn evaluate_generation(&mut self, jobs: Vec<Job>) -> Result<GenerationResult> {
        let task_tx = self
            .task_tx
            .clone()
            .ok_or_else(|| EvolutionError::WorkerPool("pool has been shut down".to_string()))?;
        self.reap_detached();

        let mut slots = arrange_slots(jobs)?;
        self.batch += 1;
        let batch = self.batch;

        for (queued, slot) in slots.iter_mut().enumerate() {
            self.dispatch(&task_tx, batch, slot, queued)?;
        }

        let mut report = GenerationReport::default();
        let mut remaining = slots.len();

        while remaining > 0 {
            let Some(next_deadline) = slots
                .iter()
                .filter(|s| s.fitness.is_none())
                .map(|s| s.deadline)
                .min()
            else {
                break;
            };

            let received = self
                .event_rx
                .recv_timeout(next_deadline.saturating_duration_since(Instant::now()));

            match received {
                Ok(event) => {
                    let ticket = event.ticket();
                    let Some(slot) = slots.get_mut(ticket.index) else {
                        continue;
                    };
                    if ticket.batch != batch || ticket.attempt != slot.attempt || slot.fitness.is_some() {
                        log::debug!(
                            "Ignoring stale result for candidate {} (attempt {})",
                            ticket.index,
                            ticket.attempt
                        );
                        continue;
                    }

                    match event {
                        Event::Started { worker, .. } => {
                            slot.worker = Some(worker);
                            slot.deadline = Instant::now() + self.config.budget(&slot.job);
                        }
                        Event::Finished {
                            fitness,
                            failed_rollouts,
                            ..
                        } => {
                            slot.fitness = Some(fitness);
                            report.failed_rollouts += failed_rollouts;
                            remaining -= 1;
                        }
                        Event::Cancelled { .. } => {
                            // Nothing cancels the live attempt, treat it as a failure
                            if self.retry_or_penalize(&task_tx, batch, slot, remaining, &mut report)? {
                                remaining -= 1;
                            }
                        }
                        Event::Panicked { worker, reason, .. } => {
                            log::warn!(
                                "Worker {} panicked on candidate {}: {}",
                                worker,
                                ticket.index,
                                reason
                            );
                            if self.retry_or_penalize(&task_tx, batch, slot, remaining, &mut report)? {
                                remaining -= 1;
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    for slot in slots.iter_mut() {
                        if slot.fitness.is_some() || slot.deadline > now {
                            continue;
                        }
                        report.timeouts += 1;
                        match slot.worker.take() {
                            Some(worker) => {
                                log::warn!(
                                    "Candidate {} timed out on worker {} (attempt {})",
                                    slot.job.index,
                                    worker,
                                    slot.attempt
                                );
                                self.replace_worker(worker)?;
                                report.replaced_workers += 1;
                            }
                            None => log::warn!(
                                "Candidate {} was never picked up (attempt {})",
                                slot.job.index,
                                slot.attempt
                            ),
                        }
                        if self.retry_or_penalize(&task_tx, batch, slot, remaining, &mut report)? {
                            remaining -= 1;
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EvolutionError::WorkerPool(
                        "event channel closed".to_string(),
                    ));
                }
            }
        }

        let fitness = slots
            .into_iter()
            .map(|s| s.fitness.unwrap_or(self.config.penalty))
            .collect();

        Ok(GenerationResult { fitness, report })
    }

    /// Cancel the live attempt, then resubmit or assign the penalty.
    ///
    /// `outstanding` is the number of unsettled candidates, this one included.
    /// Returns `true` once the slot is settled.
    fn retry_or_penalize(
        &self,
        task_tx: &Sender<Task>,
        batch: u64,
        slot: &mut Slot,
        outstanding: usize,
        report: &mut GenerationReport,
    ) -> Result<bool> {
        slot.cancel.cancel();
        slot.worker = None;

        if slot.attempt < self.config.max_retries {
            slot.attempt += 1;
            slot.cancel = CancelToken::new();
            report.retries += 1;
            self.dispatch(task_tx, batch, slot, outstanding.saturating_sub(1))?;
            Ok(false)
        } else {
            log::warn!(
                "Candidate {} exhausted its retries, assigning penalty {}",
                slot.job.index,
                self.config.penalty
            );
            slot.fitness = Some(self.config.penalty);
            report.penalized_jobs += 1;
            Ok(true)
        }
    }

    /// Queue the slot's current attempt with a deadline covering the wait for a free worker
    fn dispatch(
        &self,
        task_tx: &Sender<Task>,
        batch: u64,
        slot: &mut Slot,
        queued: usize,
    ) -> Result<()> {
        slot.worker = None;
        slot.deadline = Instant::now() + self.config.queue_allowance(&slot.job, queued);
        let task = Task {
            ticket: Ticket {
                batch,
                index: slot.job.index,
                attempt: slot.attempt,
            },
            job: slot.job.clone(),
            cancel: slot.cancel.clone(),
        };
        task_tx
            .send(task)
            .map_err(|_| EvolutionError::WorkerPool("job queue closed".to_string()))
    }

    fn spawn(&mut self, id: usize, worker: Box<dyn RolloutWorker>) -> Result<()> {
        let retired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&retired);
        let task_rx = Arc::clone(&self.task_rx);
        let event_tx = self.event_tx.clone();
        let aggregation = self.config.aggregation;
        let penalty = self.config.penalty;

        let handle = std::thread::Builder::new()
            .name(format!("yume-worker-{}", id))
            .spawn(move || worker_loop(id, worker, task_rx, event_tx, flag, aggregation, penalty))
            .map_err(|e| EvolutionError::WorkerStartup {
                worker: id,
                reason: e.to_string(),
            })?;

        self.workers.push(WorkerThread {
            id,
            retired,
            handle,
        });
        Ok(())
    }

    /// Retire a worker stuck in an abandoned job and start a fresh one in its place
    fn replace_worker(&mut self, id: usize) -> Result<()> {
        let Some(position) = self.workers.iter().position(|w| w.id == id) else {
            return Ok(());
        };
        let stuck = self.workers.swap_remove(position);
        stuck.retired.store(true, Ordering::Release);
        self.detached.push(stuck);

        let replacement = self.next_id;
        self.next_id += 1;
        let worker = make_worker(&self.factory, replacement)?;
        self.spawn(replacement, worker)?;

        log::warn!(
            "Retired unresponsive worker {}, started worker {} in its place",
            id,
            replacement
        );
        Ok(())
    }

    /// Join retired workers whose abandoned job has since returned
    fn reap_detached(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.detached)
            .into_iter()
            .partition(|w| w.handle.is_finished());
        for worker in finished {
            if worker.handle.join().is_err() {
                log::warn!("Retired worker {} exited with a panic", worker.id);
            }
        }
        self.detached = running;
    }

    /// Close the job queue and wait briefly for workers to exit.
    ///
    /// Workers stuck inside a job are detached rather than joined.
    pub fn shutdown(&mut self) {
        if self.task_tx.take().is_none() {
            return;
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        let mut threads = std::mem::take(&mut self.workers);
        threads.append(&mut self.detached);
        while !threads.is_empty() && Instant::now() < deadline {
            let (finished, running): (Vec<_>, Vec<_>) =
                threads.into_iter().partition(|w| w.handle.is_finished());
            for worker in finished {
                if worker.handle.join().is_err() {
                    log::warn!("Rollout worker {} exited with a panic", worker.id);
                }
            }
            threads = running;
            if !threads.is_empty() {
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        if !threads.is_empty() {
            log::warn!("Detaching {} unresponsive rollout workers", threads.len());
        }
        log::debug!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn make_worker(factory: &WorkerFactory, id: usize) -> Result<Box<dyn RolloutWorker>> {
    factory(id).map_err(|e| match e {
        EvolutionError::WorkerStartup { .. } => e,
        other => EvolutionError::WorkerStartup {
            worker: id,
            reason: other.to_string(),
        },
    })
}

fn arrange_slots(jobs: Vec<Job>) -> Result<Vec<Slot>> {
    let n = jobs.len();
    let now = Instant::now();
    let mut slots: Vec<Option<Slot>> = (0..n).map(|_| None).collect();
    for job in jobs {
        let index = job.index;
        match slots.get_mut(index) {
            None => {
                return Err(EvolutionError::InvalidJobs(format!(
                    "candidate index {} out of range for {} jobs",
                    index, n
                )));
            }
            Some(Some(_)) => {
                return Err(EvolutionError::InvalidJobs(format!(
                    "candidate index {} submitted twice",
                    index
                )));
            }
            Some(entry) => {
                *entry = Some(Slot {
                    job,
                    attempt: 0,
                    cancel: CancelToken::new(),
                    deadline: now,
                    worker: None,
                    fitness: None,
                });
            }
        }
    }
    // n jobs, n distinct in-range indices: every entry is filled
    Ok(slots.into_iter().flatten().collect())
}

fn worker_loop(
    id: usize,
    mut worker: Box<dyn RolloutWorker>,
    task_rx: Arc<Mutex<Receiver<Task>>>,
    event_tx: Sender<Event>,
    retired: Arc<AtomicBool>,
    aggregation: FitnessAggregation,
    penalty: f64,
) {
    log::debug!("Worker {} ready", id);

    while !retired.load(Ordering::Acquire) {
        // The lock is only held while waiting for the next task
        let next = match task_rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok(task) = next else {
            break;
        };
        let ticket = task.ticket;
        if task.cancel.is_cancelled() {
            if event_tx.send(Event::Cancelled { ticket }).is_err() {
                break;
            }
            continue;
        }
        if event_tx.send(Event::Started { ticket, worker: id }).is_err() {
            break;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| worker.run(&task.job, &task.cancel)));
        let event = match outcome {
            Ok(Ok(results)) => {
                let returns: Vec<f64> = results.iter().map(|r| r.total_return).collect();
                let fitness = aggregation
                    .aggregate(&returns)
                    .filter(|f| f.is_finite())
                    .unwrap_or(penalty);
                Event::Finished {
                    ticket,
                    fitness,
                    failed_rollouts: results.iter().filter(|r| r.is_failed()).count(),
                }
            }
            Ok(Err(Cancelled)) => Event::Cancelled { ticket },
            Err(panic) => Event::Panicked {
                ticket,
                worker: id,
                reason: panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string()),
            },
        };

        if event_tx.send(event).is_err() {
            break;
        }
    }

    log::debug!("Worker {} exiting", id);
}
