//! Evolve populations of syscall invocations across a pool of forked workers.
//!
//! # Overview
//!
//! A fuzzing run is driven by a single "god" process that owns the [population::World]: one
//! [population::Species] per enabled syscall, each holding a fixed number of
//! [population::Organism]s whose chromosomes encode the syscall's arguments. The god never runs
//! a target itself. Instead, a [dispatcher::Dispatcher] turns organisms into [job::Job]s and
//! hands each one to a pseudo-randomly chosen worker over an [evofuzz_ipc::Channel]. Workers
//! execute the job against a traced target and answer with a [job::Report] carrying the
//! [evofuzz_trace::Verdict].
//!
//! Once every organism of a species has been judged, the species is replaced by a new
//! generation bred from the fittest organisms ([evolution]). The loop continues until the
//! shared [StopFlag] is raised or the configured generation limit is reached.
//!
//! ```txt
//! +-----------+   Job    +----------+  fork/exec  +--------+
//! |    god    | -------> |  worker  | ----------> | target |
//! |  (World)  | <------- | (Monitor)| <---------- |        |
//! +-----------+  Report  +----------+   waitpid   +--------+
//! ```
//!
//! # Status
//!
//! `evofuzz-genetic` is **ALPHA** software and is Linux-only.

use evofuzz_ipc::{pipe::Pipe, port::Port, shm::Shared};
use evofuzz_trace::Config as TargetConfig;
use nix::unistd::{fork, ForkResult, Pid};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info};

pub mod catalog;
pub mod dispatcher;
pub mod evolution;
pub mod generator;
pub mod god;
pub mod job;
pub mod population;
pub mod random;
pub mod registry;
pub mod worker;

use catalog::Catalog;
use evolution::FitnessTable;
use generator::RandomGenerator;
use god::God;

/// Default number of organisms per species.
pub const SPECIES_POP: usize = 1000;

/// Largest supported worker pool.
pub const MAX_WORKERS: usize = 64;

/// Exit code of a god process that stopped on an error.
pub const EXIT_FAILURE: i32 = 1;

/// Errors that can occur while evolving.
#[derive(Error, Debug)]
pub enum Error {
    #[error("allocation failed: {0}")]
    AllocationFailure(&'static str),
    #[error("ipc failed: {0}")]
    Ipc(#[from] evofuzz_ipc::Error),
    #[error("trace failed: {0}")]
    Trace(#[from] evofuzz_trace::Error),
    #[error("random source failed")]
    RandomSourceFailure,
    #[error("empty range")]
    EmptyRange,
    #[error("unknown worker: {0}")]
    UnknownWorker(usize),
    #[error("unknown species: {0}")]
    UnknownSpecies(usize),
    #[error("generator failed: {0}")]
    Generator(String),
    #[error("catalog has no enabled syscalls")]
    EmptyCatalog,
    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("population invariant violated: {0}")]
    Invariant(String),
}

/// How the god process reaches its workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Length-prefixed frames over a pair of pipes.
    #[default]
    Pipe,
    /// Datagrams over ports exchanged through the bootstrap slot after fork.
    Port,
}

/// Configuration for a fuzzing run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of worker processes.
    pub workers: usize,

    /// Organisms per species.
    pub species_population: usize,

    /// Upper bound on organisms per species.
    pub species_cap: usize,

    /// Fraction of each species retained unchanged in the next generation.
    pub elitism: f64,

    /// Probability that an offspring is produced by crossover rather than cloning.
    pub crossover_rate: f64,

    /// Probability that any single gene of an offspring is regenerated.
    pub mutation_rate: f64,

    /// Maximum number of jobs outstanding on any worker.
    ///
    /// Jobs beyond the window wait in the god until the worker reports back, which keeps
    /// both directions of a channel from filling at once.
    pub window: usize,

    /// How often the god checks the stop flag while waiting for reports.
    pub poll_interval: Duration,

    /// Number of generations to evaluate per species, if bounded.
    pub max_generations: Option<u64>,

    /// How workers are connected to the god.
    pub transport: TransportKind,

    /// Executable each job is run against.
    pub executor: PathBuf,

    /// How targets are supervised.
    pub target: TargetConfig,

    /// Fitness awarded per verdict.
    pub fitness: FitnessTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            species_population: SPECIES_POP,
            species_cap: 4096,
            elitism: 0.25,
            crossover_rate: 0.5,
            mutation_rate: 0.1,
            window: 32,
            poll_interval: Duration::from_millis(100),
            max_generations: None,
            transport: TransportKind::Pipe,
            executor: PathBuf::from("evofuzz-executor"),
            target: TargetConfig::default(),
            fitness: FitnessTable::default(),
        }
    }
}

impl Config {
    /// Check that every field is within its supported range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(Error::InvalidConfig("workers must be in 1..=64"));
        }
        if self.species_population == 0 {
            return Err(Error::InvalidConfig("species population must be positive"));
        }
        if self.species_population > self.species_cap {
            return Err(Error::InvalidConfig("species population exceeds cap"));
        }
        if !(self.elitism > 0.0 && self.elitism <= 1.0) {
            return Err(Error::InvalidConfig("elitism must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.crossover_rate) {
            return Err(Error::InvalidConfig("crossover rate must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(Error::InvalidConfig("mutation rate must be in [0, 1]"));
        }
        if self.window == 0 {
            return Err(Error::InvalidConfig("window must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be positive"));
        }
        if self.max_generations == Some(0) {
            return Err(Error::InvalidConfig("generation limit must be positive"));
        }
        Ok(())
    }
}

/// A flag shared by every process forked after its creation.
///
/// Raising it asks the god to stop dispatching and the workers to stop accepting jobs.
#[derive(Clone)]
pub struct StopFlag(Arc<Shared<AtomicBool>>);

impl StopFlag {
    pub fn new() -> Result<Self, Error> {
        Ok(Self(Arc::new(Shared::new(AtomicBool::new(false))?)))
    }

    /// Raise the flag. Raising it again has no further effect.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Fork the god process and return its pid.
///
/// The god runs genesis and then the evolution loop until `stop` is raised (or the generation
/// limit is reached), and exits with zero on a clean shutdown or [EXIT_FAILURE] otherwise.
/// Configuration problems are reported before forking.
pub fn setup_genetic_module(cfg: Config, catalog: Catalog, stop: StopFlag) -> Result<Pid, Error> {
    cfg.validate()?;
    if catalog.enabled().next().is_none() {
        return Err(Error::EmptyCatalog);
    }

    // SAFETY: the child only runs the god and then exits without returning.
    match unsafe { fork() }.map_err(evofuzz_ipc::Error::Fork)? {
        ForkResult::Parent { child } => {
            info!(pid = %child, transport = ?cfg.transport, "forked god");
            Ok(child)
        }
        ForkResult::Child => {
            let code = panic::catch_unwind(AssertUnwindSafe(|| match cfg.transport {
                TransportKind::Pipe => evolve(Pipe, cfg, catalog, stop),
                TransportKind::Port => evolve(Port, cfg, catalog, stop),
            }))
            .unwrap_or(evofuzz_ipc::EXIT_PANIC);

            // SAFETY: _exit skips the parent's atexit handlers.
            unsafe { libc::_exit(code) }
        }
    }
}

/// Body of the god process.
fn evolve<T: evofuzz_ipc::Transport>(
    transport: T,
    cfg: Config,
    catalog: Catalog,
    stop: StopFlag,
) -> i32 {
    let generator = RandomGenerator::new(StdRng::from_entropy());
    let result = God::genesis(
        cfg,
        transport,
        catalog,
        stop,
        StdRng::from_entropy(),
        generator,
    )
    .and_then(|god| god.run());
    match result {
        Ok(summary) => {
            info!(
                generation = summary.generation,
                jobs = summary.jobs,
                findings = summary.findings,
                "god stopped"
            );
            0
        }
        Err(err) => {
            error!(?err, "god failed");
            EXIT_FAILURE
        }
    }
}
