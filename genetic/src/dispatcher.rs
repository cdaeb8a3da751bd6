//! Turning organisms into jobs and routing them to workers.
//!
//! Every job is assigned to one worker chosen uniformly at random. A worker has at most
//! `window` jobs written to its channel at any time; the rest wait in a per-worker backlog and
//! are written as reports come back. Because the god never writes more than a worker can
//! buffer, it can never block on a worker that is itself blocked writing a report.
//!
//! Workers that die are reaped, replaced in the same slot, and handed the jobs that were
//! outstanding on their predecessor.

use crate::{
    generator::Generator,
    job::{Job, JobKind, Report},
    population::{Chromosome, Species, World},
    random::rand_range,
    registry::Registry,
    worker::{Worker, EXIT_CHANNEL},
    Error, StopFlag,
};
use evofuzz_ipc::{
    atomic, close_all_except, port::slot::BOOTSTRAP_SLOT, ready, Channel, Error as IpcError,
    Transport,
};
use nix::unistd::Pid;
use rand::RngCore;
use std::{
    collections::VecDeque,
    mem,
    os::fd::{AsFd, BorrowedFd},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Create an empty job of `kind` for `syscall`.
pub fn create_job(kind: JobKind, syscall: u64) -> Job {
    Job {
        kind,
        syscall,
        species: 0,
        organism: 0,
        generation: 0,
        args: Chromosome::default(),
    }
}

/// The god's view of one worker.
struct Slot<C> {
    pid: Pid,
    channel: C,
    /// Jobs written to the channel and not yet answered, oldest first.
    inflight: VecDeque<Job>,
    /// Jobs assigned to this worker but not yet written.
    backlog: VecDeque<Job>,
}

impl<C> Slot<C> {
    fn new(pid: Pid, channel: C) -> Self {
        Self {
            pid,
            channel,
            inflight: VecDeque::new(),
            backlog: VecDeque::new(),
        }
    }
}

/// Routes jobs to a pool of workers and collects their reports.
pub struct Dispatcher<T: Transport, R: RngCore> {
    transport: T,
    window: usize,
    rng: R,
    worker: Worker,
    registry: Registry,
    stop: StopFlag,
    slots: Vec<Slot<T::Channel>>,
}

impl<T: Transport, R: RngCore> Dispatcher<T, R> {
    /// Fork `workers` workers, each running `worker`.
    pub fn new(
        transport: T,
        workers: usize,
        window: usize,
        rng: R,
        worker: Worker,
        stop: StopFlag,
    ) -> Result<Self, Error> {
        let mut dispatcher = Self {
            transport,
            window,
            rng,
            worker,
            registry: Registry::new()?,
            stop,
            slots: Vec::with_capacity(workers),
        };
        for slot in 0..workers {
            let (pid, channel) = dispatcher.spawn(slot)?;
            dispatcher.slots.push(Slot::new(pid, channel));
        }
        info!(workers, "started workers");
        Ok(dispatcher)
    }

    /// Fork a worker for `slot` and enroll it in the registry.
    fn spawn(&self, slot: usize) -> Result<(Pid, T::Channel), Error> {
        let (pid, channel) = self.transport.spawn(|channel| {
            // Release the god's ends of every other channel
            let mut keep = channel.descriptors();
            keep.push(BOOTSTRAP_SLOT);
            if close_all_except(&keep).is_err() {
                return EXIT_CHANNEL;
            }
            self.worker.run(slot, channel, &self.registry, &self.stop)
        })?;
        self.registry.enroll(slot, pid)?;
        debug!(slot, %pid, "spawned worker");
        Ok((pid, channel))
    }

    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Pid of the worker currently serving `slot`.
    pub fn pid(&self, slot: usize) -> Result<Pid, Error> {
        self.slots
            .get(slot)
            .map(|slot| slot.pid)
            .ok_or(Error::UnknownWorker(slot))
    }

    /// Jobs assigned to workers and not yet answered.
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.inflight.len() + slot.backlog.len())
            .sum()
    }

    /// Assign `job` to a worker chosen uniformly at random and return its slot.
    pub fn submit_job(&mut self, job: Job) -> Result<usize, Error> {
        let index = rand_range(&mut self.rng, self.slots.len())?;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(Error::UnknownWorker(index))?;
        slot.backlog.push_back(job);
        self.pump(index)?;
        Ok(index)
    }

    /// Write backlogged jobs to the worker in `index` until its window is full.
    fn pump(&mut self, index: usize) -> Result<(), Error> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(Error::UnknownWorker(index))?;
        while slot.inflight.len() < self.window {
            let Some(job) = slot.backlog.pop_front() else {
                break;
            };
            match slot.channel.send(&job) {
                Ok(()) => slot.inflight.push_back(job),
                Err(IpcError::Closed) => {
                    // The worker is gone; the next poll replaces it
                    slot.backlog.push_front(job);
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Submit one job per organism of `species`, which sits at `index` in the world.
    pub fn dispatch_species(
        &mut self,
        kind: JobKind,
        index: usize,
        species: &Species,
    ) -> Result<(), Error> {
        for (organism, member) in species.organisms().iter().enumerate() {
            let mut job = create_job(kind, species.syscall());
            job.species = index as u32;
            job.organism = organism as u32;
            job.generation = species.generation();
            job.args = member.chromosome;
            self.submit_job(job)?;
        }
        debug!(
            species = species.name(),
            generation = species.generation(),
            ?kind,
            "dispatched"
        );
        Ok(())
    }

    /// Generate chromosomes for every organism of `world` and submit a genesis job for each.
    ///
    /// Returns the number of jobs submitted.
    pub fn create_first_generation<G: Generator>(
        &mut self,
        world: &mut World,
        generator: &mut G,
    ) -> Result<usize, Error> {
        let mut submitted = 0;
        for index in 0..world.species_count() {
            let species = world.get_mut(index)?;
            let kinds = species.args().to_vec();
            for organism in species.organisms_mut() {
                generator.fill(&kinds, &mut organism.chromosome)?;
            }
            let species = world.get(index)?;
            self.dispatch_species(JobKind::Genesis, index, species)?;
            submitted += species.population_count();
        }
        info!(
            species = world.species_count(),
            jobs = submitted,
            "created first generation"
        );
        Ok(submitted)
    }

    /// Wait up to `timeout` for reports and return those that arrived.
    ///
    /// Workers whose channel closed are replaced before returning.
    pub fn poll(&mut self, timeout: Duration) -> Result<Vec<Report>, Error> {
        let readable = {
            let fds: Vec<BorrowedFd<'_>> =
                self.slots.iter().map(|slot| slot.channel.as_fd()).collect();
            ready(&fds, timeout)?
        };

        let mut reports = Vec::new();
        for index in readable {
            match self.slots[index].channel.recv::<Report>() {
                Ok(report) => {
                    self.settle(index, &report);
                    self.pump(index)?;
                    reports.push(report);
                }
                Err(IpcError::Closed) => self.respawn(index)?,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(reports)
    }

    /// Retire the job answered by `report`.
    fn settle(&mut self, index: usize, report: &Report) {
        let slot = &mut self.slots[index];
        match slot.inflight.iter().position(|job| report.answers(job)) {
            Some(position) => {
                slot.inflight.remove(position);
            }
            None => warn!(
                slot = index,
                species = report.species,
                organism = report.organism,
                "report for unknown job"
            ),
        }
    }

    /// Reap the dead worker in `index` and fork a replacement that inherits its jobs.
    fn respawn(&mut self, index: usize) -> Result<(), Error> {
        let status = atomic::wait_for_exit(&self.registry.get(index)?.pid)?;
        if self.stop.is_stopped() {
            debug!(slot = index, ?status, "worker exited after stop");
            return Ok(());
        }
        warn!(slot = index, ?status, "worker died");

        let (pid, channel) = self.spawn(index)?;
        let old = mem::replace(&mut self.slots[index], Slot::new(pid, channel));
        let slot = &mut self.slots[index];
        slot.backlog.extend(old.inflight);
        slot.backlog.extend(old.backlog);
        self.pump(index)
    }

    /// Close every channel and wait for all workers to exit.
    ///
    /// A worker finishes the job it is running and exits once it can no longer report.
    /// Backlogged jobs are dropped. Returns the jobs and findings counted by all workers.
    pub fn shutdown(self) -> Result<(u64, u64), Error> {
        let Self {
            slots, registry, ..
        } = self;
        drop(slots);
        for slot in 0..crate::MAX_WORKERS {
            let record = registry.get(slot)?;
            if let Some(status) = atomic::wait_for_exit(&record.pid)? {
                debug!(slot, ?status, "reaped worker");
            }
        }
        let (jobs, findings) = registry.totals();
        info!(jobs, findings, "workers stopped");
        Ok((jobs, findings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{tests::catalog, Catalog},
        generator::RandomGenerator,
        SPECIES_POP,
    };
    use commonware_macros::test_traced;
    use evofuzz_ipc::{pipe::Pipe, port::Port};
    use evofuzz_trace::{Config as TargetConfig, Monitor, Verdict};
    use nix::sys::signal::{kill, Signal};
    use rand::{rngs::StdRng, SeedableRng};
    use std::{path::PathBuf, time::Instant};

    fn worker(catalog: Catalog) -> Worker {
        Worker::new(
            catalog,
            Monitor::new(TargetConfig::default()),
            PathBuf::from("/bin/true"),
        )
    }

    fn new_dispatcher<T: Transport>(
        transport: T,
        workers: usize,
        window: usize,
    ) -> Dispatcher<T, StdRng> {
        Dispatcher::new(
            transport,
            workers,
            window,
            StdRng::seed_from_u64(0),
            worker(catalog(4)),
            StopFlag::new().unwrap(),
        )
        .unwrap()
    }

    /// Poll until `count` reports arrived or a deadline passes.
    fn collect<T: Transport, R: RngCore>(
        dispatcher: &mut Dispatcher<T, R>,
        count: usize,
    ) -> Vec<Report> {
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut reports = Vec::new();
        while reports.len() < count && Instant::now() < deadline {
            reports.extend(dispatcher.poll(Duration::from_millis(50)).unwrap());
        }
        reports
    }

    #[test]
    fn test_create_job() {
        let job = create_job(JobKind::NewGeneration, 60);
        assert_eq!(job.kind, JobKind::NewGeneration);
        assert_eq!(job.syscall, 60);
        assert_eq!(job.arg_count(), 0);
    }

    #[test_traced]
    fn test_submit_job_uniform() {
        const WORKERS: usize = 4;
        const JOBS: usize = 4_000;

        // A window of zero keeps every job in the backlogs, so nothing runs
        let mut dispatcher = new_dispatcher(Pipe, WORKERS, 0);
        let mut counts = [0usize; WORKERS];
        for organism in 0..JOBS {
            let mut job = create_job(JobKind::Genesis, 0);
            job.organism = organism as u32;
            counts[dispatcher.submit_job(job).unwrap()] += 1;
        }
        assert_eq!(dispatcher.pending(), JOBS);
        for count in counts {
            assert!((900..=1_100).contains(&count), "{counts:?}");
        }
        dispatcher.shutdown().unwrap();
    }

    fn first_generation<T: Transport>(transport: T) {
        let mut world = World::initialize(&catalog(2), 20, 20).unwrap();
        let mut dispatcher = new_dispatcher(transport, 3, 4);
        let mut generator = RandomGenerator::new(StdRng::seed_from_u64(1));
        let submitted = dispatcher
            .create_first_generation(&mut world, &mut generator)
            .unwrap();
        assert_eq!(submitted, 40);

        let reports = collect(&mut dispatcher, 40);
        assert_eq!(reports.len(), 40);
        assert_eq!(dispatcher.pending(), 0);
        for report in &reports {
            assert_eq!(report.generation, 0);
            assert_eq!(report.verdict, Some(Verdict::Completed { status: 0 }));
        }
        let (jobs, findings) = dispatcher.shutdown().unwrap();
        assert_eq!((jobs, findings), (40, 0));
    }

    #[test_traced]
    fn test_first_generation_over_pipe() {
        first_generation(Pipe);
    }

    #[test_traced]
    fn test_first_generation_over_port() {
        first_generation(Port);
    }

    #[test_traced]
    fn test_dead_worker_replaced() {
        let mut world = World::initialize(&catalog(1), 30, SPECIES_POP).unwrap();
        let mut dispatcher = new_dispatcher(Pipe, 2, 2);
        let victim = dispatcher.pid(0).unwrap();
        kill(victim, Signal::SIGKILL).unwrap();

        // Every job is still answered exactly once
        let mut generator = RandomGenerator::new(StdRng::seed_from_u64(2));
        dispatcher
            .create_first_generation(&mut world, &mut generator)
            .unwrap();
        let reports = collect(&mut dispatcher, 30);
        let mut organisms: Vec<u32> = reports.iter().map(|report| report.organism).collect();
        organisms.sort_unstable();
        assert_eq!(organisms, (0..30).collect::<Vec<_>>());
        assert_ne!(dispatcher.pid(0).unwrap(), victim);
        dispatcher.shutdown().unwrap();
    }
}
