//! The process that owns the world and drives evolution.

use crate::{
    catalog::Catalog,
    dispatcher::Dispatcher,
    evolution,
    generator::Generator,
    job::{JobKind, Report},
    population::World,
    worker::Worker,
    Config, Error, StopFlag,
};
use evofuzz_ipc::Transport;
use evofuzz_trace::Monitor;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, warn};

/// What a finished run achieved.
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    /// Oldest generation any species was evaluating when the run ended.
    pub generation: u64,
    /// Jobs executed by all workers.
    pub jobs: u64,
    /// Jobs whose verdict was a finding.
    pub findings: u64,
    /// Mean of the species' average fitness.
    pub average_fitness: f64,
}

/// Owns the [World] and evolves it with the help of a pool of workers.
pub struct God<T: Transport, R: RngCore + SeedableRng, G: Generator> {
    cfg: Config,
    world: World,
    dispatcher: Dispatcher<T, R>,
    rng: R,
    generator: G,
    stop: StopFlag,
}

impl<T: Transport, R: RngCore + SeedableRng, G: Generator> God<T, R, G> {
    /// Initialize the world, start the workers, and dispatch the first generation.
    pub fn genesis(
        cfg: Config,
        transport: T,
        catalog: Catalog,
        stop: StopFlag,
        mut rng: R,
        mut generator: G,
    ) -> Result<Self, Error> {
        cfg.validate()?;
        let mut world = World::initialize(&catalog, cfg.species_population, cfg.species_cap)?;
        info!(
            species = world.species_count(),
            population = cfg.species_population,
            "initialized world"
        );

        let worker = Worker::new(catalog, Monitor::new(cfg.target.clone()), cfg.executor.clone());
        let dispatch = R::from_rng(&mut rng).map_err(|_| Error::RandomSourceFailure)?;
        let mut dispatcher = Dispatcher::new(
            transport,
            cfg.workers,
            cfg.window,
            dispatch,
            worker,
            stop.clone(),
        )?;
        dispatcher.create_first_generation(&mut world, &mut generator)?;
        Ok(Self {
            cfg,
            world,
            dispatcher,
            rng,
            generator,
            stop,
        })
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Whether every species evaluated its last permitted generation.
    fn finished(&self) -> bool {
        let Some(max) = self.cfg.max_generations else {
            return false;
        };
        self.world
            .species()
            .iter()
            .all(|species| species.is_settled() && species.generation() + 1 >= max)
    }

    /// Harvest reports and breed new generations until stopped.
    ///
    /// The stop flag is checked at least once per poll interval. Once it is observed no
    /// further jobs are dispatched, and the workers are shut down.
    pub fn run(mut self) -> Result<Summary, Error> {
        info!(workers = self.dispatcher.workers(), "evolution started");
        loop {
            if self.stop.is_stopped() {
                info!(
                    generation = self.world.current_generation(),
                    "stop observed"
                );
                break;
            }
            if self.finished() {
                info!(
                    generation = self.world.current_generation(),
                    "generation limit reached"
                );
                break;
            }
            for report in self.dispatcher.poll(self.cfg.poll_interval)? {
                self.absorb(report)?;
            }
        }

        let generation = self.world.current_generation();
        let average_fitness = self.world.average_fitness();
        let (jobs, findings) = self.dispatcher.shutdown()?;
        Ok(Summary {
            generation,
            jobs,
            findings,
            average_fitness,
        })
    }

    /// Apply one report and advance its species if its generation is complete.
    fn absorb(&mut self, report: Report) -> Result<(), Error> {
        let index = report.species as usize;
        let Ok(species) = self.world.get_mut(index) else {
            warn!(species = index, "report for unknown species");
            return Ok(());
        };
        let applied = species.record(
            report.organism as usize,
            report.generation,
            report.verdict,
            &self.cfg.fitness,
        );
        if !applied || !species.is_settled() {
            return Ok(());
        }
        debug!(
            species = species.name(),
            generation = species.generation(),
            average_fitness = species.average_fitness(),
            "generation evaluated"
        );
        let advance = !self.stop.is_stopped()
            && self
                .cfg
                .max_generations
                .map_or(true, |max| species.generation() + 1 < max);
        if advance {
            let next = evolution::breed(species, &self.cfg, &mut self.rng, &mut self.generator)?;
            species.replace(next)?;
            self.dispatcher
                .dispatch_species(JobKind::NewGeneration, index, species)?;
        }

        let previous = self.world.current_generation();
        self.world.refresh();
        if self.world.current_generation() > previous {
            info!(
                generation = self.world.current_generation(),
                average_fitness = self.world.average_fitness(),
                "generation advanced"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalog::tests::catalog, generator::RandomGenerator};
    use commonware_macros::test_traced;
    use evofuzz_ipc::{pipe::Pipe, port::Port};
    use rand::rngs::StdRng;
    use std::{
        path::PathBuf,
        thread,
        time::{Duration, Instant},
    };

    fn config(max_generations: Option<u64>) -> Config {
        Config {
            workers: 2,
            species_population: 8,
            species_cap: 8,
            window: 4,
            poll_interval: Duration::from_millis(20),
            max_generations,
            executor: PathBuf::from("/bin/true"),
            ..Config::default()
        }
    }

    fn genesis<T: Transport>(
        cfg: Config,
        transport: T,
        stop: StopFlag,
    ) -> God<T, StdRng, RandomGenerator<StdRng>> {
        God::genesis(
            cfg,
            transport,
            catalog(3),
            stop,
            StdRng::seed_from_u64(0),
            RandomGenerator::new(StdRng::seed_from_u64(1)),
        )
        .unwrap()
    }

    fn bounded<T: Transport>(transport: T) {
        let god = genesis(config(Some(3)), transport, StopFlag::new().unwrap());
        assert_eq!(god.world().species_count(), 3);
        let summary = god.run().unwrap();

        // Three generations of three species of eight organisms
        assert_eq!(summary.generation, 2);
        assert_eq!(summary.jobs, 3 * 3 * 8);
        assert_eq!(summary.findings, 0);
        assert!(summary.average_fitness > 0.0);
    }

    #[test_traced]
    fn test_bounded_run_over_pipe() {
        bounded(Pipe);
    }

    #[test_traced]
    fn test_bounded_run_over_port() {
        bounded(Port);
    }

    #[test_traced]
    fn test_stop_ends_run() {
        let stop = StopFlag::new().unwrap();
        let god = genesis(config(None), Pipe, stop.clone());

        let stopper = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                stop.stop();
                stop.stop();
                Instant::now()
            })
        };
        let summary = god.run().unwrap();
        let stopped_at = stopper.join().unwrap();

        // The loop notices within a poll interval; shutdown only waits for running jobs
        assert!(stopped_at.elapsed() < Duration::from_secs(5));
        assert!(summary.jobs > 0);
        assert!(stop.is_stopped());
    }

    #[test_traced]
    fn test_genesis_rejects_invalid_config() {
        let cfg = Config {
            workers: 0,
            ..config(None)
        };
        let result = God::genesis(
            cfg,
            Pipe,
            catalog(1),
            StopFlag::new().unwrap(),
            StdRng::seed_from_u64(0),
            RandomGenerator::new(StdRng::seed_from_u64(1)),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
