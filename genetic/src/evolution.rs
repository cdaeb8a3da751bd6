//! Fitness scoring and breeding of the next generation.
//!
//! A settled species is replaced as a whole: the fittest organisms (the elite fraction) are
//! carried over unchanged, and the rest of the population is bred from parents chosen by
//! binary tournament. Each offspring is either a single-point crossover of two parents or a
//! clone of one, after which every gene is independently regenerated with the mutation rate.

use crate::{
    generator::Generator,
    population::{Chromosome, Organism, Species},
    random::{chance, rand_range},
    Config, Error,
};
use evofuzz_trace::Verdict;
use rand::RngCore;
use std::cmp::Ordering;

/// Fitness awarded for each kind of outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct FitnessTable {
    /// Target killed by a signal.
    pub crashed: f64,
    /// Target killed by the alarm.
    pub hung: f64,
    /// Target exited before its trace stop.
    pub exited_early: f64,
    /// Target ran and exited with a non-zero status.
    pub error_exit: f64,
    /// Target ran and exited with status zero.
    pub success: f64,
    /// Bonus for an outcome the species has not produced before.
    pub novelty: f64,
}

impl Default for FitnessTable {
    fn default() -> Self {
        Self {
            crashed: 100.0,
            hung: 50.0,
            exited_early: 10.0,
            error_exit: 1.0,
            success: 0.5,
            novelty: 5.0,
        }
    }
}

impl FitnessTable {
    pub fn score(&self, verdict: &Verdict, novel: bool) -> f64 {
        let base = match verdict {
            Verdict::Crashed { .. } => self.crashed,
            Verdict::Hung => self.hung,
            Verdict::ExitedEarly { .. } => self.exited_early,
            Verdict::Completed { status: 0 } => self.success,
            Verdict::Completed { .. } => self.error_exit,
        };
        if novel {
            base + self.novelty
        } else {
            base
        }
    }
}

fn by_fitness(a: &Organism, b: &Organism) -> Ordering {
    b.fitness.partial_cmp(&a.fitness).unwrap_or(Ordering::Equal)
}

/// Pick the fitter of two random members of `ranked`.
fn tournament<'a>(
    ranked: &'a [&'a Organism],
    rng: &mut impl RngCore,
) -> Result<&'a Organism, Error> {
    let a = rand_range(rng, ranked.len())?;
    let b = rand_range(rng, ranked.len())?;
    Ok(ranked[a.min(b)])
}

fn crossover(a: &Chromosome, b: &Chromosome, rng: &mut impl RngCore) -> Result<Chromosome, Error> {
    let mut child = *a;
    if a.len() < 2 {
        return Ok(child);
    }
    let point = 1 + rand_range(rng, a.len() - 1)?;
    child.genes_mut()[point..].copy_from_slice(&b.genes()[point..]);
    Ok(child)
}

/// Breed the next generation of `species`.
///
/// The result has exactly as many organisms as the species, all with zero fitness.
pub fn breed<R: RngCore, G: Generator>(
    species: &Species,
    cfg: &Config,
    rng: &mut R,
    generator: &mut G,
) -> Result<Vec<Organism>, Error> {
    let population = species.population_count();
    let mut ranked: Vec<&Organism> = species.organisms().iter().collect();
    ranked.sort_by(|a, b| by_fitness(a, b));

    let mut next = Vec::new();
    next.try_reserve_exact(population)
        .map_err(|_| Error::AllocationFailure("next generation"))?;

    let elites = ((population as f64 * cfg.elitism).ceil() as usize).clamp(1, population);
    next.extend(ranked.iter().take(elites).map(|organism| Organism {
        fitness: 0.0,
        chromosome: organism.chromosome,
    }));

    while next.len() < population {
        let parent = tournament(&ranked, rng)?;
        let mut chromosome = if chance(rng, cfg.crossover_rate)? {
            let other = tournament(&ranked, rng)?;
            crossover(&parent.chromosome, &other.chromosome, rng)?
        } else {
            parent.chromosome
        };
        for (gene, kind) in chromosome.genes_mut().iter_mut().zip(species.args()) {
            if chance(rng, cfg.mutation_rate)? {
                *gene = generator.generate(*kind)?;
            }
        }
        next.push(Organism {
            fitness: 0.0,
            chromosome,
        });
    }
    Ok(next)
}
