//! The evolving population: world, species, organisms, and chromosomes.
//!
//! Organisms live in a per-species arena (a `Vec`) and are addressed by index. That index is
//! the organism id carried in jobs and reports, so a report can be matched to its organism
//! without any pointer crossing a process boundary.

use crate::{
    catalog::{ArgKind, Catalog, SyscallDescriptor},
    evolution::FitnessTable,
    Error,
};
use evofuzz_trace::Verdict;
use std::collections::HashSet;

/// Largest number of arguments a chromosome can encode.
pub const CHROMOSOME_SLOTS: usize = 6;

/// Encoded argument values of one organism, one slot per syscall argument.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Chromosome {
    genes: [u64; CHROMOSOME_SLOTS],
    len: u8,
}

impl Chromosome {
    /// A chromosome of `len` zeroed genes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [CHROMOSOME_SLOTS].
    pub fn zeroed(len: usize) -> Self {
        assert!(len <= CHROMOSOME_SLOTS, "too many genes: {len}");
        Self {
            genes: [0; CHROMOSOME_SLOTS],
            len: len as u8,
        }
    }

    /// A chromosome holding `genes`, or `None` if there are too many.
    pub fn from_genes(genes: &[u64]) -> Option<Self> {
        if genes.len() > CHROMOSOME_SLOTS {
            return None;
        }
        let mut chromosome = Self::zeroed(genes.len());
        chromosome.genes_mut().copy_from_slice(genes);
        Some(chromosome)
    }

    pub fn genes(&self) -> &[u64] {
        &self.genes[..self.len as usize]
    }

    pub fn genes_mut(&mut self) -> &mut [u64] {
        &mut self.genes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One candidate test case.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Organism {
    pub fitness: f64,
    pub chromosome: Chromosome,
}

/// The population of organisms evolved for one syscall.
#[derive(Debug)]
pub struct Species {
    name: String,
    syscall: u64,
    args: Vec<ArgKind>,
    cap: usize,
    population_count: usize,
    average_fitness: f64,
    organisms: Vec<Organism>,
    evaluated: Vec<bool>,
    remaining: usize,
    generation: u64,
    seen: HashSet<Verdict>,
}

impl Species {
    /// Allocate a species of `population` zeroed organisms for `syscall`.
    pub fn new(syscall: &SyscallDescriptor, population: usize, cap: usize) -> Result<Self, Error> {
        if population > cap {
            return Err(Error::Invariant(format!(
                "{}: population {population} exceeds cap {cap}",
                syscall.name
            )));
        }
        let mut organisms = Vec::new();
        organisms
            .try_reserve_exact(population)
            .map_err(|_| Error::AllocationFailure("organisms"))?;
        organisms.resize(
            population,
            Organism {
                fitness: 0.0,
                chromosome: Chromosome::zeroed(syscall.arity()),
            },
        );
        let mut evaluated = Vec::new();
        evaluated
            .try_reserve_exact(population)
            .map_err(|_| Error::AllocationFailure("evaluations"))?;
        evaluated.resize(population, false);

        Ok(Self {
            name: syscall.name.clone(),
            syscall: syscall.number,
            args: syscall.args.clone(),
            cap,
            population_count: population,
            average_fitness: 0.0,
            organisms,
            evaluated,
            remaining: population,
            generation: 0,
            seen: HashSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn syscall(&self) -> u64 {
        self.syscall
    }

    pub fn args(&self) -> &[ArgKind] {
        &self.args
    }

    pub fn population_count(&self) -> usize {
        self.population_count
    }

    pub fn average_fitness(&self) -> f64 {
        self.average_fitness
    }

    /// The generation currently being evaluated.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn organisms(&self) -> &[Organism] {
        &self.organisms
    }

    pub fn organisms_mut(&mut self) -> &mut [Organism] {
        &mut self.organisms
    }

    /// Whether every organism of the current generation has been judged.
    pub fn is_settled(&self) -> bool {
        self.remaining == 0
    }

    /// Record the outcome of one organism's job.
    ///
    /// `None` marks a job that was aborted by the engine; it earns no fitness. Outcomes for a
    /// past generation or an organism that was already judged are ignored. Returns whether
    /// the outcome was applied.
    pub fn record(
        &mut self,
        organism: usize,
        generation: u64,
        outcome: Option<Verdict>,
        table: &FitnessTable,
    ) -> bool {
        if generation != self.generation {
            return false;
        }
        let Some(evaluated) = self.evaluated.get_mut(organism) else {
            return false;
        };
        if *evaluated {
            return false;
        }
        *evaluated = true;
        self.remaining -= 1;

        let fitness = match outcome {
            Some(verdict) => {
                let novel = self.seen.insert(verdict);
                table.score(&verdict, novel)
            }
            None => 0.0,
        };
        self.organisms[organism].fitness = fitness;
        if self.remaining == 0 {
            let total: f64 = self.organisms.iter().map(|o| o.fitness).sum();
            self.average_fitness = total / self.population_count as f64;
        }
        true
    }

    /// Replace the whole population with the next generation.
    ///
    /// A rejected generation leaves the species untouched.
    pub fn replace(&mut self, next: Vec<Organism>) -> Result<(), Error> {
        if next.len() != self.population_count {
            return Err(Error::Invariant(format!(
                "{}: next generation has {} organisms, expected {}",
                self.name,
                next.len(),
                self.population_count
            )));
        }
        if let Some(organism) = next
            .iter()
            .find(|organism| organism.chromosome.len() != self.args.len())
        {
            return Err(Error::Invariant(format!(
                "{}: next generation has a chromosome of {} genes for {} arguments",
                self.name,
                organism.chromosome.len(),
                self.args.len()
            )));
        }
        self.organisms = next;
        self.evaluated.iter_mut().for_each(|evaluated| *evaluated = false);
        self.remaining = self.population_count;
        self.generation += 1;
        self.validate()
    }

    /// Check that the bookkeeping agrees with the organisms actually held.
    pub fn validate(&self) -> Result<(), Error> {
        if self.organisms.len() != self.population_count {
            return Err(Error::Invariant(format!(
                "{}: holds {} organisms, counted {}",
                self.name,
                self.organisms.len(),
                self.population_count
            )));
        }
        if self.population_count > self.cap {
            return Err(Error::Invariant(format!(
                "{}: population {} exceeds cap {}",
                self.name, self.population_count, self.cap
            )));
        }
        let pending = self.evaluated.iter().filter(|evaluated| !**evaluated).count();
        if self.evaluated.len() != self.population_count || pending != self.remaining {
            return Err(Error::Invariant(format!(
                "{}: {} organisms pending, counted {}",
                self.name, pending, self.remaining
            )));
        }
        if let Some(organism) = self
            .organisms
            .iter()
            .find(|organism| organism.chromosome.len() != self.args.len())
        {
            return Err(Error::Invariant(format!(
                "{}: chromosome of {} genes for {} arguments",
                self.name,
                organism.chromosome.len(),
                self.args.len()
            )));
        }
        Ok(())
    }
}

/// Every species under evolution.
#[derive(Debug)]
pub struct World {
    species: Vec<Species>,
    current_generation: u64,
    average_fitness: f64,
}

impl World {
    /// Allocate one species of `population` organisms per enabled syscall in `catalog`.
    pub fn initialize(catalog: &Catalog, population: usize, cap: usize) -> Result<Self, Error> {
        let count = catalog.enabled().count();
        if count == 0 {
            return Err(Error::EmptyCatalog);
        }
        let mut species = Vec::new();
        species
            .try_reserve_exact(count)
            .map_err(|_| Error::AllocationFailure("species index"))?;
        for syscall in catalog.enabled() {
            species.push(Species::new(syscall, population, cap)?);
        }
        Ok(Self {
            species,
            current_generation: 0,
            average_fitness: 0.0,
        })
    }

    pub fn species_count(&self) -> usize {
        self.species.len()
    }

    pub fn species(&self) -> &[Species] {
        &self.species
    }

    pub fn get(&self, index: usize) -> Result<&Species, Error> {
        self.species.get(index).ok_or(Error::UnknownSpecies(index))
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut Species, Error> {
        self.species.get_mut(index).ok_or(Error::UnknownSpecies(index))
    }

    /// The oldest generation still being evaluated by any species.
    pub fn current_generation(&self) -> u64 {
        self.current_generation
    }

    pub fn average_fitness(&self) -> f64 {
        self.average_fitness
    }

    /// Recompute world-level statistics after species advanced.
    pub fn refresh(&mut self) {
        self.current_generation = self
            .species
            .iter()
            .map(Species::generation)
            .min()
            .unwrap_or_default();
        let total: f64 = self.species.iter().map(Species::average_fitness).sum();
        self.average_fitness = total / self.species.len().max(1) as f64;
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.species.iter().try_for_each(Species::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::tests::{catalog, descriptor},
        SPECIES_POP,
    };

    #[test]
    fn test_initialize() {
        for count in [1, 2, 5] {
            let world = World::initialize(&catalog(count), SPECIES_POP, 4096).unwrap();
            assert_eq!(world.species_count(), count as usize);
            assert_eq!(world.current_generation(), 0);
            for species in world.species() {
                assert_eq!(species.population_count(), SPECIES_POP);
                assert_eq!(species.organisms().len(), SPECIES_POP);
                assert_eq!(species.generation(), 0);
                assert!(species
                    .organisms()
                    .iter()
                    .all(|o| o.fitness == 0.0 && o.chromosome.genes() == [0, 0]));
            }
            world.validate().unwrap();
        }
    }

    #[test]
    fn test_initialize_skips_disabled() {
        let mut disabled = descriptor("kill", 62, &[ArgKind::Pid, ArgKind::Signal]);
        disabled.enabled = false;
        let catalog = Catalog::new(vec![descriptor("getpid", 39, &[]), disabled]).unwrap();
        let world = World::initialize(&catalog, 10, 10).unwrap();
        assert_eq!(world.species_count(), 1);
        assert_eq!(world.get(0).unwrap().name(), "getpid");
        assert!(matches!(world.get(1), Err(Error::UnknownSpecies(1))));
    }

    #[test]
    fn test_initialize_rejects() {
        // Test case 0: nothing enabled
        let empty = Catalog::new(Vec::new()).unwrap();
        assert!(matches!(
            World::initialize(&empty, 10, 10),
            Err(Error::EmptyCatalog)
        ));

        // Test case 1: population above cap
        assert!(matches!(
            World::initialize(&catalog(1), 11, 10),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn test_record_settles_generation() {
        let table = FitnessTable::default();
        let mut species = Species::new(&descriptor("close", 3, &[ArgKind::Fd]), 3, 3).unwrap();

        // Test case 0: a crash, then the same crash again (no longer novel)
        assert!(species.record(0, 0, Some(Verdict::Crashed { signal: 11 }), &table));
        assert!(species.record(1, 0, Some(Verdict::Crashed { signal: 11 }), &table));
        let first = species.organisms()[0].fitness;
        let second = species.organisms()[1].fitness;
        assert_eq!(first - second, table.novelty);
        assert!(!species.is_settled());

        // Test case 1: duplicates, stale generations, and unknown organisms are ignored
        assert!(!species.record(0, 0, None, &table));
        assert!(!species.record(2, 1, None, &table));
        assert!(!species.record(7, 0, None, &table));

        // Test case 2: an aborted job still settles the organism
        assert!(species.record(2, 0, None, &table));
        assert!(species.is_settled());
        assert_eq!(species.average_fitness(), (first + second) / 3.0);
        species.validate().unwrap();
    }

    #[test]
    fn test_replace() {
        let mut species = Species::new(&descriptor("close", 3, &[ArgKind::Fd]), 2, 2).unwrap();

        // Test case 0: wrong size is rejected
        assert!(matches!(
            species.replace(vec![Organism::default()]),
            Err(Error::Invariant(_))
        ));

        // Test case 1: chromosomes of the wrong arity are rejected
        let bad = Organism {
            fitness: 0.0,
            chromosome: Chromosome::zeroed(2),
        };
        assert!(matches!(
            species.replace(vec![bad.clone(), bad]),
            Err(Error::Invariant(_))
        ));

        // Rejected generations leave the species as it was
        assert_eq!(species.generation(), 0);
        assert!(!species.is_settled());
        assert!(species
            .organisms()
            .iter()
            .all(|organism| organism.chromosome.len() == 1));
        species.validate().unwrap();

        // Test case 2: a well-formed generation advances the species
        let next = vec![
            Organism {
                fitness: 0.0,
                chromosome: Chromosome::from_genes(&[5]).unwrap(),
            };
            2
        ];
        species.replace(next).unwrap();
        assert_eq!(species.generation(), 1);
        assert!(!species.is_settled());
        assert_eq!(species.organisms()[1].chromosome.genes(), [5]);
    }

    #[test]
    fn test_refresh() {
        let table = FitnessTable::default();
        let mut world = World::initialize(&catalog(2), 1, 1).unwrap();
        let next = vec![Organism {
            fitness: 0.0,
            chromosome: Chromosome::zeroed(2),
        }];

        // Only one species advances, so the world stays at the oldest generation
        let species = world.get_mut(0).unwrap();
        species.record(0, 0, Some(Verdict::Hung), &table);
        species.replace(next).unwrap();
        world.refresh();
        assert_eq!(world.current_generation(), 0);
        assert_eq!(world.average_fitness(), (table.hung + table.novelty) / 2.0);
    }

    #[test]
    fn test_chromosome() {
        assert!(Chromosome::from_genes(&[0; CHROMOSOME_SLOTS + 1]).is_none());
        let mut chromosome = Chromosome::from_genes(&[1, 2, 3]).unwrap();
        chromosome.genes_mut()[1] = 9;
        assert_eq!(chromosome.genes(), [1, 9, 3]);
        assert_eq!(chromosome.len(), 3);
        assert!(Chromosome::zeroed(0).is_empty());
    }
}
