//! Argument generation.

use crate::{
    catalog::ArgKind,
    population::Chromosome,
    random::{chance, rand_range, rand_u64},
    Error,
};
use rand::RngCore;

/// Produces raw argument values for a given [ArgKind].
pub trait Generator {
    fn generate(&mut self, kind: ArgKind) -> Result<u64, Error>;

    /// Fill every gene of `chromosome` with a value for the matching argument kind.
    fn fill(&mut self, kinds: &[ArgKind], chromosome: &mut Chromosome) -> Result<(), Error> {
        for (gene, kind) in chromosome.genes_mut().iter_mut().zip(kinds) {
            *gene = self.generate(*kind)?;
        }
        Ok(())
    }
}

/// Values that tend to sit on edges of kernel argument checks.
const INTERESTING: &[u64] = &[
    0,
    1,
    u64::MAX,
    i32::MAX as u64,
    i32::MIN as i64 as u64,
    i64::MAX as u64,
    i64::MIN as u64,
    u32::MAX as u64,
    0x7f,
    0x80,
    0xff,
    0x7fff,
    0x8000,
    0xffff,
];

const LENGTHS: &[u64] = &[0, 1, 8, 63, 64, 4095, 4096, 4097, 65536, u32::MAX as u64];

const ADDRESSES: &[u64] = &[
    0,
    1,
    0x1000,
    0x7fff_ffff_f000,
    0xffff_8000_0000_0000,
    u64::MAX,
];

/// Draws values from a random source, biased towards boundary values.
pub struct RandomGenerator<R: RngCore> {
    rng: R,
}

impl<R: RngCore> RandomGenerator<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    fn pick(&mut self, values: &[u64]) -> Result<u64, Error> {
        Ok(values[rand_range(&mut self.rng, values.len())?])
    }

    fn below(&mut self, bound: usize) -> Result<u64, Error> {
        Ok(rand_range(&mut self.rng, bound)? as u64)
    }
}

impl<R: RngCore> Generator for RandomGenerator<R> {
    fn generate(&mut self, kind: ArgKind) -> Result<u64, Error> {
        let boundary = chance(&mut self.rng, 0.25)?;
        match kind {
            ArgKind::Int if boundary => self.pick(INTERESTING),
            ArgKind::Int => rand_u64(&mut self.rng),
            ArgKind::Fd if boundary => self.pick(&[u64::MAX, 1024, i32::MAX as u64]),
            ArgKind::Fd => self.below(64),
            ArgKind::Len if boundary => self.pick(LENGTHS),
            ArgKind::Len => self.below(1 << 20),
            ArgKind::Flags if boundary => self.pick(&[0, u32::MAX as u64, u64::MAX]),
            ArgKind::Flags => {
                let mut flags = 0u64;
                for _ in 0..=self.below(4)? {
                    flags |= 1u64 << self.below(32)?;
                }
                Ok(flags)
            }
            ArgKind::Mode => Ok(rand_u64(&mut self.rng)? & 0o7777),
            ArgKind::Addr if boundary => self.pick(ADDRESSES),
            ArgKind::Addr => Ok(rand_u64(&mut self.rng)? & 0x7fff_ffff_f000),
            ArgKind::Signal => self.below(65),
            ArgKind::Pid if boundary => self.pick(&[0, 1, u64::MAX, i32::MAX as u64]),
            ArgKind::Pid => self.below(32768),
        }
    }
}
