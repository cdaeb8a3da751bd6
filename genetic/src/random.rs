//! Fallible draws from a random source.
//!
//! Every draw goes through [RngCore::try_fill_bytes], so a source that cannot produce
//! randomness surfaces as [Error::RandomSourceFailure] instead of a panic.

use crate::Error;
use rand::RngCore;

/// Draw a uniformly distributed `u64`.
pub fn rand_u64(rng: &mut impl RngCore) -> Result<u64, Error> {
    let mut bytes = [0u8; 8];
    rng.try_fill_bytes(&mut bytes)
        .map_err(|_| Error::RandomSourceFailure)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Draw a uniformly distributed integer in `[0, n)`.
///
/// Draws that would bias the result towards small values are rejected and redrawn.
pub fn rand_range(rng: &mut impl RngCore, n: usize) -> Result<usize, Error> {
    if n == 0 {
        return Err(Error::EmptyRange);
    }
    let n = n as u64;
    let zone = u64::MAX - (u64::MAX - n + 1) % n;
    loop {
        let value = rand_u64(rng)?;
        if value <= zone {
            return Ok((value % n) as usize);
        }
    }
}

/// Draw a uniformly distributed float in `[0, 1)`.
pub fn rand_unit(rng: &mut impl RngCore) -> Result<f64, Error> {
    Ok((rand_u64(rng)? >> 11) as f64 / (1u64 << 53) as f64)
}

/// Return true with probability `p`.
pub fn chance(rng: &mut impl RngCore, p: f64) -> Result<bool, Error> {
    Ok(rand_unit(rng)? < p)
}
