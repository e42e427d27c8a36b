//! Random number generator abstraction for determinism.
//!
//! Backoff and TTL jitter draw from this trait. In production it wraps a real
//! RNG; tests inject a seeded or scripted implementation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Abstraction over random number generation.
pub trait DeterministicRng: Send + Sync {
    /// Generate a random `u32` in the range `[min, max]` inclusive.
    fn next_u32_range(&mut self, min: u32, max: u32) -> u32;

    /// Generate a random `f64` in `[0.0, 1.0)`.
    fn next_f64(&mut self) -> f64;
}

/// Production RNG seeded from the operating system.
#[derive(Debug)]
pub struct SystemRng(StdRng);

impl SystemRng {
    /// Creates a new OS-seeded RNG.
    #[must_use]
    pub fn new() -> Self {
        Self(StdRng::from_os_rng())
    }

    /// Creates an RNG from a fixed seed, for reproducible runs.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl Default for SystemRng {
    fn default() -> Self {
        Self::new()
    }
}

impl DeterministicRng for SystemRng {
    fn next_u32_range(&mut self, min: u32, max: u32) -> u32 {
        if min >= max {
            return min;
        }
        self.0.random_range(min..=max)
    }

    fn next_f64(&mut self) -> f64 {
        self.0.random::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_u32_range_stays_in_bounds() {
        let mut rng = SystemRng::seeded(7);
        for _ in 0..1_000 {
            let v = rng.next_u32_range(3, 9);
            assert!((3..=9).contains(&v));
        }
    }

    #[test]
    fn test_next_u32_range_degenerate_range_returns_min() {
        let mut rng = SystemRng::seeded(7);
        assert_eq!(rng.next_u32_range(5, 5), 5);
        assert_eq!(rng.next_u32_range(6, 2), 6);
    }

    #[test]
    fn test_next_f64_is_unit_interval() {
        let mut rng = SystemRng::seeded(11);
        for _ in 0..1_000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = SystemRng::seeded(42);
        let mut b = SystemRng::seeded(42);
        for _ in 0..10 {
            assert_eq!(a.next_u32_range(0, 1_000), b.next_u32_range(0, 1_000));
        }
    }
}
