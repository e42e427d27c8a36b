//! Test RNGs: deterministic `DeterministicRng` implementations for tests.

use relaykit_core::rng::DeterministicRng;

fn scale(fraction: f64, min: u32, max: u32) -> u32 {
    if min >= max {
        return min;
    }
    let span = f64::from(max - min);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let offset = (fraction.clamp(0.0, 1.0) * span).round() as u32;
    min + offset
}

/// An RNG pinned to the bottom of every range: `min` for integers and `0.0`
/// for fractions. With jitter enabled this yields the shortest delays.
#[derive(Debug)]
pub struct MockRng;

impl DeterministicRng for MockRng {
    fn next_u32_range(&mut self, min: u32, _max: u32) -> u32 {
        min
    }

    fn next_f64(&mut self) -> f64 {
        0.0
    }
}

/// An RNG that always returns the same fraction.
#[derive(Debug, Clone, Copy)]
pub struct FixedRng(pub f64);

impl DeterministicRng for FixedRng {
    fn next_u32_range(&mut self, min: u32, max: u32) -> u32 {
        scale(self.0, min, max)
    }

    fn next_f64(&mut self) -> f64 {
        self.0
    }
}

/// An RNG that replays a list of fractions in `[0.0, 1.0)`, wrapping around
/// when exhausted. Integer draws map the fraction onto the requested range.
#[derive(Debug)]
pub struct SequenceRng {
    fractions: Vec<f64>,
    index: usize,
}

impl SequenceRng {
    /// Create a new `SequenceRng` replaying `fractions`.
    ///
    /// # Panics
    ///
    /// Panics if `fractions` is empty.
    #[must_use]
    pub fn new(fractions: Vec<f64>) -> Self {
        assert!(!fractions.is_empty(), "SequenceRng needs at least one value");
        Self {
            fractions,
            index: 0,
        }
    }
}

impl DeterministicRng for SequenceRng {
    fn next_u32_range(&mut self, min: u32, max: u32) -> u32 {
        let fraction = self.next_f64();
        scale(fraction, min, max)
    }

    fn next_f64(&mut self) -> f64 {
        let value = self.fractions[self.index % self.fractions.len()];
        self.index += 1;
        value
    }
}
