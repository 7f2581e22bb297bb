//! Randomness for proposals.
//!
//! Every proposal draws through a [`RandomSource`] handed to it by the
//! sampler, so a chain is reproducible from its seed and independent chains
//! never share generator state.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Distribution as _;

use cyanea_stats::{Beta, Distribution};

/// Source of the draws and kernel densities proposals need.
pub trait RandomSource {
    /// Uniform draw on [0, 1).
    fn uniform01(&mut self) -> f64;

    /// Draw from Beta(a, b). Returns NaN if the shapes are invalid.
    fn beta_sample(&mut self, a: f64, b: f64) -> f64;

    /// Log density of Beta(a, b) at `x`; `-inf` outside the support or for
    /// invalid shapes.
    fn beta_ln_pdf(&self, a: f64, b: f64, x: f64) -> f64 {
        Beta::new(a, b).map_or(f64::NEG_INFINITY, |d| d.ln_pdf(x))
    }

    /// Beta(a, b) quantile at probability `p`; NaN for invalid arguments.
    fn beta_quantile(&self, a: f64, b: f64, p: f64) -> f64 {
        Beta::new(a, b)
            .and_then(|d| d.quantile(p))
            .unwrap_or(f64::NAN)
    }

    /// Uniform index in `0..n`. `n` must be positive.
    fn uniform_index(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        ((self.uniform01() * n as f64) as usize).min(n.saturating_sub(1))
    }
}

/// Seeded generator backed by [`StdRng`].
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for SeededRandom {
    fn uniform01(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    fn beta_sample(&mut self, a: f64, b: f64) -> f64 {
        match rand_distr::Beta::new(a, b) {
            Ok(d) => d.sample(&mut self.rng),
            Err(_) => f64::NAN,
        }
    }
}
