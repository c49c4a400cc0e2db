//! Random sources for jitter.
//!
//! Jitter draws from a [`RandomSource`] instead of a global RNG so delay
//! calculation is deterministic under test.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

/// Uniform samples in `[0.0, 1.0)`.
pub trait RandomSource: Debug + Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local OS-seeded RNG. Default for production policies.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Reproducible RNG for simulations and tests.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen::<f64>()
    }
}

/// Always returns the same sample. Clamped into `[0.0, 1.0)`.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0.clamp(0.0, 1.0 - f64::EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_is_reproducible() {
        let a = SeededRandom::new(42);
        let b = SeededRandom::new(42);
        let xs: Vec<f64> = (0..16).map(|_| a.next_f64()).collect();
        let ys: Vec<f64> = (0..16).map(|_| b.next_f64()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_thread_random_in_range() {
        let rng = ThreadRandom;
        for _ in 0..1000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v), "sample {v} out of range");
        }
    }

    #[test]
    fn test_fixed_is_clamped() {
        assert!(FixedRandom(1.0).next_f64() < 1.0);
        assert_eq!(FixedRandom(-3.0).next_f64(), 0.0);
    }
}
