//! Process-wide seeded randomness service.
//!
//! A single mutex-guarded `StdRng` backs every random decision in the
//! simulator (latencies, response lengths, dataset picks, tool arguments,
//! ids) so that a fixed seed makes a run fully reproducible.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::distributions::uniform::{SampleRange, SampleUniform};
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use rand_distr::{Distribution, Normal};

#[derive(Clone)]
pub struct Rng {
    inner: Arc<Mutex<StdRng>>,
}

impl Rng {
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Seed to use when the config does not provide one.
    pub fn nanos_seed() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
            .unwrap_or(0)
    }

    pub fn int_in<T, R>(&self, range: R) -> T
    where
        T: SampleUniform,
        R: SampleRange<T>,
    {
        self.lock().gen_range(range)
    }

    pub fn float_in(&self, lo: f64, hi: f64) -> f64 {
        if lo >= hi {
            return lo;
        }
        self.lock().gen_range(lo..hi)
    }

    /// Bernoulli draw with `percent` in 0..=100.
    pub fn probability(&self, percent: u32) -> bool {
        match percent {
            0 => false,
            p if p >= 100 => true,
            p => self.lock().gen_bool(p as f64 / 100.0),
        }
    }

    pub fn coin_flip(&self) -> bool {
        self.lock().gen_bool(0.5)
    }

    pub fn pick<'a, T>(&self, items: &'a [T]) -> &'a T {
        &items[self.int_in(0..items.len())]
    }

    /// Version-4 UUID built from PRNG bytes so ids are seed-deterministic.
    pub fn uuid(&self) -> String {
        let mut bytes = [0u8; 16];
        self.lock().fill(&mut bytes);
        uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string()
    }

    /// Ten-digit numeric suffix for tool-call ids.
    pub fn ten_digits(&self) -> String {
        format!("{:010}", self.int_in(0u64..10_000_000_000))
    }

    /// Normal draw clamped to `[0.3 * mean, 1.7 * mean]`, rounded to whole
    /// milliseconds. A zero standard deviation returns the mean unchanged.
    pub fn clamped_normal_ms(&self, mean: f64, std_dev: f64) -> u64 {
        if mean <= 0.0 {
            return 0;
        }
        if std_dev <= 0.0 {
            return mean.round() as u64;
        }
        let sample = self.normal(mean, std_dev);
        sample.clamp(0.3 * mean, 1.7 * mean).round() as u64
    }

    /// Normal draw clamped to an explicit `[lo, hi]` support.
    pub fn normal_in(&self, mean: f64, std_dev: f64, lo: f64, hi: f64) -> f64 {
        if std_dev <= 0.0 {
            return mean.clamp(lo, hi);
        }
        self.normal(mean, std_dev).clamp(lo, hi)
    }

    fn normal(&self, mean: f64, std_dev: f64) -> f64 {
        // Normal::new only fails on a non-finite or negative std_dev,
        // which the callers above already exclude.
        let dist = Normal::new(mean, std_dev).unwrap_or(Normal::new(mean, 1.0).unwrap());
        dist.sample(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
