//! Response pacing: time-to-first-token, inter-token delay, and the
//! response-length chooser. All means scale with the current load factor.

use std::sync::Arc;
use std::time::Duration;

use sim_common::config::Config;

use crate::random::Rng;

/// Cumulative probability weights of the six response-length buckets.
const LENGTH_BUCKETS: [f64; 6] = [0.20, 0.30, 0.20, 0.05, 0.10, 0.15];
/// Fixed bucket width once max_tokens outgrows equal-width splitting.
const FIXED_BUCKET_WIDTH: usize = 20;
/// Index of the bucket that absorbs the remainder in fixed-width mode.
const FLEX_BUCKET: usize = 3;

/// Mean and bounds of the length draw when the request sets no maximum.
const UNLIMITED_MEAN: f64 = 40.0;
const UNLIMITED_STD_DEV: f64 = 20.0;
const UNLIMITED_MAX: f64 = 128.0;

#[derive(Clone)]
pub struct LatencyModel {
    cfg: Arc<Config>,
    rng: Rng,
}

impl LatencyModel {
    pub fn new(cfg: Arc<Config>, rng: Rng) -> Self {
        Self { cfg, rng }
    }

    /// Linear interpolation from 1 (idle) to `time_factor_under_load`
    /// (all workers busy). One running request is the idle baseline.
    fn load_factor(&self, running: i64) -> f64 {
        let s = self.cfg.max_num_seqs;
        let factor = self.cfg.time_factor_under_load;
        if s <= 1 || factor == 1.0 {
            return 1.0;
        }
        let running = running.max(1) as f64;
        1.0 + (factor - 1.0) * (running - 1.0) / (s as f64 - 1.0)
    }

    pub fn ttft(
        &self,
        running: i64,
        n_prompt_tokens: usize,
        n_cached_tokens: usize,
        do_remote_prefill: bool,
    ) -> Duration {
        let cfg = &self.cfg;
        let ms = if do_remote_prefill {
            if cfg.kv_cache_transfer_latency == 0 && cfg.kv_cache_transfer_latency_std_dev == 0 {
                let mean = (cfg.kv_cache_transfer_time_per_token * n_prompt_tokens as u64) as f64;
                self.rng
                    .clamped_normal_ms(mean, cfg.kv_cache_transfer_time_std_dev as f64)
            } else {
                self.rng.clamped_normal_ms(
                    cfg.kv_cache_transfer_latency as f64,
                    cfg.kv_cache_transfer_latency_std_dev as f64,
                )
            }
        } else if cfg.time_to_first_token == 0 && cfg.time_to_first_token_std_dev == 0 {
            let new_tokens = n_prompt_tokens.saturating_sub(n_cached_tokens) as u64;
            let mean = (cfg.prefill_overhead + new_tokens * cfg.prefill_time_per_token) as f64;
            self.rng
                .clamped_normal_ms(mean, cfg.prefill_time_std_dev as f64)
        } else {
            let mean = cfg.time_to_first_token as f64 * self.load_factor(running);
            self.rng
                .clamped_normal_ms(mean, cfg.time_to_first_token_std_dev as f64)
        };
        Duration::from_millis(ms)
    }

    pub fn inter_token(&self, running: i64) -> Duration {
        let mean = self.cfg.inter_token_latency as f64 * self.load_factor(running);
        let ms = self
            .rng
            .clamped_normal_ms(mean, self.cfg.inter_token_latency_std_dev as f64);
        Duration::from_millis(ms)
    }

    /// Number of completion tokens to produce for a request capped at
    /// `max_tokens`, drawn from the six-bucket histogram. The last bucket
    /// yields exactly `max_tokens`.
    pub fn length_by_histogram(&self, max_tokens: usize) -> usize {
        if max_tokens <= LENGTH_BUCKETS.len() {
            return self.rng.int_in(1..=max_tokens);
        }
        let bucket = self.pick_bucket();
        if bucket == LENGTH_BUCKETS.len() - 1 {
            return max_tokens;
        }
        let (lo, hi) = self.bucket_bounds(bucket, max_tokens);
        self.rng.int_in(lo..=hi)
    }

    fn pick_bucket(&self) -> usize {
        let r = self.rng.float_in(0.0, 1.0);
        let mut acc = 0.0;
        for (i, w) in LENGTH_BUCKETS.iter().enumerate() {
            acc += w;
            if r < acc {
                return i;
            }
        }
        LENGTH_BUCKETS.len() - 1
    }

    /// Bounds of a non-last bucket over `[1, max_tokens - 1]`: equal width
    /// while that range fits `5 * 20` tokens, otherwise fixed 20-wide
    /// buckets with the flex bucket absorbing the remainder.
    fn bucket_bounds(&self, bucket: usize, max_tokens: usize) -> (usize, usize) {
        let n = LENGTH_BUCKETS.len() - 1;
        let span = max_tokens - 1;
        if max_tokens <= FIXED_BUCKET_WIDTH * n + 1 {
            let width = span as f64 / n as f64;
            let lo = 1 + (bucket as f64 * width).round() as usize;
            let hi = (((bucket + 1) as f64 * width).round() as usize).max(lo);
            (lo.min(span), hi.min(span))
        } else {
            let flex = span - FIXED_BUCKET_WIDTH * (n - 1);
            let mut lo = 1;
            for i in 0..bucket {
                lo += if i == FLEX_BUCKET { flex } else { FIXED_BUCKET_WIDTH };
            }
            let width = if bucket == FLEX_BUCKET { flex } else { FIXED_BUCKET_WIDTH };
            (lo, lo + width - 1)
        }
    }

    /// Length draw for requests without any max-tokens cap.
    pub fn unlimited_length(&self) -> usize {
        self.rng
            .normal_in(UNLIMITED_MEAN, UNLIMITED_STD_DEV, 1.0, UNLIMITED_MAX)
            .round() as usize
    }
}
