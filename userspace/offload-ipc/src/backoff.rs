// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Spin, then yield, then sleep.
//!
//! Used by MPSC producers waiting for their claimed slot and available to
//! callers that poll a queue.

use std::thread;
use std::time::Duration;

use serde::Deserialize;

const MAX_SPIN_SHIFT: u32 = 16;

/// Escalation thresholds for [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    /// Rounds of exponential busy-spinning (round `n` issues `2^n` hints).
    pub spin_limit: u32,
    /// Round after which yielding gives way to sleeping.
    pub yield_limit: u32,
    /// Sleep per round once past `yield_limit`, in microseconds.
    pub sleep_us: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { spin_limit: 6, yield_limit: 10, sleep_us: 50 }
    }
}

impl BackoffConfig {
    /// Never sleeps or yields; for latency benchmarks on dedicated cores.
    pub const fn spin_only() -> Self {
        Self { spin_limit: u32::MAX, yield_limit: u32::MAX, sleep_us: 0 }
    }
}

/// Escalating wait state for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    step: u32,
}

impl Backoff {
    /// Starts at the first spin round.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, step: 0 }
    }

    /// Waits a little longer than last time.
    pub fn snooze(&mut self) {
        if self.step <= self.config.spin_limit {
            for _ in 0..1u32 << self.step.min(MAX_SPIN_SHIFT) {
                core::hint::spin_loop();
            }
        } else if self.step <= self.config.yield_limit {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(self.config.sleep_us));
            return;
        }
        self.step = self.step.saturating_add(1);
    }

    /// Returns to the first spin round after progress was made.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Whether further snoozes sleep.
    pub fn is_sleeping(&self) -> bool {
        self.step > self.config.spin_limit && self.step > self.config.yield_limit
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_to_sleep_and_resets() {
        let mut backoff = Backoff::new(BackoffConfig { spin_limit: 2, yield_limit: 4, sleep_us: 1 });
        for _ in 0..5 {
            assert!(!backoff.is_sleeping());
            backoff.snooze();
        }
        assert!(backoff.is_sleeping());
        backoff.snooze();
        assert!(backoff.is_sleeping());
        backoff.reset();
        assert!(!backoff.is_sleeping());
    }

    #[test]
    fn spin_only_never_sleeps() {
        let mut backoff = Backoff::new(BackoffConfig::spin_only());
        for _ in 0..40 {
            backoff.snooze();
        }
        assert!(!backoff.is_sleeping());
    }
}
