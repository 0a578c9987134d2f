// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Deterministic, budgeted retry loops over non-blocking queue operations.
//!
//! Queue handles never block: `enqueue` reports full and `dequeue` reports
//! nothing ready. Callers that want to wait for progress wrap those attempts
//! here with an explicit time budget instead of spinning forever.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host, synthetic clock)

use core::time::Duration;
use std::time::Instant;

use crate::{Consumer, Error, Producer, Record, Result};

const SPIN_CHECK_MASK: usize = 0x7f; // check time every 128 attempts

/// Clock source used for budgeted loops.
pub trait Clock {
    /// Nanoseconds since an arbitrary fixed origin.
    fn now_ns(&self) -> u64;
    /// Lets other work make progress between attempts.
    fn yield_now(&self);
}

/// Clock backed by `std::time::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    start: Instant,
}

impl HostClock {
    /// Creates a clock whose origin is now.
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ns(&self) -> u64 {
        duration_to_ns(self.start.elapsed())
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

fn duration_to_ns(d: Duration) -> u64 {
    d.as_secs().saturating_mul(1_000_000_000).saturating_add(d.subsec_nanos() as u64)
}

/// Deadline `budget` from now on `clock`.
pub fn deadline_after(clock: &impl Clock, budget: Duration) -> u64 {
    clock.now_ns().saturating_add(duration_to_ns(budget))
}

/// Runs `attempt` until it yields a value or the deadline passes.
pub fn retry_until<T>(
    clock: &impl Clock,
    deadline_ns: u64,
    mut attempt: impl FnMut() -> Option<T>,
) -> Result<T> {
    let mut spins: usize = 0;
    loop {
        if let Some(value) = attempt() {
            return Ok(value);
        }
        if (spins & SPIN_CHECK_MASK) == 0 && clock.now_ns() >= deadline_ns {
            return Err(Error::Timeout);
        }
        clock.yield_now();
        spins = spins.wrapping_add(1);
    }
}

/// Runs `attempt` until it yields a value or `budget` elapses.
pub fn retry_budgeted<T>(
    clock: &impl Clock,
    budget: Duration,
    attempt: impl FnMut() -> Option<T>,
) -> Result<T> {
    let deadline_ns = deadline_after(clock, budget);
    retry_until(clock, deadline_ns, attempt)
}

/// Enqueues `item`, retrying while the ring is full, within `budget`.
pub fn enqueue_budgeted<T: Record>(
    clock: &impl Clock,
    producer: &impl Producer<T>,
    item: T,
    budget: Duration,
) -> Result<()> {
    retry_budgeted(clock, budget, || producer.enqueue(item).then_some(()))
}

/// Dequeues one item, retrying while nothing is ready, within `budget`.
pub fn dequeue_budgeted<T: Record>(
    clock: &impl Clock,
    consumer: &impl Consumer<T>,
    budget: Duration,
) -> Result<T> {
    retry_budgeted(clock, budget, || consumer.dequeue())
}
