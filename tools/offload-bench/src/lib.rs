// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Offload channel benchmark library
//! INTENT: Throughput and round-trip measurement of shared-memory channels
//! IDL (target): bench_channel(scenario, capacity), pump(tx, rx, count), drain(rx, count)
//! DEPS: offload-ipc (channels under test)
//! READINESS: Library; channels live in this process, no peer needed
//! TESTS: Pump moves every item; drain counts what it consumed

use std::sync::atomic::{AtomicU32, Ordering};

use offload_ipc::{ChannelConfig, Consumer, Producer, Record};

/// Channel config with a name no other benchmark of this process uses.
pub fn bench_channel(scenario: &str, capacity: usize) -> ChannelConfig {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    ChannelConfig::new(std::process::id())
        .with_suffix(format!("_bench_{scenario}_{n}"))
        .with_capacity(capacity)
}

/// Moves `count` copies of `item` through a ring from one thread, dequeuing
/// whenever the ring is full. Returns how many items came out.
pub fn pump<T: Record>(
    tx: &impl Producer<T>,
    rx: &impl Consumer<T>,
    item: T,
    count: u64,
) -> u64 {
    let mut received = 0;
    for _ in 0..count {
        while !tx.enqueue(item) {
            if rx.dequeue().is_some() {
                received += 1;
            }
        }
    }
    received + drain(rx, u64::MAX)
}

/// Dequeues until `limit` items were taken or nothing is ready.
pub fn drain<T: Record>(rx: &impl Consumer<T>, limit: u64) -> u64 {
    let mut taken = 0;
    while taken < limit && rx.dequeue().is_some() {
        taken += 1;
    }
    taken
}

/// Dequeues exactly `count` items, spinning while the ring is empty.
pub fn receive<T: Record>(rx: &impl Consumer<T>, count: u64) {
    let mut taken = 0;
    while taken < count {
        if rx.dequeue().is_some() {
            taken += 1;
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Enqueues `count` copies of `item`, spinning while the ring is full.
pub fn send<T: Record>(tx: &impl Producer<T>, item: T, count: u64) {
    for _ in 0..count {
        while !tx.enqueue(item) {
            std::hint::spin_loop();
        }
    }
}
