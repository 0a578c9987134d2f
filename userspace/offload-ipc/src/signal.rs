// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Coalescing cross-process wake/wait signal
//!
//! One 32-bit word on its own cache line: 0 is idle, 1 is signaled.
//! `wake` flips 0 to 1 and wakes every blocked waiter; wakes that find the
//! word already signaled are dropped, so several wakes before a wait count
//! as one. `wait` consumes the signal by flipping 1 to 0 and otherwise blocks
//! in the kernel, re-checking after every return since futex waits may wake
//! spuriously.
//!
//! The waiter owns the region; the waker borrows it. There is no timeout: a
//! blocked waiter is released only by a wake or by process exit.

use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};
use offload_shm::name::SIGNAL_PURPOSE;
use offload_shm::{
    Borrower, CachePadded, InitMode, Owner, Role, SharedRegion, ShmName, TypedRegion,
    CACHE_LINE_SIZE,
};

use crate::config::ChannelConfig;
use crate::{ensure_lock_free, futex, Result};

const IDLE: u32 = 0;
const SIGNALED: u32 = 1;
const WAKE_ALL: i32 = i32::MAX;

type Word = CachePadded<AtomicU32>;

struct Signal<R: Role> {
    mem: TypedRegion<R, Word>,
}

impl<R: Role> Signal<R> {
    fn word(&self) -> &AtomicU32 {
        self.mem.header()
    }

    fn name(&self) -> &ShmName {
        self.mem.region().name()
    }

    fn is_idle(&self) -> bool {
        self.word().load(Ordering::Relaxed) == IDLE
    }
}

/// Blocking side of a signal; owns the shared word.
pub struct SignalWaiter {
    signal: Signal<Owner>,
}

/// Waking side of a signal; attaches to the waiter's word.
pub struct SignalWaker {
    signal: Signal<Borrower>,
}

impl SignalWaiter {
    /// Creates `futex_uid{<id>}<suffix>` in the idle state.
    pub fn create(config: &ChannelConfig) -> Result<Self> {
        ensure_lock_free()?;
        let name = config.name(SIGNAL_PURPOSE);
        let region = SharedRegion::create(&name, CACHE_LINE_SIZE, InitMode::Zero)?;
        let mem = TypedRegion::header_only(region)?;
        let signal = Signal { mem };
        signal.word().store(IDLE, Ordering::Release);
        debug!("offload-ipc: signal {name} created");
        Ok(Self { signal })
    }

    /// Blocks until a wake is pending, then consumes it.
    pub fn wait(&self) {
        let word = self.signal.word();
        loop {
            if word.compare_exchange(SIGNALED, IDLE, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                return;
            }
            if let Err(err) = futex::wait(word, IDLE) {
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                    _ => warn!("offload-ipc: futex wait on {} failed: {err}", self.signal.name()),
                }
            }
        }
    }

    /// Consumes a pending wake without blocking.
    pub fn try_wait(&self) -> bool {
        self.signal
            .word()
            .compare_exchange(SIGNALED, IDLE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Whether the word is idle, i.e. no wake is pending.
    pub fn is_idle(&self) -> bool {
        self.signal.is_idle()
    }

    /// Shared object name.
    pub fn name(&self) -> &ShmName {
        self.signal.name()
    }
}

impl SignalWaker {
    /// Attaches to the waiter's word.
    pub fn attach(config: &ChannelConfig) -> Result<Self> {
        ensure_lock_free()?;
        let name = config.name(SIGNAL_PURPOSE);
        let region = SharedRegion::attach(&name, CACHE_LINE_SIZE)?;
        let mem = TypedRegion::header_only(region)?;
        debug!("offload-ipc: signal {name} attached");
        Ok(Self { signal: Signal { mem } })
    }

    /// Signals the waiter. Returns `false` when a wake was already pending
    /// and this one coalesced into it.
    pub fn wake(&self) -> bool {
        let word = self.signal.word();
        if word.compare_exchange(IDLE, SIGNALED, Ordering::Release, Ordering::Relaxed).is_err() {
            return false;
        }
        if let Err(err) = futex::wake(word, WAKE_ALL) {
            warn!("offload-ipc: futex wake on {} failed: {err}", self.signal.name());
        }
        true
    }

    /// Whether the word is idle, i.e. the last wake has been consumed.
    pub fn is_idle(&self) -> bool {
        self.signal.is_idle()
    }

    /// Shared object name.
    pub fn name(&self) -> &ShmName {
        self.signal.name()
    }
}

impl core::fmt::Debug for SignalWaiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignalWaiter").field("name", self.name()).field("idle", &self.is_idle()).finish()
    }
}

impl core::fmt::Debug for SignalWaker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignalWaker").field("name", self.name()).field("idle", &self.is_idle()).finish()
    }
}
