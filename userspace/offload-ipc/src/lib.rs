// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-process offload channels over shared memory
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + property tests (host); cross-process tests in tests/offload_e2e
//!
//! PUBLIC API:
//!   - Producer / Consumer traits: role-split queue handles
//!   - spsc: SpscProducer / SpscConsumer (Masked or Modulo indexing)
//!   - seqlock: SeqLockProducer / SeqLockConsumer (optimistic reads)
//!   - mpsc: MpscProducer (Clone, Sync) / MpscConsumer
//!   - signal: SignalWaiter / SignalWaker (coalescing futex wake/wait)
//!   - ChannelConfig, Backoff, budget helpers
//!
//! ERROR CONDITIONS:
//!   - Error::Shm: region creation/attach failed
//!   - Error::InvalidConfiguration: bad capacity or mismatched peer layout
//!   - Error::PlatformUnsupported: atomics are not lock-free on this target
//!   - Error::ConfigRead / Error::ConfigParse: configuration file problems
//!   - Error::Timeout: budgeted retry expired
//!
//! Steady-state `enqueue`/`dequeue` never fail; full and empty are reported
//! through `bool` / `Option`.
//!
//! DEPENDENCIES:
//!   - offload-shm: named regions and typed views
//!   - libc: futex syscall
//!   - serde + toml: channel configuration

#![deny(clippy::all, missing_docs)]

pub mod backoff;
pub mod budget;
pub mod config;
mod futex;
mod header;
pub mod mpsc;
pub mod seqlock;
pub mod signal;
pub mod spsc;

pub use backoff::{Backoff, BackoffConfig};
pub use config::ChannelConfig;
pub use mpsc::{MpscConsumer, MpscProducer};
pub use offload_shm::{Borrower, Owner, ShmName, ShmRecord, ShmSafe};
pub use seqlock::{SeqLockConsumer, SeqLockProducer, SeqRead};
pub use signal::{SignalWaiter, SignalWaker};
pub use spsc::{Indexing, Masked, Modulo, SpscConsumer, SpscProducer};

use std::path::PathBuf;

/// Result alias for channel operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced while constructing channels or loading their configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backing shared-memory region could not be set up.
    #[error(transparent)]
    Shm(#[from] offload_shm::Error),
    /// Capacity or peer layout rejected at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The target cannot provide lock-free atomics of the needed width.
    #[error("platform unsupported: {0} atomics are not lock-free")]
    PlatformUnsupported(&'static str),
    /// A configuration file could not be read.
    #[error("failed to read channel config {path}: {source}")]
    ConfigRead {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A configuration file is not valid TOML for [`ChannelConfig`].
    #[error("failed to parse channel config {path}: {source}")]
    ConfigParse {
        /// File path, or `<inline>` for string input.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// A budgeted retry loop ran out of time.
    #[error("operation timed out")]
    Timeout,
}

/// Fixed-size, copyable element that can live in a shared ring.
pub trait Record: ShmRecord {}

impl<T: ShmRecord> Record for T {}

/// Sending half of a queue. Only producer handles implement it.
pub trait Producer<T: Record> {
    /// Appends `item`; returns `false` without side effects when full.
    fn enqueue(&self, item: T) -> bool;
    /// Number of slots in the ring.
    fn capacity(&self) -> usize;
}

/// Receiving half of a queue. Only consumer handles implement it.
pub trait Consumer<T: Record> {
    /// Removes the oldest item, or `None` when nothing is ready.
    fn dequeue(&self) -> Option<T>;
    /// Number of slots in the ring.
    fn capacity(&self) -> usize;
}

/// Fails with [`Error::PlatformUnsupported`] unless the target has native
/// 32-bit and pointer-width atomics.
pub fn ensure_lock_free() -> Result<()> {
    if !cfg!(target_has_atomic = "32") {
        return Err(Error::PlatformUnsupported("32-bit"));
    }
    if !cfg!(target_has_atomic = "ptr") {
        return Err(Error::PlatformUnsupported("pointer-width"));
    }
    Ok(())
}

pub(crate) fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfiguration(msg.into())
}
