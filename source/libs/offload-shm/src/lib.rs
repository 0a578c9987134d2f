// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Named shared-memory regions for cross-process offload channels
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host, Linux `/dev/shm`)
//!
//! PUBLIC API:
//!   - SharedRegion<Owner|Borrower>: create/attach, unmap on drop, unlink (Owner only)
//!   - ShmName: `<purpose>_uid{<id>}<suffix>` rendezvous names
//!   - ShmSafe, Layout, TypedRegion: validated typed views into a mapping
//!   - ShmRecord, SharedRegion::read: volatile copies of plain data
//!   - CachePadded, cache_line_size(): false-sharing avoidance
//!
//! ERROR CONDITIONS:
//!   - Error::ResourceCreation: shm_open/ftruncate/fstat/mmap failed (carries errno)
//!   - Error::InvalidName / Error::InvalidSize: request rejected before any syscall
//!   - Error::RegionTooSmall: borrower found an object smaller than requested
//!   - Error::OutOfBounds / Error::Misaligned: typed view rejected
//!
//! DEPENDENCIES:
//!   - libc: shm_open, ftruncate, mmap, munmap, shm_unlink
//!   - log: lifecycle tracing

#![deny(clippy::all, missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("offload-shm: only Linux shared memory (/dev/shm) is supported");

pub mod cache;
pub mod layout;
pub mod name;
pub mod region;

pub use cache::{cache_line_size, round_up_to_cache_line, CachePadded, CACHE_LINE_SIZE};
pub use layout::{Layout, ShmRecord, ShmSafe, TypedRegion};
pub use name::ShmName;
pub use region::{Borrower, InitMode, Owner, Role, SharedRegion};

use std::io;

/// Result alias for shared-memory operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced while creating, attaching or viewing a shared region.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An OS call needed to back the region failed.
    #[error("{op} failed for shared memory object {name}: {source}")]
    ResourceCreation {
        /// The failing call (`shm_open`, `ftruncate`, `fstat`, `mmap`).
        op: &'static str,
        /// Object name without the leading slash.
        name: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The object name cannot be used in the POSIX shared-memory namespace.
    #[error("invalid shared memory name {name:?}: {reason}")]
    InvalidName {
        /// Rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// A zero-byte region was requested.
    #[error("shared memory object {name} requested with zero size")]
    InvalidSize {
        /// Object name.
        name: String,
    },
    /// A borrower attached to an object smaller than the layout it expects.
    #[error("shared memory object {name} is {actual} bytes, expected at least {expected}")]
    RegionTooSmall {
        /// Object name.
        name: String,
        /// Bytes the caller needs.
        expected: usize,
        /// Bytes established by the owner.
        actual: usize,
    },
    /// A typed view would extend past the end of the mapping.
    #[error("view of {len} bytes at offset {offset} exceeds region {name} ({size} bytes)")]
    OutOfBounds {
        /// Object name.
        name: String,
        /// Requested offset.
        offset: usize,
        /// Requested byte length.
        len: usize,
        /// Mapping size.
        size: usize,
    },
    /// A typed view would start at an address not aligned for its element type.
    #[error("view at offset {offset} of region {name} is not aligned to {align} bytes")]
    Misaligned {
        /// Object name.
        name: String,
        /// Requested offset.
        offset: usize,
        /// Required alignment.
        align: usize,
    },
}

impl Error {
    /// Returns the raw OS error code for resource failures.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            Error::ResourceCreation { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn os(op: &'static str, name: &str) -> Self {
        Error::ResourceCreation { op, name: name.to_owned(), source: io::Error::last_os_error() }
    }
}
