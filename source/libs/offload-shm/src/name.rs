// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous names for shared objects.
//!
//! Two processes agree on an object by exchanging a numeric id out of band
//! (typically a pid) and rendering it with the same purpose and suffix:
//! `futex_uid{1234}`, `spsc_queue_buffer_uid{1234}_req`, `mat_buff_uid{1234}_k{0}`.

use std::fmt;

use crate::{Error, Result};

/// Longest name accepted by `shm_open` on Linux (`NAME_MAX`).
pub const MAX_NAME_LEN: usize = 255;

/// Purpose prefix of cross-process signal words.
pub const SIGNAL_PURPOSE: &str = "futex";
/// Purpose prefix of SPSC ring buffers.
pub const SPSC_PURPOSE: &str = "spsc_queue_buffer";
/// Purpose prefix of sequence-lock SPSC ring buffers.
pub const SEQLOCK_PURPOSE: &str = "spsc_seqlock_buffer";
/// Purpose prefix of MPSC ring buffers.
pub const MPSC_PURPOSE: &str = "mpsc_queue";
/// Purpose prefix of bulk data buffers handed between offload peers.
pub const BUFFER_PURPOSE: &str = "mat_buff";

/// Name of a shared-memory object, without the leading `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmName(String);

impl ShmName {
    /// Renders `<purpose>_uid{<rendezvous_id>}`.
    pub fn new(purpose: &str, rendezvous_id: u32) -> Self {
        Self(format!("{purpose}_uid{{{rendezvous_id}}}"))
    }

    /// Wraps a fully formatted name.
    pub fn from_raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Appends `_k{<index>}`, used when one peer owns several buffers.
    pub fn with_index(mut self, index: u32) -> Self {
        self.0.push_str(&format!("_k{{{index}}}"));
        self
    }

    /// Appends the role suffix verbatim.
    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.0.push_str(suffix);
        self
    }

    /// Returns the name as passed between processes.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path under which Linux exposes the object.
    pub fn dev_shm_path(&self) -> std::path::PathBuf {
        std::path::Path::new("/dev/shm").join(&self.0)
    }

    /// Checks the name is usable with `shm_open`.
    pub fn validate(&self) -> Result<()> {
        let reason = if self.0.is_empty() {
            Some("empty")
        } else if self.0.contains('/') {
            Some("contains '/'")
        } else if self.0.contains('\0') {
            Some("contains NUL")
        } else if self.0.len() > MAX_NAME_LEN {
            Some("longer than NAME_MAX")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(Error::InvalidName { name: self.0.clone(), reason }),
            None => Ok(()),
        }
    }

    /// Name in the form expected by `shm_open` and `shm_unlink`.
    pub(crate) fn to_c_path(&self) -> Result<std::ffi::CString> {
        self.validate()?;
        std::ffi::CString::new(format!("/{}", self.0))
            .map_err(|_| Error::InvalidName { name: self.0.clone(), reason: "contains NUL" })
    }
}

impl fmt::Display for ShmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ShmName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
