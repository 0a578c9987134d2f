// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Channel configuration.
//!
//! Both peers of a channel must agree on the rendezvous id, suffix and
//! capacity. The configuration is either built in code or loaded from TOML:
//!
//! ```toml
//! rendezvous_id = 4242
//! suffix = "_requests"
//! capacity = 16
//!
//! [backoff]
//! spin_limit = 4
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use offload_shm::ShmName;
use serde::Deserialize;

use crate::backoff::BackoffConfig;
use crate::header::check_capacity;
use crate::{Error, Result};

const DEFAULT_CAPACITY: usize = 1024;
const DEFAULT_SEQLOCK_RETRIES: u32 = 16;

/// Parameters shared by the two ends of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Key exchanged out of band, usually the owner's pid.
    pub rendezvous_id: u32,
    /// Appended to every object name of this channel.
    #[serde(default)]
    pub suffix: String,
    /// Ring slots.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Contended reads a seqlock consumer retries before reporting nothing.
    #[serde(default = "default_seqlock_retries")]
    pub seqlock_retries: u32,
    /// Producer wait policy.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_seqlock_retries() -> u32 {
    DEFAULT_SEQLOCK_RETRIES
}

impl ChannelConfig {
    /// Defaults for everything but the rendezvous id.
    pub fn new(rendezvous_id: u32) -> Self {
        Self {
            rendezvous_id,
            suffix: String::new(),
            capacity: DEFAULT_CAPACITY,
            seqlock_retries: DEFAULT_SEQLOCK_RETRIES,
            backoff: BackoffConfig::default(),
        }
    }

    /// Sets the ring capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the name suffix.
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Sets the producer wait policy.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets how often a seqlock consumer retries a contended read.
    pub fn with_seqlock_retries(mut self, retries: u32) -> Self {
        self.seqlock_retries = retries;
        self
    }

    /// `<purpose>_uid{<rendezvous_id>}<suffix>`.
    pub fn name(&self, purpose: &str) -> ShmName {
        ShmName::new(purpose, self.rendezvous_id).with_suffix(&self.suffix)
    }

    /// Checks the capacity against a ring's indexing rules.
    pub fn validate_capacity(&self, power_of_two: bool) -> Result<()> {
        check_capacity(self.capacity, power_of_two)
    }

    /// Parses a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        parse(input, PathBuf::from("<inline>"))
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = fs::read_to_string(path)
            .map_err(|source| Error::ConfigRead { path: path.to_path_buf(), source })?;
        parse(&input, path.to_path_buf())
    }
}

fn parse(input: &str, path: PathBuf) -> Result<ChannelConfig> {
    let config: ChannelConfig =
        toml::from_str(input).map_err(|source| Error::ConfigParse { path, source })?;
    config.validate_capacity(false)?;
    Ok(config)
}
