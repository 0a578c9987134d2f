// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-process harness for offload channel tests
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! The peer process is the test binary itself, re-executed with
//! `--exact <peer test>` and its parameters in environment variables. A peer
//! test returns immediately unless the environment names it, so it passes
//! trivially during a normal test run.

use std::env;
use std::io;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use offload_ipc::ChannelConfig;
use offload_shm::ShmRecord;

const PEER_ENV: &str = "OFFLOAD_E2E_PEER";
const RENDEZVOUS_ENV: &str = "OFFLOAD_E2E_RENDEZVOUS";
const SUFFIX_ENV: &str = "OFFLOAD_E2E_SUFFIX";
const CAPACITY_ENV: &str = "OFFLOAD_E2E_CAPACITY";
const COUNT_ENV: &str = "OFFLOAD_E2E_COUNT";
const TAG_ENV: &str = "OFFLOAD_E2E_TAG";

/// Upper bound for any single cross-process scenario.
pub const SCENARIO_BUDGET: Duration = Duration::from_secs(60);

/// Work descriptor tagged with its producer, as exchanged by offload peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct WorkItem {
    /// Producing peer.
    pub producer: u32,
    /// Position in that producer's stream.
    pub seq: u32,
}

// SAFETY: two plain integers, valid for any bit pattern.
unsafe impl ShmRecord for WorkItem {}

/// Parameters handed to a peer process.
#[derive(Debug, Clone)]
pub struct PeerArgs {
    /// Channel both processes open.
    pub channel: ChannelConfig,
    /// Items the peer produces or expects.
    pub count: u32,
    /// Peer identity, e.g. a producer id.
    pub tag: u32,
}

impl PeerArgs {
    /// Peer arguments for `channel`.
    pub fn new(channel: ChannelConfig, count: u32, tag: u32) -> Self {
        Self { channel, count, tag }
    }
}

/// Channel config whose names no other scenario of this process uses.
pub fn unique_channel(scenario: &str, capacity: usize) -> ChannelConfig {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    ChannelConfig::new(std::process::id())
        .with_suffix(format!("_e2e_{scenario}_{n}"))
        .with_capacity(capacity)
}

/// Returns the peer arguments when this process was spawned to run `test`.
pub fn peer_args(test: &str) -> Option<PeerArgs> {
    if env::var(PEER_ENV).ok()? != test {
        return None;
    }
    let number = |key: &str| env::var(key).ok().and_then(|v| v.parse::<u64>().ok());
    let rendezvous_id = u32::try_from(number(RENDEZVOUS_ENV)?).ok()?;
    let channel = ChannelConfig::new(rendezvous_id)
        .with_suffix(env::var(SUFFIX_ENV).ok()?)
        .with_capacity(usize::try_from(number(CAPACITY_ENV)?).ok()?);
    Some(PeerArgs {
        channel,
        count: u32::try_from(number(COUNT_ENV)?).ok()?,
        tag: u32::try_from(number(TAG_ENV)?).ok()?,
    })
}

/// Re-executes the current test binary, running only `test` as a peer.
pub fn spawn_peer(test: &str, args: &PeerArgs) -> io::Result<Child> {
    Command::new(env::current_exe()?)
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(PEER_ENV, test)
        .env(RENDEZVOUS_ENV, args.channel.rendezvous_id.to_string())
        .env(SUFFIX_ENV, &args.channel.suffix)
        .env(CAPACITY_ENV, args.channel.capacity.to_string())
        .env(COUNT_ENV, args.count.to_string())
        .env(TAG_ENV, args.tag.to_string())
        .spawn()
}

/// Waits for `child`, killing it once `budget` has passed.
pub fn wait_peer(mut child: Child, budget: Duration) -> io::Result<ExitStatus> {
    let deadline = Instant::now() + budget;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            child.kill()?;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "peer process did not finish"));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
