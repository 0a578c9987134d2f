// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cache line geometry.

use core::ops::{Deref, DerefMut};
use std::fs;

/// Line size baked into every shared layout. Peers must agree on it, so it is
/// a constant rather than the detected value.
pub const CACHE_LINE_SIZE: usize = 64;

const COHERENCY_LINE_SIZE: &str = "/sys/devices/system/cpu/cpu0/cache/index0/coherency_line_size";

/// Returns the L1 coherency line size reported by sysfs, or 64.
pub fn cache_line_size() -> usize {
    parse_line_size(fs::read_to_string(COHERENCY_LINE_SIZE).ok().as_deref())
}

fn parse_line_size(raw: Option<&str>) -> usize {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(CACHE_LINE_SIZE)
}

/// Rounds `bytes` up to a whole number of cache lines (at least one).
pub const fn round_up_to_cache_line(bytes: usize) -> usize {
    if bytes == 0 {
        return CACHE_LINE_SIZE;
    }
    bytes.div_ceil(CACHE_LINE_SIZE) * CACHE_LINE_SIZE
}

/// Places `T` on its own cache line.
#[derive(Debug, Default)]
#[repr(C, align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Wraps `value`.
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Unwraps the inner value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn padded_values_occupy_whole_lines() {
        assert_eq!(core::mem::align_of::<CachePadded<AtomicUsize>>(), CACHE_LINE_SIZE);
        assert_eq!(core::mem::size_of::<CachePadded<AtomicUsize>>(), CACHE_LINE_SIZE);
        assert_eq!(core::mem::size_of::<CachePadded<[u8; 65]>>(), 2 * CACHE_LINE_SIZE);
    }

    #[test]
    fn line_size_falls_back_on_garbage() {
        assert_eq!(parse_line_size(None), 64);
        assert_eq!(parse_line_size(Some("")), 64);
        assert_eq!(parse_line_size(Some("0\n")), 64);
        assert_eq!(parse_line_size(Some("128\n")), 128);
        assert!(cache_line_size() > 0);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up_to_cache_line(0), 64);
        assert_eq!(round_up_to_cache_line(1), 64);
        assert_eq!(round_up_to_cache_line(64), 64);
        assert_eq!(round_up_to_cache_line(65), 128);
    }
}
