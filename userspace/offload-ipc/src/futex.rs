// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared (non-private) futex operations on a word that may live in another
//! process's mapping.

use core::ptr;
use core::sync::atomic::AtomicU32;
use std::io;

/// Blocks while `*word == expected`. Returns `EAGAIN` if it already differs
/// and may return spuriously.
pub(crate) fn wait(word: &AtomicU32, expected: u32) -> io::Result<()> {
    // SAFETY: `word` is a valid, aligned 32-bit word for the call's duration;
    // a null timeout blocks indefinitely.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ptr::null::<libc::timespec>(),
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wakes up to `count` waiters blocked on `word`; returns how many woke.
pub(crate) fn wake(word: &AtomicU32, count: i32) -> io::Result<usize> {
    // SAFETY: `word` is a valid, aligned 32-bit word for the call's duration.
    let rc = unsafe { libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, count) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}
