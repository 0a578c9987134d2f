// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Queue metadata and slot cells shared by every ring flavour.

use core::cell::UnsafeCell;
use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::debug;
use offload_shm::{ShmName, ShmSafe};

use crate::{invalid, Record, Result};

const QUEUE_MAGIC: u32 = 0x4f46_4c51;
const LAYOUT_VERSION: u32 = 1;

/// Ring flavour recorded in the header so peers cannot mix them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum QueueKind {
    SpscMasked = 1,
    SpscModulo = 2,
    SeqLock = 3,
    Mpsc = 4,
}

/// What a handle expects the shared ring to look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Shape {
    pub kind: QueueKind,
    pub capacity: usize,
    pub record_size: usize,
    pub record_align: usize,
}

impl Shape {
    pub(crate) fn of<T>(kind: QueueKind, capacity: usize) -> Self {
        Self { kind, capacity, record_size: size_of::<T>(), record_align: align_of::<T>() }
    }
}

/// Self-description written by the owner once the ring is initialized.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct QueueMeta {
    magic: AtomicU32,
    version: AtomicU32,
    kind: AtomicU32,
    record_align: AtomicU32,
    record_size: AtomicU64,
    capacity: AtomicU64,
}

// SAFETY: repr(C) atomics only.
unsafe impl ShmSafe for QueueMeta {}

impl QueueMeta {
    /// Records `shape`, then publishes the magic. Everything the owner
    /// initialized before this call is visible to a peer that sees the magic.
    pub(crate) fn publish(&self, shape: Shape) {
        self.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        self.kind.store(shape.kind as u32, Ordering::Relaxed);
        self.record_align.store(shape.record_align as u32, Ordering::Relaxed);
        self.record_size.store(shape.record_size as u64, Ordering::Relaxed);
        self.capacity.store(shape.capacity as u64, Ordering::Relaxed);
        self.magic.store(QUEUE_MAGIC, Ordering::Release);
    }

    pub(crate) fn is_published(&self) -> bool {
        self.magic.load(Ordering::Acquire) == QUEUE_MAGIC
    }

    /// Compares a published header with `shape`. An unpublished header means
    /// the owner has not finished yet and is accepted as is.
    pub(crate) fn verify(&self, shape: Shape, name: &ShmName) -> Result<()> {
        if !self.is_published() {
            debug!("offload-ipc: {name} not yet initialized by its owner");
            return Ok(());
        }
        let version = self.version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(invalid(format!("{name}: layout version {version}, expected {LAYOUT_VERSION}")));
        }
        let kind = self.kind.load(Ordering::Relaxed);
        if kind != shape.kind as u32 {
            return Err(invalid(format!("{name}: queue kind {kind}, expected {:?}", shape.kind)));
        }
        let capacity = self.capacity.load(Ordering::Relaxed);
        if capacity != shape.capacity as u64 {
            return Err(invalid(format!("{name}: capacity {capacity}, expected {}", shape.capacity)));
        }
        let size = self.record_size.load(Ordering::Relaxed);
        let align = self.record_align.load(Ordering::Relaxed);
        if size != shape.record_size as u64 || align != shape.record_align as u32 {
            return Err(invalid(format!(
                "{name}: record {size}B/{align}, expected {}B/{}",
                shape.record_size, shape.record_align
            )));
        }
        Ok(())
    }
}

/// One record cell. Exclusive access is arbitrated by the ring indices or the
/// per-slot sequence, never by the cell itself.
#[repr(transparent)]
pub(crate) struct Slot<T>(UnsafeCell<T>);

// SAFETY: every access goes through the ring protocol, which hands a slot to
// one side at a time.
unsafe impl<T: Record> Sync for Slot<T> {}
// SAFETY: transparent over a cell holding plain data.
unsafe impl<T: Record> ShmSafe for Slot<T> {}

impl<T: Record> Slot<T> {
    /// # Safety
    /// The caller must own the slot under the ring protocol.
    pub(crate) unsafe fn write(&self, item: T) {
        self.0.get().write(item)
    }

    /// # Safety
    /// The slot must hold a published record owned by the caller.
    pub(crate) unsafe fn read(&self) -> T {
        self.0.get().read()
    }

    /// # Safety
    /// As `write`; used where a concurrent reader validates afterwards.
    pub(crate) unsafe fn write_volatile(&self, item: T) {
        self.0.get().write_volatile(item)
    }

    /// # Safety
    /// The result may be torn and must be validated before use.
    pub(crate) unsafe fn read_volatile(&self) -> T {
        self.0.get().read_volatile()
    }
}

pub(crate) fn check_capacity(capacity: usize, power_of_two: bool) -> Result<()> {
    if capacity < 2 {
        return Err(invalid(format!("capacity {capacity} is below the minimum of 2")));
    }
    if power_of_two && !capacity.is_power_of_two() {
        return Err(invalid(format!("capacity {capacity} is not a power of two")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn meta() -> QueueMeta {
        QueueMeta {
            magic: AtomicU32::new(0),
            version: AtomicU32::new(0),
            kind: AtomicU32::new(0),
            record_align: AtomicU32::new(0),
            record_size: AtomicU64::new(0),
            capacity: AtomicU64::new(0),
        }
    }

    #[test]
    fn unpublished_header_is_accepted() {
        let name = ShmName::from_raw("meta_test");
        meta().verify(Shape::of::<u32>(QueueKind::Mpsc, 8), &name).expect("owner still initializing");
    }

    #[test]
    fn published_header_must_match() {
        let name = ShmName::from_raw("meta_test");
        let m = meta();
        m.publish(Shape::of::<u32>(QueueKind::SpscMasked, 8));
        m.verify(Shape::of::<u32>(QueueKind::SpscMasked, 8), &name).expect("same shape");
        for other in [
            Shape::of::<u32>(QueueKind::SpscModulo, 8),
            Shape::of::<u32>(QueueKind::SpscMasked, 16),
            Shape::of::<u64>(QueueKind::SpscMasked, 8),
        ] {
            assert!(matches!(m.verify(other, &name), Err(Error::InvalidConfiguration(_))));
        }
    }

    #[test]
    fn capacity_rules() {
        assert!(check_capacity(0, false).is_err());
        assert!(check_capacity(1, false).is_err());
        assert!(check_capacity(2, true).is_ok());
        assert!(check_capacity(5, false).is_ok());
        assert!(matches!(check_capacity(6, true), Err(Error::InvalidConfiguration(msg)) if msg.contains("power of two")));
    }
}
