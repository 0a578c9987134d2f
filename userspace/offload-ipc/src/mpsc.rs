// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Multi-producer/single-consumer bounded ring over shared memory
//!
//! Every slot carries a sequence number initialized to its index. A producer
//! holding ticket `pos` may write slot `pos & mask` once its sequence equals
//! `pos`, and publishes it by storing `pos + 1`. The consumer takes the slot
//! when the sequence equals `dequeue_pos + 1` and hands it to the next lap by
//! storing `dequeue_pos + capacity`. All arithmetic wraps; capacity is a power
//! of two so the laps stay consistent across the wrap.
//!
//! Producers are `Clone + Sync`; any number of threads in any number of
//! processes may enqueue. Exactly one consumer may exist per ring.

use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use offload_shm::name::MPSC_PURPOSE;
use offload_shm::{
    Borrower, CachePadded, InitMode, Layout, Owner, Role, SharedRegion, ShmName, ShmSafe,
    TypedRegion,
};

use crate::backoff::{Backoff, BackoffConfig};
use crate::config::ChannelConfig;
use crate::header::{QueueKind, QueueMeta, Shape};
use crate::{ensure_lock_free, invalid, Consumer, Producer, Record, Result};

#[repr(C)]
struct MpscHeader {
    meta: CachePadded<QueueMeta>,
    enqueue_pos: CachePadded<AtomicUsize>,
    // Written by the consumer only.
    dequeue_pos: CachePadded<AtomicUsize>,
}

// SAFETY: repr(C) over shm-safe fields.
unsafe impl ShmSafe for MpscHeader {}

#[repr(C, align(64))]
struct Node<T> {
    sequence: AtomicUsize,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is accessed only by the holder of the matching sequence.
unsafe impl<T: Record> Sync for Node<T> {}
// SAFETY: repr(C) over an atomic and a cell holding plain data.
unsafe impl<T: Record> ShmSafe for Node<T> {}

impl<T: Record> Node<T> {
    /// # Safety
    /// The caller must hold the ticket this node's sequence admits.
    unsafe fn write(&self, item: T) {
        self.data.get().write(item)
    }

    /// # Safety
    /// The sequence must show a published record.
    unsafe fn read(&self) -> T {
        self.data.get().read()
    }
}

struct Ring<T: Record, R: Role> {
    mem: TypedRegion<R, MpscHeader, Node<T>>,
    mask: usize,
    backoff: BackoffConfig,
}

impl<T: Record, R: Role> Ring<T, R> {
    fn layout(config: &ChannelConfig) -> Result<(ShmName, usize, usize)> {
        ensure_lock_free()?;
        config.validate_capacity(true)?;
        let mut layout = Layout::of::<MpscHeader>();
        let offset = layout
            .append::<Node<T>>(config.capacity)
            .ok_or_else(|| invalid(format!("capacity {} overflows the address space", config.capacity)))?;
        Ok((config.name(MPSC_PURPOSE), offset, layout.size()))
    }

    fn map(region: SharedRegion<R>, offset: usize, config: &ChannelConfig) -> Result<Self> {
        let mem = TypedRegion::new(region, offset, config.capacity)?;
        Ok(Self { mem, mask: config.capacity - 1, backoff: config.backoff })
    }

    fn header(&self) -> &MpscHeader {
        self.mem.header()
    }

    fn node(&self, pos: usize) -> &Node<T> {
        &self.mem.slots()[pos & self.mask]
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn name(&self) -> &ShmName {
        self.mem.region().name()
    }
}

impl<T: Record> Ring<T, Owner> {
    fn create(config: &ChannelConfig) -> Result<Self> {
        let (name, offset, size) = Self::layout(config)?;
        let region = SharedRegion::create(&name, size, InitMode::Zero)?;
        let ring = Self::map(region, offset, config)?;
        for (index, node) in ring.mem.slots().iter().enumerate() {
            node.sequence.store(index, Ordering::Relaxed);
        }
        let header = ring.header();
        header.enqueue_pos.store(0, Ordering::Relaxed);
        header.dequeue_pos.store(0, Ordering::Relaxed);
        header.meta.publish(Shape::of::<T>(QueueKind::Mpsc, config.capacity));
        debug!("offload-ipc: mpsc {name} created (capacity {})", config.capacity);
        Ok(ring)
    }
}

impl<T: Record> Ring<T, Borrower> {
    fn attach(config: &ChannelConfig) -> Result<Self> {
        let (name, offset, size) = Self::layout(config)?;
        let region = SharedRegion::attach(&name, size)?;
        let ring = Self::map(region, offset, config)?;
        ring.header().meta.verify(Shape::of::<T>(QueueKind::Mpsc, config.capacity), &name)?;
        debug!("offload-ipc: mpsc {name} attached (capacity {})", config.capacity);
        Ok(ring)
    }
}

/// Writing end of an MPSC ring. Clones share one mapping.
pub struct MpscProducer<T: Record, R: Role = Borrower> {
    ring: Arc<Ring<T, R>>,
}

/// Reading end of an MPSC ring. Movable between threads, never shared.
pub struct MpscConsumer<T: Record, R: Role = Owner> {
    ring: Ring<T, R>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Record> MpscConsumer<T, Owner> {
    /// Creates the ring and becomes its owner.
    pub fn create(config: &ChannelConfig) -> Result<Self> {
        Ring::create(config).map(|ring| Self { ring, _not_sync: PhantomData })
    }
}

impl<T: Record> MpscConsumer<T, Borrower> {
    /// Attaches to a ring owned by a producer.
    pub fn attach(config: &ChannelConfig) -> Result<Self> {
        Ring::attach(config).map(|ring| Self { ring, _not_sync: PhantomData })
    }
}

impl<T: Record> MpscProducer<T, Borrower> {
    /// Attaches to a ring owned by the consumer.
    pub fn attach(config: &ChannelConfig) -> Result<Self> {
        Ring::attach(config).map(|ring| Self { ring: Arc::new(ring) })
    }
}

impl<T: Record> MpscProducer<T, Owner> {
    /// Creates the ring and becomes its owner. The name is removed once the
    /// last clone is dropped.
    pub fn create(config: &ChannelConfig) -> Result<Self> {
        Ring::create(config).map(|ring| Self { ring: Arc::new(ring) })
    }
}

impl<T: Record, R: Role> Clone for MpscProducer<T, R> {
    fn clone(&self) -> Self {
        Self { ring: Arc::clone(&self.ring) }
    }
}

impl<T: Record, R: Role> MpscProducer<T, R> {
    /// Shared object name.
    pub fn name(&self) -> &ShmName {
        self.ring.name()
    }

    /// Claims the next ticket and waits, with backoff, until its slot is free.
    ///
    /// Never fails: a claimed ticket must be filled or the consumer stalls on
    /// it, so a full ring makes this call wait for the consumer.
    pub fn enqueue_blocking(&self, item: T) {
        let ring = &*self.ring;
        let pos = ring.header().enqueue_pos.fetch_add(1, Ordering::Relaxed);
        let node = ring.node(pos);
        let mut backoff = Backoff::new(ring.backoff);
        while node.sequence.load(Ordering::Acquire) != pos {
            backoff.snooze();
        }
        // SAFETY: the sequence admits ticket `pos`, which only this call holds.
        unsafe { node.write(item) };
        node.sequence.store(pos.wrapping_add(1), Ordering::Release);
    }

    /// Claims a ticket only if its slot is free; `false` when full.
    pub fn try_enqueue(&self, item: T) -> bool {
        let header = self.ring.header();
        let mut pos = header.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let node = self.ring.node(pos);
            let seq = node.sequence.load(Ordering::Acquire);
            let lag = seq.wrapping_sub(pos) as isize;
            if lag == 0 {
                match header.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the successful claim makes ticket `pos` ours.
                        unsafe { node.write(item) };
                        node.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                return false;
            } else {
                pos = header.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T: Record, R: Role> MpscConsumer<T, R> {
    /// Shared object name.
    pub fn name(&self) -> &ShmName {
        self.ring.name()
    }
}

impl<T: Record, R: Role> Producer<T> for MpscProducer<T, R> {
    fn enqueue(&self, item: T) -> bool {
        self.try_enqueue(item)
    }

    fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T: Record, R: Role> Consumer<T> for MpscConsumer<T, R> {
    fn dequeue(&self) -> Option<T> {
        let header = self.ring.header();
        let pos = header.dequeue_pos.load(Ordering::Relaxed);
        let node = self.ring.node(pos);
        if node.sequence.load(Ordering::Acquire) != pos.wrapping_add(1) {
            return None;
        }
        // SAFETY: the acquire load saw the producer's publication of `pos`.
        let item = unsafe { node.read() };
        node.sequence.store(pos.wrapping_add(self.ring.capacity()), Ordering::Release);
        header.dequeue_pos.store(pos.wrapping_add(1), Ordering::Relaxed);
        Some(item)
    }

    fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T: Record, R: Role> core::fmt::Debug for MpscProducer<T, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MpscProducer").field("name", self.name()).field("role", &R::LABEL).finish()
    }
}

impl<T: Record, R: Role> core::fmt::Debug for MpscConsumer<T, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MpscConsumer").field("name", self.name()).field("role", &R::LABEL).finish()
    }
}
