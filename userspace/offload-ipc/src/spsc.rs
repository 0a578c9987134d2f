// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Single-producer/single-consumer bounded ring over shared memory
//!
//! The producer owns `head`, the consumer owns `tail`; each is published with
//! a release store and observed with an acquire load, which also publishes
//! the slot written (or read) before it. One slot stays empty to tell a full
//! ring from an empty one, so `capacity - 1` records fit.
//!
//! Indexing is a type parameter: [`Masked`] (power-of-two capacity, `& mask`)
//! or [`Modulo`] (any capacity >= 2, `% capacity`).
//!
//! TEST_COVERAGE: ordering, full/empty, layout mismatch, two-thread stress,
//! model-based property test against `VecDeque`.

use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error};
use offload_shm::name::SPSC_PURPOSE;
use offload_shm::{
    Borrower, CachePadded, InitMode, Layout, Owner, Role, SharedRegion, ShmName, ShmSafe,
    TypedRegion,
};

use crate::config::ChannelConfig;
use crate::header::{QueueKind, QueueMeta, Shape, Slot};
use crate::{ensure_lock_free, invalid, Consumer, Producer, Record, Result};

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Masked {}
    impl Sealed for super::Modulo {}
}

/// Index arithmetic of a ring.
pub trait Indexing: sealed::Sealed + Send + Sync + 'static {
    /// Whether the capacity must be a power of two.
    const POWER_OF_TWO: bool;

    /// Index following `index` in a ring of `capacity` slots.
    fn advance(index: usize, capacity: usize) -> usize;
}

/// `(i + 1) & (capacity - 1)`; capacity must be a power of two.
#[derive(Debug)]
pub enum Masked {}

/// `(i + 1) % capacity`; any capacity of at least two.
#[derive(Debug)]
pub enum Modulo {}

impl Indexing for Masked {
    const POWER_OF_TWO: bool = true;

    #[inline]
    fn advance(index: usize, capacity: usize) -> usize {
        (index + 1) & (capacity - 1)
    }
}

impl Indexing for Modulo {
    const POWER_OF_TWO: bool = false;

    #[inline]
    fn advance(index: usize, capacity: usize) -> usize {
        (index + 1) % capacity
    }
}

#[repr(C)]
struct SpscHeader {
    meta: CachePadded<QueueMeta>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: repr(C) over shm-safe fields.
unsafe impl ShmSafe for SpscHeader {}

struct Ring<T: Record, R: Role, I: Indexing> {
    mem: TypedRegion<R, SpscHeader, Slot<T>>,
    capacity: usize,
    _indexing: PhantomData<I>,
}

impl<T: Record, R: Role, I: Indexing> Ring<T, R, I> {
    fn shape(capacity: usize) -> Shape {
        let kind = if I::POWER_OF_TWO { QueueKind::SpscMasked } else { QueueKind::SpscModulo };
        Shape::of::<T>(kind, capacity)
    }

    /// Slot offset and total region size for `capacity` records.
    fn layout(config: &ChannelConfig) -> Result<(ShmName, usize, usize)> {
        ensure_lock_free()?;
        config.validate_capacity(I::POWER_OF_TWO)?;
        let mut layout = Layout::of::<SpscHeader>();
        let offset = layout
            .append::<Slot<T>>(config.capacity)
            .ok_or_else(|| invalid(format!("capacity {} overflows the address space", config.capacity)))?;
        Ok((config.name(SPSC_PURPOSE), offset, layout.size()))
    }

    fn map(region: SharedRegion<R>, offset: usize, capacity: usize) -> Result<Self> {
        let mem = TypedRegion::new(region, offset, capacity)?;
        Ok(Self { mem, capacity, _indexing: PhantomData })
    }

    fn header(&self) -> &SpscHeader {
        self.mem.header()
    }

    fn slot(&self, index: usize) -> Option<&Slot<T>> {
        let slot = self.mem.slots().get(index);
        if slot.is_none() {
            error!("offload-ipc: {} index {index} outside capacity {}", self.name(), self.capacity);
        }
        slot
    }

    fn name(&self) -> &ShmName {
        self.mem.region().name()
    }

    fn len(&self) -> usize {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        (head + self.capacity - tail) % self.capacity
    }
}

impl<T: Record, I: Indexing> Ring<T, Owner, I> {
    fn create(config: &ChannelConfig) -> Result<Self> {
        let (name, offset, size) = Self::layout(config)?;
        let region = SharedRegion::create(&name, size, InitMode::Zero)?;
        let ring = Self::map(region, offset, config.capacity)?;
        let header = ring.header();
        header.head.store(0, Ordering::Relaxed);
        header.tail.store(0, Ordering::Relaxed);
        header.meta.publish(Self::shape(config.capacity));
        debug!("offload-ipc: spsc {name} created (capacity {})", config.capacity);
        Ok(ring)
    }
}

impl<T: Record, I: Indexing> Ring<T, Borrower, I> {
    fn attach(config: &ChannelConfig) -> Result<Self> {
        let (name, offset, size) = Self::layout(config)?;
        let region = SharedRegion::attach(&name, size)?;
        let ring = Self::map(region, offset, config.capacity)?;
        ring.header().meta.verify(Self::shape(config.capacity), &name)?;
        debug!("offload-ipc: spsc {name} attached (capacity {})", config.capacity);
        Ok(ring)
    }
}

/// Writing end of an SPSC ring. Movable between threads, never shared.
pub struct SpscProducer<T: Record, R: Role = Owner, I: Indexing = Masked> {
    ring: Ring<T, R, I>,
    _not_sync: PhantomData<Cell<()>>,
}

/// Reading end of an SPSC ring. Movable between threads, never shared.
pub struct SpscConsumer<T: Record, R: Role = Borrower, I: Indexing = Masked> {
    ring: Ring<T, R, I>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Record, I: Indexing> SpscProducer<T, Owner, I> {
    /// Creates the ring and becomes its owner.
    pub fn create(config: &ChannelConfig) -> Result<Self> {
        Ring::create(config).map(|ring| Self { ring, _not_sync: PhantomData })
    }
}

impl<T: Record, I: Indexing> SpscProducer<T, Borrower, I> {
    /// Attaches to a ring owned by the consumer.
    pub fn attach(config: &ChannelConfig) -> Result<Self> {
        Ring::attach(config).map(|ring| Self { ring, _not_sync: PhantomData })
    }
}

impl<T: Record, I: Indexing> SpscConsumer<T, Owner, I> {
    /// Creates the ring and becomes its owner.
    pub fn create(config: &ChannelConfig) -> Result<Self> {
        Ring::create(config).map(|ring| Self { ring, _not_sync: PhantomData })
    }
}

impl<T: Record, I: Indexing> SpscConsumer<T, Borrower, I> {
    /// Attaches to a ring owned by the producer.
    pub fn attach(config: &ChannelConfig) -> Result<Self> {
        Ring::attach(config).map(|ring| Self { ring, _not_sync: PhantomData })
    }
}

impl<T: Record, R: Role, I: Indexing> SpscProducer<T, R, I> {
    /// Shared object name.
    pub fn name(&self) -> &ShmName {
        self.ring.name()
    }

    /// Records that fit at once (`capacity - 1`).
    pub fn usable_capacity(&self) -> usize {
        self.ring.capacity - 1
    }

    /// Records currently queued; a snapshot.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the ring looked empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Record, R: Role, I: Indexing> SpscConsumer<T, R, I> {
    /// Shared object name.
    pub fn name(&self) -> &ShmName {
        self.ring.name()
    }

    /// Records that fit at once (`capacity - 1`).
    pub fn usable_capacity(&self) -> usize {
        self.ring.capacity - 1
    }

    /// Records currently queued; a snapshot.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the ring looked empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Record, R: Role, I: Indexing> Producer<T> for SpscProducer<T, R, I> {
    fn enqueue(&self, item: T) -> bool {
        let header = self.ring.header();
        let head = header.head.load(Ordering::Relaxed);
        let next = I::advance(head, self.ring.capacity);
        if next == header.tail.load(Ordering::Acquire) {
            return false;
        }
        let Some(slot) = self.ring.slot(head) else { return false };
        // SAFETY: slots in [tail, head) belong to the consumer; `head` is not
        // among them until the store below.
        unsafe { slot.write(item) };
        header.head.store(next, Ordering::Release);
        true
    }

    fn capacity(&self) -> usize {
        self.ring.capacity
    }
}

impl<T: Record, R: Role, I: Indexing> Consumer<T> for SpscConsumer<T, R, I> {
    fn dequeue(&self) -> Option<T> {
        let header = self.ring.header();
        let tail = header.tail.load(Ordering::Relaxed);
        if tail == header.head.load(Ordering::Acquire) {
            return None;
        }
        let slot = self.ring.slot(tail)?;
        // SAFETY: the acquire load of `head` published this slot, and the
        // producer will not reuse it before `tail` moves past it.
        let item = unsafe { slot.read() };
        header.tail.store(I::advance(tail, self.ring.capacity), Ordering::Release);
        Some(item)
    }

    fn capacity(&self) -> usize {
        self.ring.capacity
    }
}

impl<T: Record, R: Role, I: Indexing> core::fmt::Debug for SpscProducer<T, R, I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpscProducer").field("name", self.name()).field("role", &R::LABEL).finish()
    }
}

impl<T: Record, R: Role, I: Indexing> core::fmt::Debug for SpscConsumer<T, R, I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpscConsumer").field("name", self.name()).field("role", &R::LABEL).finish()
    }
}
