// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SPSC ring with an optimistic sequence-counter read protocol
//!
//! The producer bumps `seq` to odd before writing a slot and back to even
//! after publishing `head`. The consumer copies the slot only while `seq` is
//! even and commits `tail` only if `seq` did not move during the copy, so a
//! returned record never straddles a write. Any overlap reads as
//! [`SeqRead::Contended`] even if the record itself was intact.

use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{fence, AtomicUsize, Ordering};

use log::debug;
use offload_shm::name::SEQLOCK_PURPOSE;
use offload_shm::{
    Borrower, CachePadded, InitMode, Layout, Owner, Role, SharedRegion, ShmName, ShmSafe,
    TypedRegion,
};

use crate::config::ChannelConfig;
use crate::header::{QueueKind, QueueMeta, Shape, Slot};
use crate::{ensure_lock_free, invalid, Consumer, Producer, Record, Result};

/// Outcome of one optimistic read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqRead<T> {
    /// A committed record; `tail` advanced past it.
    Item(T),
    /// Nothing queued.
    Empty,
    /// A write overlapped the read; nothing was consumed.
    Contended,
}

#[repr(C)]
struct SeqLockHeader {
    meta: CachePadded<QueueMeta>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    seq: CachePadded<AtomicUsize>,
}

// SAFETY: repr(C) over shm-safe fields.
unsafe impl ShmSafe for SeqLockHeader {}

struct Ring<T: Record, R: Role> {
    mem: TypedRegion<R, SeqLockHeader, Slot<T>>,
    mask: usize,
}

impl<T: Record, R: Role> Ring<T, R> {
    fn layout(config: &ChannelConfig) -> Result<(ShmName, usize, usize)> {
        ensure_lock_free()?;
        config.validate_capacity(true)?;
        let mut layout = Layout::of::<SeqLockHeader>();
        let offset = layout
            .append::<Slot<T>>(config.capacity)
            .ok_or_else(|| invalid(format!("capacity {} overflows the address space", config.capacity)))?;
        Ok((config.name(SEQLOCK_PURPOSE), offset, layout.size()))
    }

    fn map(region: SharedRegion<R>, offset: usize, capacity: usize) -> Result<Self> {
        let mem = TypedRegion::new(region, offset, capacity)?;
        Ok(Self { mem, mask: capacity - 1 })
    }

    fn header(&self) -> &SeqLockHeader {
        self.mem.header()
    }

    fn slot(&self, index: usize) -> &Slot<T> {
        &self.mem.slots()[index & self.mask]
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }
}

impl<T: Record> Ring<T, Owner> {
    fn create(config: &ChannelConfig) -> Result<Self> {
        let (name, offset, size) = Self::layout(config)?;
        let region = SharedRegion::create(&name, size, InitMode::Zero)?;
        let ring = Self::map(region, offset, config.capacity)?;
        let header = ring.header();
        header.head.store(0, Ordering::Relaxed);
        header.tail.store(0, Ordering::Relaxed);
        header.seq.store(0, Ordering::Relaxed);
        header.meta.publish(Shape::of::<T>(QueueKind::SeqLock, config.capacity));
        debug!("offload-ipc: seqlock {name} created (capacity {})", config.capacity);
        Ok(ring)
    }
}

impl<T: Record> Ring<T, Borrower> {
    fn attach(config: &ChannelConfig) -> Result<Self> {
        let (name, offset, size) = Self::layout(config)?;
        let region = SharedRegion::attach(&name, size)?;
        let ring = Self::map(region, offset, config.capacity)?;
        ring.header().meta.verify(Shape::of::<T>(QueueKind::SeqLock, config.capacity), &name)?;
        debug!("offload-ipc: seqlock {name} attached (capacity {})", config.capacity);
        Ok(ring)
    }
}

/// Writing end of a seqlock ring.
pub struct SeqLockProducer<T: Record, R: Role = Owner> {
    ring: Ring<T, R>,
    _not_sync: PhantomData<Cell<()>>,
}

/// Reading end of a seqlock ring.
pub struct SeqLockConsumer<T: Record, R: Role = Borrower> {
    ring: Ring<T, R>,
    retries: u32,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Record> SeqLockProducer<T, Owner> {
    /// Creates the ring and becomes its owner.
    pub fn create(config: &ChannelConfig) -> Result<Self> {
        Ring::create(config).map(|ring| Self { ring, _not_sync: PhantomData })
    }
}

impl<T: Record> SeqLockProducer<T, Borrower> {
    /// Attaches to a ring owned by the consumer.
    pub fn attach(config: &ChannelConfig) -> Result<Self> {
        Ring::attach(config).map(|ring| Self { ring, _not_sync: PhantomData })
    }
}

impl<T: Record> SeqLockConsumer<T, Owner> {
    /// Creates the ring and becomes its owner.
    pub fn create(config: &ChannelConfig) -> Result<Self> {
        Ring::create(config).map(|ring| Self { ring, retries: config.seqlock_retries, _not_sync: PhantomData })
    }
}

impl<T: Record> SeqLockConsumer<T, Borrower> {
    /// Attaches to a ring owned by the producer.
    pub fn attach(config: &ChannelConfig) -> Result<Self> {
        Ring::attach(config).map(|ring| Self { ring, retries: config.seqlock_retries, _not_sync: PhantomData })
    }
}

impl<T: Record, R: Role> SeqLockProducer<T, R> {
    /// Shared object name.
    pub fn name(&self) -> &ShmName {
        self.ring.mem.region().name()
    }
}

impl<T: Record, R: Role> SeqLockConsumer<T, R> {
    /// Shared object name.
    pub fn name(&self) -> &ShmName {
        self.ring.mem.region().name()
    }

    /// One optimistic read without retrying.
    pub fn try_read(&self) -> SeqRead<T> {
        let header = self.ring.header();
        let tail = header.tail.load(Ordering::Relaxed);
        if tail == header.head.load(Ordering::Acquire) {
            return SeqRead::Empty;
        }
        let before = header.seq.load(Ordering::Acquire);
        if before & 1 == 1 {
            return SeqRead::Contended;
        }
        // SAFETY: the copy is discarded unless `seq` proves no write overlapped it.
        let item = unsafe { self.ring.slot(tail).read_volatile() };
        fence(Ordering::Acquire);
        if header.seq.load(Ordering::Relaxed) != before {
            return SeqRead::Contended;
        }
        header.tail.store((tail + 1) & self.ring.mask, Ordering::Release);
        SeqRead::Item(item)
    }
}

impl<T: Record, R: Role> Producer<T> for SeqLockProducer<T, R> {
    fn enqueue(&self, item: T) -> bool {
        let header = self.ring.header();
        let head = header.head.load(Ordering::Relaxed);
        let next = (head + 1) & self.ring.mask;
        if next == header.tail.load(Ordering::Acquire) {
            return false;
        }
        header.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: `head` is outside [tail, head); readers validate via `seq`.
        unsafe { self.ring.slot(head).write_volatile(item) };
        header.head.store(next, Ordering::Release);
        header.seq.fetch_add(1, Ordering::Release);
        true
    }

    fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T: Record, R: Role> Consumer<T> for SeqLockConsumer<T, R> {
    /// Retries contended reads up to the configured count, then reports
    /// nothing ready.
    fn dequeue(&self) -> Option<T> {
        for _ in 0..=self.retries {
            match self.try_read() {
                SeqRead::Item(item) => return Some(item),
                SeqRead::Empty => return None,
                SeqRead::Contended => core::hint::spin_loop(),
            }
        }
        None
    }

    fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T: Record, R: Role> core::fmt::Debug for SeqLockProducer<T, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SeqLockProducer").field("name", self.name()).field("role", &R::LABEL).finish()
    }
}

impl<T: Record, R: Role> core::fmt::Debug for SeqLockConsumer<T, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SeqLockConsumer")
            .field("name", self.name())
            .field("role", &R::LABEL)
            .field("retries", &self.retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::config;
    use crate::Error;
    use std::thread;

    #[test]
    fn fifo_with_reserved_slot() {
        let cfg = config(8);
        let tx = SeqLockProducer::<u32>::create(&cfg).expect("create");
        let rx = SeqLockConsumer::<u32>::attach(&cfg).expect("attach");
        assert_eq!(rx.try_read(), SeqRead::Empty);
        for value in 0..7 {
            assert!(tx.enqueue(value));
        }
        assert!(!tx.enqueue(7));
        for value in 0..7 {
            assert_eq!(rx.try_read(), SeqRead::Item(value));
        }
        assert_eq!(rx.dequeue(), None);
    }

    #[test]
    fn odd_sequence_reads_as_contended() {
        let cfg = config(4);
        let tx = SeqLockProducer::<u32>::create(&cfg).expect("create");
        let rx = SeqLockConsumer::<u32>::attach(&cfg).expect("attach");
        assert!(tx.enqueue(5));

        tx.ring.header().seq.fetch_add(1, Ordering::SeqCst);
        assert_eq!(rx.try_read(), SeqRead::Contended);
        assert_eq!(rx.dequeue(), None, "contended reads give up after the retry budget");

        tx.ring.header().seq.fetch_add(1, Ordering::SeqCst);
        assert_eq!(rx.dequeue(), Some(5));
    }

    #[test]
    fn requires_power_of_two() {
        assert!(matches!(SeqLockProducer::<u32>::create(&config(6)), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn does_not_collide_with_plain_ring() {
        let cfg = config(8);
        let spsc = crate::SpscProducer::<u32>::create(&cfg).expect("create");
        let seqlock = SeqLockProducer::<u32>::create(&cfg).expect("seqlock uses its own name");
        assert_ne!(seqlock.name(), spsc.name());
    }

    #[test]
    fn concurrent_reads_are_never_torn() {
        const COUNT: u64 = 50_000;
        type Wide = [u64; 8];
        let cfg = config(16).with_seqlock_retries(4);
        let tx = SeqLockProducer::<Wide>::create(&cfg).expect("create");
        let rx = SeqLockConsumer::<Wide>::attach(&cfg).expect("attach");

        let producer = thread::spawn(move || {
            for value in 0..COUNT {
                while !tx.enqueue([value; 8]) {
                    thread::yield_now();
                }
            }
            tx
        });
        let mut expected = 0;
        while expected < COUNT {
            if let Some(record) = rx.dequeue() {
                assert!(record.iter().all(|&w| w == record[0]), "torn record {record:?}");
                assert_eq!(record[0], expected);
                expected += 1;
            }
        }
        let _tx = producer.join().expect("producer thread");
    }
}
