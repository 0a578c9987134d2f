// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed views into a mapped region.
//!
//! Mapped memory is reinterpreted only here. Every access is checked against
//! the mapping size and the element alignment. Borrowed views require
//! [`ShmSafe`] element types, which mutate through atomics or cells; plain
//! [`ShmRecord`] data is only ever copied out with a volatile read.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use core::sync::atomic::{
    AtomicI32, AtomicI64, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize,
};

use crate::cache::{round_up_to_cache_line, CachePadded};
use crate::region::{Role, SharedRegion};
use crate::{Error, Result};

/// Types that may be borrowed in place from memory shared with another
/// process.
///
/// # Safety
///
/// Implementors must be valid for every bit pattern (the all-zero pattern in
/// particular), have a stable `#[repr(C)]` or `#[repr(transparent)]` layout,
/// and contain no pointers or references. Every byte a peer may change while
/// a borrow is live must sit behind an atomic or an `UnsafeCell`; plain
/// integers do not qualify.
pub unsafe trait ShmSafe: Send + Sync + 'static {}

/// Plain data copied into and out of shared memory, never borrowed in place.
///
/// # Safety
///
/// Implementors must be valid for every bit pattern, have a stable
/// `#[repr(C)]` or `#[repr(transparent)]` layout and contain no pointers or
/// references.
pub unsafe trait ShmRecord: Copy + Send + Sync + 'static {}

macro_rules! shm_safe {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: atomics accept any bit pattern and synchronize themselves.
            unsafe impl ShmSafe for $ty {}
        )*
    };
}

macro_rules! shm_record {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: plain integers accept any bit pattern.
            unsafe impl ShmRecord for $ty {}
        )*
    };
}

shm_safe!(AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, AtomicI32, AtomicI64);
shm_record!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

// SAFETY: arrays of shm-safe elements are shm-safe.
unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}
// SAFETY: arrays of plain records are plain records.
unsafe impl<T: ShmRecord, const N: usize> ShmRecord for [T; N] {}
// SAFETY: `CachePadded` is `repr(C)` around a single shm-safe field.
unsafe impl<T: ShmSafe> ShmSafe for CachePadded<T> {}

impl<R: Role> SharedRegion<R> {
    /// Borrows a `T` stored at `offset`.
    pub fn view<T: ShmSafe>(&self, offset: usize) -> Result<&T> {
        let ptr = self.checked(offset, size_of::<T>(), align_of::<T>())?;
        // SAFETY: in bounds and aligned; `T: ShmSafe` is valid for any bytes
        // and the borrow cannot outlive the mapping.
        Ok(unsafe { &*ptr.cast::<T>() })
    }

    /// Borrows `count` consecutive `T`s starting at `offset`.
    pub fn slice<T: ShmSafe>(&self, offset: usize, count: usize) -> Result<&[T]> {
        let bytes = size_of::<T>().checked_mul(count).ok_or_else(|| self.out_of_bounds(offset, usize::MAX))?;
        let ptr = self.checked(offset, bytes, align_of::<T>())?;
        // SAFETY: as for `view`, over `count` elements.
        Ok(unsafe { core::slice::from_raw_parts(ptr.cast::<T>(), count) })
    }

    /// Copies the `T` stored at `offset` out of the mapping.
    ///
    /// Each call reloads memory. A peer writing concurrently may leave the
    /// copy torn, so callers validate it through their own protocol.
    pub fn read<T: ShmRecord>(&self, offset: usize) -> Result<T> {
        let ptr = self.checked(offset, size_of::<T>(), align_of::<T>())?;
        // SAFETY: in bounds and aligned, and any bit pattern is a valid `T`.
        Ok(unsafe { ptr.cast::<T>().read_volatile() })
    }

    fn checked(&self, offset: usize, len: usize, align: usize) -> Result<*mut u8> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size_bytes() => {}
            _ => return Err(self.out_of_bounds(offset, len)),
        }
        let ptr = self.as_ptr().wrapping_add(offset);
        if (ptr as usize) % align != 0 {
            return Err(Error::Misaligned { name: self.name().to_string(), offset, align });
        }
        Ok(ptr)
    }

    fn out_of_bounds(&self, offset: usize, len: usize) -> Error {
        Error::OutOfBounds { name: self.name().to_string(), offset, len, size: self.size_bytes() }
    }
}

/// A region together with a validated header at offset zero and a validated
/// slot array. Views are checked once here and borrowed freely afterwards.
pub struct TypedRegion<R: Role, H: ShmSafe, S: ShmSafe = AtomicU8> {
    region: SharedRegion<R>,
    header: NonNull<H>,
    slots: NonNull<[S]>,
    _marker: PhantomData<(H, S)>,
}

// SAFETY: `H` and `S` are `Send + Sync` through `ShmSafe`, and the mapping
// behind the pointers lives as long as `region`.
unsafe impl<R: Role, H: ShmSafe, S: ShmSafe> Send for TypedRegion<R, H, S> {}
// SAFETY: see `Send`.
unsafe impl<R: Role, H: ShmSafe, S: ShmSafe> Sync for TypedRegion<R, H, S> {}

impl<R: Role, H: ShmSafe, S: ShmSafe> TypedRegion<R, H, S> {
    /// Validates `H` at offset zero and `count` slots at `slots_offset`.
    pub fn new(region: SharedRegion<R>, slots_offset: usize, count: usize) -> Result<Self> {
        let header = NonNull::from(region.view::<H>(0)?);
        let slots = NonNull::from(region.slice::<S>(slots_offset, count)?);
        Ok(Self { region, header, slots, _marker: PhantomData })
    }

    /// Validates `H` at offset zero; the slot array is empty.
    pub fn header_only(region: SharedRegion<R>) -> Result<Self> {
        Self::new(region, 0, 0)
    }

    /// Shared header.
    pub fn header(&self) -> &H {
        // SAFETY: validated in `new`; the mapping is alive while `self` is.
        unsafe { self.header.as_ref() }
    }

    /// Slot array.
    pub fn slots(&self) -> &[S] {
        // SAFETY: validated in `new`; the mapping is alive while `self` is.
        unsafe { self.slots.as_ref() }
    }

    /// Underlying region.
    pub fn region(&self) -> &SharedRegion<R> {
        &self.region
    }
}

impl<R: Role, H: ShmSafe, S: ShmSafe> core::fmt::Debug for TypedRegion<R, H, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TypedRegion")
            .field("name", self.region.name())
            .field("size_bytes", &self.region.size_bytes())
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Computes offsets of a header followed by arrays.
///
/// Both peers run the same computation, so offsets agree without being stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    end: usize,
}

impl Layout {
    /// Starts a layout with `H` at offset zero.
    pub fn of<H>() -> Self {
        Self { end: size_of::<H>() }
    }

    /// Reserves `count` elements of `T` after everything placed so far and
    /// returns their offset, or `None` on overflow.
    pub fn append<T>(&mut self, count: usize) -> Option<usize> {
        let align = align_of::<T>();
        let offset = self.end.checked_add(align - 1)? & !(align - 1);
        let bytes = size_of::<T>().checked_mul(count)?;
        self.end = offset.checked_add(bytes)?;
        Some(offset)
    }

    /// Total size rounded up to whole cache lines.
    pub fn size(&self) -> usize {
        round_up_to_cache_line(self.end)
    }
}
