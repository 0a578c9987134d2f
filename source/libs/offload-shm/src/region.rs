// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: POSIX shared-memory region lifecycle
//!
//! A region is created by exactly one [`Owner`] and attached by any number of
//! [`Borrower`]s. Both unmap on drop; only the owner removes the name from the
//! namespace. A crashed owner leaks its name until the next owner with the
//! same name removes the stale object during [`SharedRegion::create`].
//!
//! Construction never leaves resources behind on failure: descriptors are
//! closed by `OwnedFd`, and a name created by the failing call is unlinked.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use log::{debug, error, warn};

use crate::name::ShmName;
use crate::{Error, Result};

const OBJECT_MODE: libc::mode_t = 0o600;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Owner {}
    impl Sealed for super::Borrower {}
}

/// Ownership role of a region handle.
pub trait Role: sealed::Sealed + Send + Sync + 'static {
    /// Whether dropping the handle removes the name.
    const UNLINK_ON_DROP: bool;
    /// Label used in diagnostics.
    const LABEL: &'static str;
}

/// Creates the object and removes its name on drop.
#[derive(Debug)]
pub enum Owner {}

/// Attaches to an object created elsewhere and never removes it.
#[derive(Debug)]
pub enum Borrower {}

impl Role for Owner {
    const UNLINK_ON_DROP: bool = true;
    const LABEL: &'static str = "owner";
}

impl Role for Borrower {
    const UNLINK_ON_DROP: bool = false;
    const LABEL: &'static str = "borrower";
}

/// Initial contents of an owner-created region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitMode {
    /// Zero every byte after mapping.
    #[default]
    Zero,
    /// Leave the contents as the kernel provides them.
    NoInit,
}

/// A mapped, named shared-memory object.
#[derive(Debug)]
pub struct SharedRegion<R: Role> {
    name: ShmName,
    ptr: NonNull<u8>,
    len: usize,
    _role: PhantomData<R>,
}

// SAFETY: the mapping is process-wide memory; typed access goes through
// `ShmSafe` views whose element types synchronize themselves.
unsafe impl<R: Role> Send for SharedRegion<R> {}
// SAFETY: see `Send`.
unsafe impl<R: Role> Sync for SharedRegion<R> {}

impl SharedRegion<Owner> {
    /// Creates `name` exclusively with `len` bytes.
    ///
    /// An existing object with the same name is treated as left over from a
    /// crashed owner: it is unlinked once and the create is retried.
    pub fn create(name: &ShmName, len: usize, init: InitMode) -> Result<Self> {
        let path = prepare(name, len)?;
        let exclusive = libc::O_CREAT | libc::O_EXCL | libc::O_RDWR;
        let fd = match open(&path, exclusive) {
            Ok(fd) => fd,
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                warn!("offload-shm: removing stale object {name}");
                // SAFETY: `path` is a valid NUL-terminated string.
                unsafe { libc::shm_unlink(path.as_ptr()) };
                open(&path, exclusive).map_err(|source| resource("shm_open", name, source))?
            }
            Err(source) => return Err(resource("shm_open", name, source)),
        };
        let guard = UnlinkGuard::new(&path);
        resize(&fd, len, name)?;
        let ptr = map(&fd, len, name)?;
        drop(fd);
        guard.disarm();

        if init == InitMode::Zero {
            // SAFETY: `ptr` maps `len` writable bytes that no peer can know
            // about until this constructor returns the name to the caller.
            unsafe { ptr::write_bytes(ptr.as_ptr(), 0, len) };
        }
        debug!("offload-shm: created {name} ({len} bytes)");
        Ok(Self { name: name.clone(), ptr, len, _role: PhantomData })
    }
}

impl SharedRegion<Borrower> {
    /// Attaches to `name`, mapping `len` bytes.
    ///
    /// Tolerates the owner not having created the object yet: the object is
    /// then created and sized here so the mapping is backed. An object that
    /// already exists with a nonzero size smaller than `len` is rejected.
    pub fn attach(name: &ShmName, len: usize) -> Result<Self> {
        let path = prepare(name, len)?;
        let (fd, created) = open_or_create(&path, name)?;
        let guard = created.then(|| UnlinkGuard::new(&path));

        let actual = object_size(&fd, name)?;
        if actual == 0 {
            resize(&fd, len, name)?;
        } else if actual < len {
            return Err(Error::RegionTooSmall { name: name.to_string(), expected: len, actual });
        }
        let ptr = map(&fd, len, name)?;
        drop(fd);
        if let Some(guard) = guard {
            guard.disarm();
        }
        debug!("offload-shm: attached {name} ({len} bytes, created={created})");
        Ok(Self { name: name.clone(), ptr, len, _role: PhantomData })
    }
}

impl<R: Role> SharedRegion<R> {
    /// Object name shared with peers.
    pub fn name(&self) -> &ShmName {
        &self.name
    }

    /// Mapped size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len
    }

    /// Base address of the mapping.
    ///
    /// Prefer [`SharedRegion::view`] and [`SharedRegion::slice`], which
    /// check bounds and alignment.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Whether dropping this handle removes the name.
    pub fn is_owner(&self) -> bool {
        R::UNLINK_ON_DROP
    }
}

impl<R: Role> Drop for SharedRegion<R> {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping created by this handle and
        // every view borrowed from it has ended.
        if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) } != 0 {
            error!("offload-shm: munmap {} failed: {}", self.name, io::Error::last_os_error());
        }
        if !R::UNLINK_ON_DROP {
            debug!("offload-shm: detached {} ({})", self.name, R::LABEL);
            return;
        }
        let Ok(path) = self.name.to_c_path() else { return };
        // SAFETY: `path` is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(path.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                debug!("offload-shm: {} already unlinked", self.name);
            } else {
                error!("offload-shm: shm_unlink {} failed: {err}", self.name);
            }
        } else {
            debug!("offload-shm: unlinked {}", self.name);
        }
    }
}

struct UnlinkGuard<'a> {
    path: &'a CStr,
    armed: bool,
}

impl<'a> UnlinkGuard<'a> {
    fn new(path: &'a CStr) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for UnlinkGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            // SAFETY: `path` is a valid NUL-terminated string.
            unsafe { libc::shm_unlink(self.path.as_ptr()) };
        }
    }
}

fn prepare(name: &ShmName, len: usize) -> Result<CString> {
    if len == 0 {
        return Err(Error::InvalidSize { name: name.to_string() });
    }
    name.to_c_path()
}

fn resource(op: &'static str, name: &ShmName, source: io::Error) -> Error {
    Error::ResourceCreation { op, name: name.to_string(), source }
}

fn open(path: &CStr, flags: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: `path` is NUL-terminated and outlives the call.
    let fd = unsafe { libc::shm_open(path.as_ptr(), flags, OBJECT_MODE) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `shm_open` returned a fresh descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Opens an existing object, or creates it when absent. The flag reports
/// whether this call created the name.
fn open_or_create(path: &CStr, name: &ShmName) -> Result<(OwnedFd, bool)> {
    match open(path, libc::O_RDWR) {
        Ok(fd) => return Ok((fd, false)),
        Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {}
        Err(source) => return Err(resource("shm_open", name, source)),
    }
    match open(path, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR) {
        Ok(fd) => Ok((fd, true)),
        // The owner won the race between the two opens.
        Err(err) if err.raw_os_error() == Some(libc::EEXIST) => open(path, libc::O_RDWR)
            .map(|fd| (fd, false))
            .map_err(|source| resource("shm_open", name, source)),
        Err(source) => Err(resource("shm_open", name, source)),
    }
}

fn resize(fd: &OwnedFd, len: usize, name: &ShmName) -> Result<()> {
    let size = libc::off_t::try_from(len).map_err(|_| Error::InvalidSize { name: name.to_string() })?;
    // SAFETY: `fd` is an open shared-memory descriptor.
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size) } != 0 {
        return Err(Error::os("ftruncate", name.as_str()));
    }
    Ok(())
}

fn object_size(fd: &OwnedFd, name: &ShmName) -> Result<usize> {
    let mut stat = core::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: `stat` is writable storage for one `struct stat`.
    if unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) } != 0 {
        return Err(Error::os("fstat", name.as_str()));
    }
    // SAFETY: `fstat` succeeded and initialized the structure.
    let size = unsafe { stat.assume_init() }.st_size;
    Ok(usize::try_from(size).unwrap_or(0))
}

fn map(fd: &OwnedFd, len: usize, name: &ShmName) -> Result<NonNull<u8>> {
    // SAFETY: a fresh shared mapping of an object at least `len` bytes long.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Error::os("mmap", name.as_str()));
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| Error::os("mmap", name.as_str()))
}
