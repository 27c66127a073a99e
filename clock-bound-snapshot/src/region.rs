// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use errno::{errno, Errno};
use std::ffi::{c_void, CStr, CString};
use std::mem::{align_of, MaybeUninit};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic;
use tracing::{debug, error};

use crate::{syserror, ShmError};

/// Raw, bounds-checked access to a shared memory segment.
///
/// This is the seam between the consistency protocol and the memory it samples. The `Region`
/// implements it over a memory mapped file; tests implement it over simulated segments.
pub trait ShmSegment {
    /// The number of bytes that can be accessed.
    fn segsize(&self) -> usize;

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// Returns `ShmError::OutOfRange` if any of the bytes lie outside of the segment.
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<(), ShmError>;

    /// Atomically load the little-endian u16 at `offset`, with acquire ordering.
    ///
    /// Returns `ShmError::OutOfRange` if the value lies outside of the segment or is not
    /// naturally aligned.
    fn load_u16(&self, offset: usize) -> Result<u16, ShmError>;
}

/// Check that `length` bytes at `offset` fit within a segment of `segsize` bytes.
fn check_range(offset: usize, length: usize, segsize: usize) -> Result<(), ShmError> {
    match offset.checked_add(length) {
        Some(end) if end <= segsize => Ok(()),
        _ => Err(ShmError::OutOfRange {
            offset,
            length,
            segsize,
        }),
    }
}

/// A guard tracking an open file descriptor.
///
/// Creating the FdGuard opens the file with read-only permission.
/// The file descriptor is closed when the guard is dropped, unless closed explicitly before.
#[derive(Debug)]
struct FdGuard(i32);

impl FdGuard {
    /// Create a new FdGuard.
    ///
    /// Open a file at `path` and store the open file descriptor
    fn new(path: &CStr) -> Result<Self, ShmError> {
        // SAFETY: `path` is a valid C string.
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return syserror!(OpenFailed, "open SHM segment");
        }

        Ok(FdGuard(fd))
    }

    /// Return the size in bytes of the open file.
    fn size(&self) -> Result<usize, ShmError> {
        let mut stat: MaybeUninit<libc::stat> = MaybeUninit::uninit();
        // SAFETY: `stat` points to valid memory large enough for a `struct stat`.
        if unsafe { libc::fstat(self.0, stat.as_mut_ptr()) } < 0 {
            return syserror!(OpenFailed, "fstat SHM segment");
        }

        // SAFETY: fstat succeeded and has initialized `stat`.
        let stat = unsafe { stat.assume_init() };
        match usize::try_from(stat.st_size) {
            Ok(size) => Ok(size),
            Err(_) => syserror!(OpenFailed, "fstat SHM segment size", Errno(libc::EOVERFLOW)),
        }
    }

    /// Close the file descriptor, reporting failure.
    fn close(self) -> Result<(), ShmError> {
        let fd = self.0;
        std::mem::forget(self);

        // SAFETY: `fd` is owned by this guard and has not been closed yet. On Linux, the
        // descriptor is released even if close() is interrupted, so EINTR is not a failure.
        let ret = unsafe { libc::close(fd) };
        if ret != 0 && errno() != Errno(libc::EINTR) {
            return syserror!(CloseFailed, "close SHM segment");
        }
        Ok(())
    }
}

impl Drop for FdGuard {
    /// Drop the FdGuard and close the file descriptor it holds.
    fn drop(&mut self) {
        // SAFETY: Unsafe because this is a call into a C API, but this particular
        // call is always safe.
        let ret = unsafe { libc::close(self.0) };
        if ret != 0 && errno() != Errno(libc::EINTR) {
            error!("Failed to close SHM segment file descriptor: {:?}", errno());
        }
    }
}

/// A guard tracking a memory mapped file.
///
/// Creating the MmapGuard maps an open file descriptor, read-only, in its entirety.
/// The file is unmap'ed when the guard is dropped, unless unmapped explicitly before.
#[derive(Debug)]
struct MmapGuard {
    /// A pointer to the head of the segment
    segment: *mut c_void,

    /// The size of the segment mapped into memory
    segsize: usize,
}

impl MmapGuard {
    /// Create a new MmapGuard.
    ///
    /// Map the open file descriptor held in the FdGuard. The size of the mapping is the size of
    /// the file, not the size declared in the segment, which may lag behind a layout change.
    fn new(fdguard: &FdGuard) -> Result<Self, ShmError> {
        let segsize = fdguard.size()?;
        if segsize == 0 {
            return syserror!(OpenFailed, "mmap empty SHM segment", Errno(libc::EINVAL));
        }

        // SAFETY: We're calling into a C function, but this particular call is always safe.
        let segment: *mut c_void = unsafe {
            libc::mmap(
                ptr::null_mut(),
                segsize,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fdguard.0,
                0,
            )
        };

        if segment == libc::MAP_FAILED {
            return syserror!(OpenFailed, "mmap SHM segment");
        }

        Ok(MmapGuard { segment, segsize })
    }

    /// Unmap the segment, reporting failure.
    fn unmap(self) -> Result<(), ShmError> {
        let (segment, segsize) = (self.segment, self.segsize);
        std::mem::forget(self);

        // SAFETY: `segment` was returned by `mmap` and is unmapped exactly once, here.
        if unsafe { libc::munmap(segment, segsize) } != 0 {
            return syserror!(CloseFailed, "munmap SHM segment");
        }
        Ok(())
    }
}

impl Drop for MmapGuard {
    /// Drop the MmapGuard and unmap the file it tracks.
    fn drop(&mut self) {
        // SAFETY: `segment` was previously returned from `mmap`, and therefore
        // when this destructor runs there are no more live references into
        // it.
        if unsafe { libc::munmap(self.segment, self.segsize) } != 0 {
            error!("Failed to unmap SHM segment: {:?}", errno());
        }
    }
}

/// Read-only view of a ClockBound shared memory segment.
///
/// The Region owns the open file descriptor and the memory mapping backing the segment, and keeps
/// both alive until it is closed or dropped. All accesses are bounds checked against the size of
/// the mapping, and the content is only ever read: the segment belongs to the writer.
///
/// Releasing the Region consumes it, so it cannot be used or released again afterwards.
#[derive(Debug)]
pub struct Region {
    // Fields are dropped in declaration order: unmap first, then close the file descriptor.
    mmap: MmapGuard,
    fd: FdGuard,
}

// SAFETY: the Region only holds a read-only mapping and an owned file descriptor. The mapping is
// only accessed through volatile and atomic reads, which are safe to issue from any thread, and
// the mapping is released once, when the Region is consumed or dropped.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Open and map the shared memory segment at `path`, read-only.
    ///
    /// Fails with `ShmError::OpenFailed` if the file cannot be opened, is empty, or cannot be
    /// mapped.
    pub fn open(path: &Path) -> Result<Region, ShmError> {
        let path_cstring = match CString::new(path.as_os_str().as_bytes()) {
            Ok(p) => p,
            Err(_) => return syserror!(OpenFailed, "SHM segment path", Errno(libc::EINVAL)),
        };

        let fd = FdGuard::new(path_cstring.as_c_str())?;
        let mmap = MmapGuard::new(&fd)?;
        debug!(
            "Mapped SHM segment {} ({} bytes)",
            path.display(),
            mmap.segsize
        );

        Ok(Region { mmap, fd })
    }

    /// Unmap the segment and close its file descriptor.
    ///
    /// Both resources are released even if the first fails, and the first failure is returned.
    pub fn close(self) -> Result<(), ShmError> {
        let Region { mmap, fd } = self;
        let unmapped = mmap.unmap();
        let closed = fd.close();
        debug!("Released SHM segment");
        unmapped.and(closed)
    }

    fn base(&self) -> *const u8 {
        self.mmap.segment.cast::<u8>().cast_const()
    }
}

impl ShmSegment for Region {
    fn segsize(&self) -> usize {
        self.mmap.segsize
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<(), ShmError> {
        check_range(offset, buf.len(), self.mmap.segsize)?;

        // The writer may update the segment at any time: every byte is read with a volatile read
        // so the compiler can neither elide nor merge them.
        // SAFETY: the range has been checked to lie within the mapping.
        unsafe {
            let src = self.base().add(offset);
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = ptr::read_volatile(src.add(i));
            }
        }
        Ok(())
    }

    fn load_u16(&self, offset: usize) -> Result<u16, ShmError> {
        check_range(offset, 2, self.mmap.segsize)?;

        // SAFETY: the range has been checked to lie within the mapping.
        let at = unsafe { self.base().add(offset) };
        if at as usize % align_of::<atomic::AtomicU16>() != 0 {
            return Err(ShmError::OutOfRange {
                offset,
                length: 2,
                segsize: self.mmap.segsize,
            });
        }

        // SAFETY: `at` is within the mapping and aligned for an AtomicU16.
        let value = unsafe { &*at.cast::<atomic::AtomicU16>() };
        Ok(u16::from_le(value.load(atomic::Ordering::Acquire)))
    }
}
