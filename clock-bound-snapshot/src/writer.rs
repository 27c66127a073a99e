// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{LittleEndian, WriteBytesExt};
use std::ffi::c_void;
use std::io::{Error, ErrorKind, Seek, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic;
use std::{fs, ptr};
use tracing::{debug, error};

use crate::layout::*;
use crate::{ReaderOptions, Region, ShmError, ShmSegment, SnapshotReader};

/// Trait that a writer to the shared memory segment has to implement.
pub trait ShmWrite {
    /// Publish a new image of the segment.
    fn write(&mut self, image: &SegmentImage);
}

/// Writer to the ClockBound shared memory segment.
///
/// This writer stands in for the ClockBound daemon in tests and tooling. It is expected to be
/// used by a single process writing to a given path. The file written to is memory mapped by the
/// writer and many (read-only) readers. Updates to the memory segment are applied in a lock-free
/// manner, using a rolling generation number to protect the update section.
#[derive(Debug)]
pub struct ShmWriter {
    /// The size of the segment mapped in memory
    segsize: usize,

    /// A raw pointer keeping the address of the segment mapped in memory
    addr: *mut c_void,

    /// A raw pointer to the generation number in the mapped segment. The generation number is
    /// updated by the writer before and after updating the content mapped in memory.
    generation: *mut atomic::AtomicU16,
}

// SAFETY: the mapping is owned by the writer and only mutated through `&mut self`.
unsafe impl Send for ShmWriter {}

impl ShmWriter {
    /// Create a new ShmWriter referencing the memory segment to publish images to.
    ///
    /// If the file backing the segment does not exist, or does not hold a ClockBound segment, it
    /// is wiped clean: readers see an uninitialized segment until the first `write()`. Otherwise
    /// the existing segment is reused, and readers keep reading the last published image.
    pub fn new(path: &Path) -> std::io::Result<ShmWriter> {
        let segsize = match ShmWriter::usable_segment_size(path) {
            Some(size) => size,
            None => {
                let size = ShmWriter::segment_size();
                ShmWriter::wipe(path, size)?;
                size
            }
        };

        let addr = ShmWriter::mmap_segment_at(path, segsize)?;

        // SAFETY: the segment is at least MIN_SEGMENT_SIZE bytes and the generation offset is
        // naturally aligned within a page aligned mapping.
        let generation = unsafe { addr.cast::<u8>().add(GENERATION_OFFSET).cast() };

        debug!("Mapped SHM segment {} for writing", path.display());
        Ok(ShmWriter {
            segsize,
            addr,
            generation,
        })
    }

    /// Return the size of the segment at `path` if it is a ClockBound segment that can be reused.
    fn usable_segment_size(path: &Path) -> Option<usize> {
        let region = Region::open(path).ok()?;
        let segsize = region.segsize();

        let usable = match SnapshotReader::new(region, ReaderOptions::default()) {
            Ok(reader) => {
                let usable = matches!(
                    reader.snapshot(),
                    Ok(_) | Err(ShmError::SegmentNotInitialized)
                );
                if let Err(e) = reader.into_segment().close() {
                    error!("Failed to release SHM segment {}: {e}", path.display());
                }
                usable
            }
            Err(_) => false,
        };

        usable.then_some(segsize)
    }

    /// Return a segment size which is large enough to store everything we need.
    fn segment_size() -> usize {
        // Round up to have 64 bit alignment. Not absolutely required but convenient.
        let size = MIN_SEGMENT_SIZE;
        if size % 8 == 0 {
            size
        } else {
            size + (8 - size % 8)
        }
    }

    /// Initialize the file backing the memory segment.
    ///
    /// Zero out the file up to segsize, but write out the magic number and size. Both the layout
    /// version number and the generation number are set to 0, which tells readers the segment is
    /// not usable yet.
    fn wipe(path: &Path, segsize: usize) -> std::io::Result<()> {
        // Attempt at creating intermediate directories, but do expect that the base permissions
        // are set correctly.
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let size: u32 = segsize.try_into().map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!("Failed to convert segment size {segsize} into u32: {e}"),
            )
        })?;

        let mut file = fs::File::create(path)?;
        file.write_u32::<LittleEndian>(SHM_MAGIC[0])?;
        file.write_u32::<LittleEndian>(SHM_MAGIC[1])?;
        file.write_u32::<LittleEndian>(size)?; // Segsize
        file.write_u16::<LittleEndian>(0)?; // Version
        file.write_u16::<LittleEndian>(0)?; // Generation
        file.write_all(&vec![0; segsize - HEADER_SIZE])?;

        let pos = file.stream_position()?;
        if pos != u64::from(size) {
            return Err(Error::new(
                ErrorKind::Other,
                format!(
                    "SHM Writer implementation error: wrote {pos} bytes but segsize is {size} bytes"
                ),
            ));
        }

        file.sync_all()?;
        Ok(())
    }

    /// Open and map the file at the given path to memory, read-write.
    fn mmap_segment_at(path: &Path, segsize: usize) -> std::io::Result<*mut c_void> {
        let length = NonZeroUsize::new(segsize)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "empty SHM segment"))?;

        let fd = nix::fcntl::open(
            path,
            nix::fcntl::OFlag::O_RDWR,
            nix::sys::stat::Mode::from_bits_truncate(0o644),
        )?;

        // SAFETY: always safe when addr is None.
        let mapped = unsafe {
            nix::sys::mman::mmap(
                None,
                length,
                nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_WRITE,
                nix::sys::mman::MapFlags::MAP_SHARED,
                fd,
                0,
            )
        };

        // The mapping holds its own reference to the file.
        let _ = nix::unistd::close(fd);
        Ok(mapped?)
    }

    /// The generation number currently published in the segment.
    pub fn generation(&self) -> u16 {
        // SAFETY: pointer validated on init.
        u16::from_le(unsafe { (*self.generation).load(atomic::Ordering::Acquire) })
    }
}

impl ShmWrite for ShmWriter {
    /// Publish the image into the memory segment.
    ///
    /// This function implements the lock-free mechanism that lets the writer update the memory
    /// segment shared with many readers. The generation number is set to an odd number before the
    /// update and an even number when successfully completed. The generation number held in the
    /// image is ignored, the writer owns it.
    ///
    /// Note that the generation number rolls over, but is never set back to 0, as it would
    /// otherwise signal the readers that the segment is not initialized.
    fn write(&mut self, image: &SegmentImage) {
        let bytes = image.to_bytes();

        // SAFETY: pointers to the memory segment have been validated on init, and the segment
        // holds at least MIN_SEGMENT_SIZE bytes.
        unsafe {
            let generation = &*self.generation;
            // The generation is stored little-endian, as every other field of the segment.
            let gen = u16::from_le(generation.load(atomic::Ordering::Acquire));

            // A previous writer may have died mid-update and left an odd generation behind. Make
            // sure the update section is entered with an odd number.
            let gen = if gen & 0x0001 == 0 {
                gen.wrapping_add(1)
            } else {
                gen
            };
            generation.store(gen.to_le(), atomic::Ordering::Relaxed);

            // Keep the data writes below from being visible before the odd generation.
            atomic::fence(atomic::Ordering::Release);

            let base = self.addr.cast::<u8>();
            for (offset, byte) in bytes.iter().enumerate() {
                if (GENERATION_OFFSET..HEADER_SIZE).contains(&offset) {
                    continue;
                }
                ptr::write_volatile(base.add(offset), *byte);
            }

            // Skip a generation of 0 when the counter rolls over. A reader observing 0 before and
            // after a wipe would otherwise accept a dirty read.
            let mut gen = gen.wrapping_add(1);
            if gen == 0 {
                gen = 2
            }

            generation.store(gen.to_le(), atomic::Ordering::Release);
        }
    }
}

impl Drop for ShmWriter {
    /// Unmap the memory segment
    fn drop(&mut self) {
        // SAFETY: addr and segsize are those of the mapping created on init.
        if let Err(e) = unsafe { nix::sys::mman::munmap(self.addr, self.segsize) } {
            error!("Failed to unmap SHM segment on drop: {e}");
        }
    }
}
