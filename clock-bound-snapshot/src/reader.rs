// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{ByteOrder, LittleEndian};
use retry::delay::Fixed;
use retry::{retry_with_index, OperationResult};
use std::sync::atomic;
use std::time::Duration;
use tracing::warn;

use crate::layout::*;
use crate::region::ShmSegment;
use crate::{ClockStatus, ShmError, Timestamp};

/// Default number of read attempts before giving up on a consistent snapshot.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// Default pause between two read attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_micros(10);

/// Retry policy of the SnapshotReader.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Maximum number of read attempts for a single snapshot. A value of 0 is treated as 1.
    pub max_attempts: u32,

    /// Pause between two read attempts.
    pub backoff: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// A consistent copy of the ClockBound data held in the shared memory segment.
///
/// All fields were read between two identical, even, observations of the generation number. The
/// value is owned by the caller and never changes after it is taken.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub(crate) version: u16,
    pub(crate) generation: u16,
    pub(crate) as_of: Timestamp,
    pub(crate) void_after: Timestamp,
    pub(crate) bound_nsec: u64,
    pub(crate) max_drift_ppb: u32,
    pub(crate) clock_status: u32,
}

impl Snapshot {
    /// Layout version of the segment the snapshot was read from.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// The generation number the snapshot was read at.
    pub fn generation(&self) -> u16 {
        self.generation
    }

    /// The instant the bound on clock error was computed at.
    pub fn as_of(&self) -> Timestamp {
        self.as_of
    }

    /// The instant beyond which the bound on clock error must not be trusted.
    pub fn void_after(&self) -> Timestamp {
        self.void_after
    }

    /// Half-width of the uncertainty interval around `as_of`, in nanoseconds.
    pub fn bound_nsec(&self) -> u64 {
        self.bound_nsec
    }

    /// Maximum drift rate assumed by the writer, in parts per billion. Informational.
    pub fn max_drift_ppb(&self) -> u32 {
        self.max_drift_ppb
    }

    /// The clock status code as written in the segment.
    pub fn raw_status(&self) -> u32 {
        self.clock_status
    }

    /// The clock status as written in the segment, without accounting for staleness.
    pub fn clock_status(&self) -> ClockStatus {
        ClockStatus::from_code(self.clock_status)
    }

    /// Parse the bytes of a consistent read of the segment.
    ///
    /// The header is validated before anything else is interpreted.
    fn parse(buf: &[u8; MIN_SEGMENT_SIZE], generation: u16) -> Result<Snapshot, ShmError> {
        let magic = [
            LittleEndian::read_u32(&buf[MAGIC_OFFSET..]),
            LittleEndian::read_u32(&buf[MAGIC_OFFSET + 4..]),
        ];
        if magic != SHM_MAGIC {
            return Err(ShmError::UnsupportedFormat { magic });
        }

        let version = LittleEndian::read_u16(&buf[VERSION_OFFSET..]);
        if version == 0 {
            // The writer has wiped the segment clean but not defined its layout yet.
            return Err(ShmError::SegmentNotInitialized);
        } else if version > CLOCKBOUND_SHM_SUPPORTED_VERSION {
            return Err(ShmError::UnsupportedVersion {
                version,
                supported: CLOCKBOUND_SHM_SUPPORTED_VERSION,
            });
        }

        let total_size = LittleEndian::read_u32(&buf[TOTAL_SIZE_OFFSET..]) as usize;
        if total_size < MIN_SEGMENT_SIZE {
            return Err(ShmError::TruncatedRegion {
                size: total_size,
                minimum: MIN_SEGMENT_SIZE,
            });
        }

        Ok(Snapshot {
            version,
            generation,
            as_of: Timestamp::new(
                LittleEndian::read_u64(&buf[AS_OF_SEC_OFFSET..]),
                LittleEndian::read_u64(&buf[AS_OF_NSEC_OFFSET..]),
            ),
            void_after: Timestamp::new(
                LittleEndian::read_u64(&buf[VOID_AFTER_SEC_OFFSET..]),
                LittleEndian::read_u64(&buf[VOID_AFTER_NSEC_OFFSET..]),
            ),
            bound_nsec: LittleEndian::read_u64(&buf[BOUND_NSEC_OFFSET..]),
            max_drift_ppb: LittleEndian::read_u32(&buf[MAX_DRIFT_PPB_OFFSET..]),
            clock_status: LittleEndian::read_u32(&buf[CLOCK_STATUS_OFFSET..]),
        })
    }
}

/// Reader for ClockBound daemon shared memory segment.
///
/// The segment is updated by a single producer (the ClockBound daemon), but may be read by many
/// clients. The shared memory segment does not implement a semaphore or equivalent to synchronize
/// the single-producer / many-consumers processes. Instead, the mechanism is lock-free and relies
/// on a `generation` number to ensure consistent reads (over retries).
///
/// The writer increments the generation field from even to odd before each update. It also
/// increments it again, from odd to even, after finishing the update. Readers check the
/// `generation` field before and after each read, and verify that they obtain the same, even,
/// value. Otherwise, the read was dirty and is retried, up to a bounded number of attempts.
///
/// The reader keeps no state between snapshots, and can be shared by many threads as long as the
/// underlying segment can.
#[derive(Debug)]
pub struct SnapshotReader<S: ShmSegment> {
    segment: S,
    options: ReaderOptions,
}

impl<S: ShmSegment> SnapshotReader<S> {
    /// Create a reader over `segment`.
    ///
    /// The segment must be large enough to hold every field this reader consumes, and must carry
    /// the ClockBound magic number.
    pub fn new(segment: S, options: ReaderOptions) -> Result<SnapshotReader<S>, ShmError> {
        let segsize = segment.segsize();
        if segsize < MIN_SEGMENT_SIZE {
            return Err(ShmError::TruncatedRegion {
                size: segsize,
                minimum: MIN_SEGMENT_SIZE,
            });
        }

        // The magic number never changes once written, no need for the generation dance here.
        let mut buf = [0u8; 8];
        segment.read_bytes(MAGIC_OFFSET, &mut buf)?;
        let magic = [
            LittleEndian::read_u32(&buf[0..]),
            LittleEndian::read_u32(&buf[4..]),
        ];
        if magic != SHM_MAGIC {
            return Err(ShmError::UnsupportedFormat { magic });
        }

        Ok(SnapshotReader { segment, options })
    }

    pub fn segment(&self) -> &S {
        &self.segment
    }

    /// Give back the segment, to release it explicitly.
    pub fn into_segment(self) -> S {
        self.segment
    }

    /// Return a consistent snapshot of the shared memory segment.
    ///
    /// Taking a snapshot consists in reading the memory segment while confirming the generation
    /// number in the header has not changed (which would indicate an update from the writer
    /// occurred while reading). If an update is detected, the read is retried after a short
    /// pause. If no consistent read is obtained within the attempt budget, the writer is stuck
    /// mid-update or the segment is corrupted: `ShmError::InconsistentSnapshot` is returned.
    ///
    /// Format errors are not retried, retrying cannot fix them.
    pub fn snapshot(&self) -> Result<Snapshot, ShmError> {
        let max_attempts = self.options.max_attempts.max(1) as usize;
        let delays = Fixed::from(self.options.backoff).take(max_attempts - 1);

        retry_with_index(delays, |_| self.try_snapshot()).map_err(|e| match e.error {
            ShmError::InconsistentSnapshot { .. } => {
                warn!(
                    "No consistent read of the SHM segment after {} attempts",
                    e.tries
                );
                ShmError::InconsistentSnapshot { attempts: e.tries }
            }
            other => other,
        })
    }

    /// A single pass of the read-validate protocol.
    fn try_snapshot(&self) -> OperationResult<Snapshot, ShmError> {
        let dirty = ShmError::InconsistentSnapshot { attempts: 0 };

        let first_gen = match self.segment.load_u16(GENERATION_OFFSET) {
            Ok(gen) => gen,
            Err(e) => return OperationResult::Err(e),
        };

        // A generation of 0 is never written once the segment holds data: the writer has not
        // published anything yet.
        if first_gen == 0 {
            return OperationResult::Err(ShmError::SegmentNotInitialized);
        }

        // An odd generation means the writer is in the middle of an update.
        if first_gen & 0x0001 == 1 {
            return OperationResult::Retry(dirty);
        }

        let mut buf = [0u8; MIN_SEGMENT_SIZE];
        if let Err(e) = self.segment.read_bytes(0, &mut buf) {
            return OperationResult::Err(e);
        }

        // Keep the reads of the data above from being reordered after the second generation load.
        atomic::fence(atomic::Ordering::Acquire);

        let second_gen = match self.segment.load_u16(GENERATION_OFFSET) {
            Ok(gen) => gen,
            Err(e) => return OperationResult::Err(e),
        };
        if second_gen != first_gen {
            return OperationResult::Retry(dirty);
        }

        match Snapshot::parse(&buf, first_gen) {
            Ok(snapshot) => OperationResult::Ok(snapshot),
            Err(e) => OperationResult::Err(e),
        }
    }
}
