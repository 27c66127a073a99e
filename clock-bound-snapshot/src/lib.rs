// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! ClockBound Snapshot
//!
//! This crate implements the reader side of the ClockBound shared memory segment. The ClockBound
//! daemon periodically overwrites a small fixed-layout segment with a bound on clock error and a
//! clock status. Any number of local processes can map the segment read-only and derive an
//! (earliest, latest) interval within which true time exists, without talking to the daemon.
//!
//! The crate is organized leaf-first:
//! - `layout`: byte offsets and constants of the segment.
//! - `region`: the read-only memory mapping and bounds-checked access to it.
//! - `reader`: the generation-counter protocol producing torn-read-free `Snapshot` values.
//! - `resolver`: turns a `Snapshot` into a `BoundedNow`, applying the staleness rule.
//!
//! The `writer` feature adds a producer used by tests and tooling. It is not the daemon.

pub use crate::reader::{ReaderOptions, Snapshot, SnapshotReader};
pub use crate::region::{Region, ShmSegment};
pub use crate::resolver::BoundedNow;
pub use crate::timestamp::Timestamp;
#[cfg(any(test, feature = "writer"))]
pub use crate::layout::SegmentImage;
#[cfg(any(test, feature = "writer"))]
pub use crate::writer::{ShmWrite, ShmWriter};

pub mod common;
pub mod layout;
mod reader;
mod region;
mod resolver;
mod timestamp;
#[cfg(any(test, feature = "writer"))]
mod writer;

use errno::Errno;
use std::ffi::CStr;
use std::str::FromStr;
use thiserror::Error;

/// Convenience macro to build a ShmError variant carrying errno and custom origin information.
///
/// The errno value is read from the last failed system call, unless given explicitly.
#[macro_export]
macro_rules! syserror {
    ($variant:ident, $origin:expr) => {
        $crate::syserror!($variant, $origin, ::errno::errno())
    };
    ($variant:ident, $origin:expr, $errno:expr) => {
        Err($crate::ShmError::$variant(
            $errno,
            ::std::ffi::CStr::from_bytes_with_nul(concat!($origin, "\0").as_bytes()).unwrap(),
        ))
    };
}

/// Error condition returned by all low-level ClockBound snapshot APIs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Error)]
pub enum ShmError {
    /// The backing file could not be opened or memory mapped.
    /// Variant includes the Errno struct with error details, and the origin of the failure.
    #[error("failed to open SHM segment, {1:?}: {0:?}")]
    OpenFailed(Errno, &'static CStr),

    /// An access fell outside of the mapped segment. This is a defect, not a runtime condition.
    #[error("access of {length} bytes at offset {offset} is outside the {segsize} bytes segment")]
    OutOfRange {
        offset: usize,
        length: usize,
        segsize: usize,
    },

    /// The segment does not carry the ClockBound magic number.
    #[error("SHM segment magic number {magic:#x?} is not supported")]
    UnsupportedFormat { magic: [u32; 2] },

    /// The segment layout version is more recent than what this reader understands.
    #[error("SHM segment has version {version}, the highest supported version is {supported}")]
    UnsupportedVersion { version: u16, supported: u16 },

    /// The segment, or its declared size, is too small to hold the fields read.
    #[error("SHM segment size of {size} bytes is smaller than the {minimum} bytes required")]
    TruncatedRegion { size: usize, minimum: usize },

    /// The writer has created the segment but not published any data yet.
    #[error("SHM segment is not initialized")]
    SegmentNotInitialized,

    /// No consistent snapshot could be read before running out of attempts.
    #[error("no consistent snapshot after {attempts} attempts")]
    InconsistentSnapshot { attempts: u64 },

    /// Releasing the memory mapping or the file descriptor failed.
    #[error("failed to release SHM segment, {1:?}: {0:?}")]
    CloseFailed(Errno, &'static CStr),

    /// A system call unrelated to the segment lifecycle failed.
    #[error("system call failed, {1:?}: {0:?}")]
    SyscallError(Errno, &'static CStr),
}

/// Definition of mutually exclusive clock status exposed to the reader.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ClockStatus {
    /// The status of the clock is unknown.
    Unknown = 0,

    /// The clock is kept accurate by the synchronization daemon.
    Synchronized = 1,

    /// The clock is free running and not updated by the synchronization daemon.
    FreeRunning = 2,
}

impl ClockStatus {
    /// Interpret a raw status code read from the segment.
    ///
    /// Codes this reader does not know about carry no guarantee, and map to `Unknown`.
    pub fn from_code(code: u32) -> ClockStatus {
        ClockStatus::try_from(code).unwrap_or(ClockStatus::Unknown)
    }
}

/// Custom struct used for indicating an unknown clock status code or name.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ParseError;

impl TryFrom<u32> for ClockStatus {
    type Error = ParseError;
    fn try_from(code: u32) -> Result<ClockStatus, Self::Error> {
        match code {
            0 => Ok(ClockStatus::Unknown),
            1 => Ok(ClockStatus::Synchronized),
            2 => Ok(ClockStatus::FreeRunning),
            _ => Err(ParseError),
        }
    }
}

impl FromStr for ClockStatus {
    type Err = ParseError;
    fn from_str(input: &str) -> Result<ClockStatus, Self::Err> {
        match input {
            "Unknown" => Ok(ClockStatus::Unknown),
            "Synchronized" => Ok(ClockStatus::Synchronized),
            "FreeRunning" => Ok(ClockStatus::FreeRunning),
            _ => Err(ParseError),
        }
    }
}
