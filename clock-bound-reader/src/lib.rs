// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A client library to read the bound on clock error published by the ClockBound daemon. This
//! client library is written in pure Rust.
//!
//! # Usage
//!
//! The ClockBound reader requires the ClockBound daemon to be running and publishing its shared
//! memory segment. The reader maps the segment read-only and never talks to the daemon.
//!
//! For Rust programs built with Cargo, add "clock-bound-reader" as a dependency in your
//! Cargo.toml.
//!
//! ```text
//! [dependencies]
//! clock-bound-reader = "2.0"
//! ```
//!
//! Then obtain a bound on the current time:
//!
//! ```no_run
//! use clock_bound_reader::{ClockBoundClient, ClockStatus};
//!
//! let client = ClockBoundClient::new().expect("ClockBound segment not available");
//! let now = client.now().expect("Failed to read ClockBound segment");
//! if now.status == ClockStatus::Synchronized {
//!     println!("true time is within [{}, {}]", now.earliest, now.latest);
//! }
//! client.close().expect("Failed to release ClockBound segment");
//! ```
//!
//! A client can be shared between threads, or each thread can open its own.
use clock_bound_snapshot::{Region, SnapshotReader};
use errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

pub use clock_bound_snapshot::layout::CLOCKBOUND_SHM_DEFAULT_PATH;
pub use clock_bound_snapshot::{
    BoundedNow, ClockStatus, ReaderOptions, ShmError, Snapshot, Timestamp,
};

/// Options to open a ClockBoundClient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Path to the shared memory segment written by the ClockBound daemon.
    pub shm_path: PathBuf,

    /// Retry policy used when the segment is being updated while read.
    pub reader: ReaderOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            shm_path: PathBuf::from(CLOCKBOUND_SHM_DEFAULT_PATH),
            reader: ReaderOptions::default(),
        }
    }
}

#[derive(Debug)]
pub struct ClockBoundClient {
    reader: SnapshotReader<Region>,
}

impl ClockBoundClient {
    /// Creates and returns a new ClockBoundClient.
    ///
    /// The creation process also initializes a shared memory reader
    /// with the shared memory default path that is used by
    /// the ClockBound daemon.
    pub fn new() -> Result<ClockBoundClient, ClockBoundError> {
        ClockBoundClient::with_options(ClientOptions::default())
    }

    /// Creates and returns a new ClockBoundClient, specifying a shared
    /// memory path that is being used by the ClockBound daemon.
    pub fn new_with_path(shm_path: &str) -> Result<ClockBoundClient, ClockBoundError> {
        ClockBoundClient::with_options(ClientOptions {
            shm_path: PathBuf::from(shm_path),
            ..Default::default()
        })
    }

    /// Creates and returns a new ClockBoundClient with explicit options.
    ///
    /// The segment is validated on open: it must be large enough and carry the ClockBound magic
    /// number. On failure, everything acquired so far is released.
    pub fn with_options(options: ClientOptions) -> Result<ClockBoundClient, ClockBoundError> {
        let region = Region::open(&options.shm_path)?;
        let reader = SnapshotReader::new(region, options.reader)?;
        Ok(ClockBoundClient { reader })
    }

    /// Obtains the clock error bound and clock status at the current moment.
    ///
    /// Either a complete, consistent answer is returned, or an error. The status is `Unknown`
    /// whenever the published data is past its validity horizon.
    pub fn now(&self) -> Result<BoundedNow, ClockBoundError> {
        let snapshot = self.reader.snapshot()?;
        Ok(snapshot.bounded_now())
    }

    /// Return a consistent copy of the data published in the segment, as is.
    ///
    /// Meant for diagnostics: the status in the snapshot does not account for staleness. Use
    /// `now()` to obtain a bound on the current time, or `Snapshot::bounded_now()` to resolve the
    /// snapshot returned here.
    pub fn snapshot(&self) -> Result<Snapshot, ClockBoundError> {
        Ok(self.reader.snapshot()?)
    }

    /// Release the shared memory segment.
    ///
    /// Dropping the client also releases the segment, but silently.
    pub fn close(self) -> Result<(), ClockBoundError> {
        self.reader.into_segment().close()?;
        Ok(())
    }
}

#[derive(Hash, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ClockBoundErrorKind {
    /// The segment could not be opened or mapped, the errno field carries the details.
    Open,
    /// The segment could not be released, the errno field carries the details.
    Close,
    /// Another system call failed, the errno field carries the details.
    Syscall,
    /// The daemon has not published data yet.
    SegmentNotInitialized,
    /// The segment is not a ClockBound segment, or is too small.
    SegmentMalformed,
    /// The segment layout is more recent than this library.
    SegmentVersionNotSupported,
    /// The segment kept changing while being read.
    InconsistentSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {detail}")]
pub struct ClockBoundError {
    pub kind: ClockBoundErrorKind,
    pub errno: Errno,
    pub detail: String,
}

impl From<ShmError> for ClockBoundError {
    fn from(value: ShmError) -> Self {
        let kind = match value {
            ShmError::OpenFailed(..) => ClockBoundErrorKind::Open,
            ShmError::CloseFailed(..) => ClockBoundErrorKind::Close,
            ShmError::SyscallError(..) => ClockBoundErrorKind::Syscall,
            ShmError::SegmentNotInitialized => ClockBoundErrorKind::SegmentNotInitialized,
            ShmError::OutOfRange { .. }
            | ShmError::UnsupportedFormat { .. }
            | ShmError::TruncatedRegion { .. } => ClockBoundErrorKind::SegmentMalformed,
            ShmError::UnsupportedVersion { .. } => ClockBoundErrorKind::SegmentVersionNotSupported,
            ShmError::InconsistentSnapshot { .. } => ClockBoundErrorKind::InconsistentSnapshot,
        };

        let (errno, detail) = match value {
            ShmError::OpenFailed(errno, origin)
            | ShmError::CloseFailed(errno, origin)
            | ShmError::SyscallError(errno, origin) => {
                (errno, origin.to_string_lossy().into_owned())
            }
            other => (Errno(0), other.to_string()),
        };

        ClockBoundError {
            kind,
            errno,
            detail,
        }
    }
}
