// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Layout of the ClockBound shared memory segment.
//!
//! The segment is a fixed sequence of little-endian fields. This is a compatibility contract with
//! the ClockBound daemon writing the segment and must not change without a version bump.
//!
//! ```text
//!  0 magic               [u32; 2]
//!  8 total_size          u32
//! 12 version             u16
//! 14 generation          u16
//! 16 as_of_sec           u64
//! 24 as_of_nsec          u64
//! 32 void_after_sec      u64
//! 40 void_after_nsec     u64
//! 48 bound_nsec          u64
//! 56 max_drift_ppb       u32
//! 60 reserved            u32
//! 64 clock_status        u32
//! ```

/// Default path of the ClockBound shared memory segment.
pub const CLOCKBOUND_SHM_DEFAULT_PATH: &str = "/var/run/clockbound/shm";

/// The magic number that identifies a ClockBound shared memory segment.
pub const SHM_MAGIC: [u32; 2] = [0x414D5A4E, 0x43420200];

/// The most recent layout version this reader understands.
pub const CLOCKBOUND_SHM_SUPPORTED_VERSION: u16 = 1;

pub const MAGIC_OFFSET: usize = 0;
pub const TOTAL_SIZE_OFFSET: usize = 8;
pub const VERSION_OFFSET: usize = 12;
pub const GENERATION_OFFSET: usize = 14;
pub const AS_OF_SEC_OFFSET: usize = 16;
pub const AS_OF_NSEC_OFFSET: usize = 24;
pub const VOID_AFTER_SEC_OFFSET: usize = 32;
pub const VOID_AFTER_NSEC_OFFSET: usize = 40;
pub const BOUND_NSEC_OFFSET: usize = 48;
pub const MAX_DRIFT_PPB_OFFSET: usize = 56;
pub const RESERVED_OFFSET: usize = 60;
pub const CLOCK_STATUS_OFFSET: usize = 64;

/// Size of the header, ie. everything up to and including the generation number.
pub const HEADER_SIZE: usize = 16;

/// Smallest segment holding every field this reader consumes.
pub const MIN_SEGMENT_SIZE: usize = 68;

#[cfg(any(test, feature = "writer"))]
pub use image::SegmentImage;

#[cfg(any(test, feature = "writer"))]
mod image {
    use super::*;
    use crate::ClockStatus;
    use byteorder::{ByteOrder, LittleEndian};

    /// The full content of a segment, as written by a producer.
    ///
    /// Every field is public so tests can describe well-formed as well as broken segments.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SegmentImage {
        pub magic: [u32; 2],
        pub total_size: u32,
        pub version: u16,
        pub generation: u16,
        pub as_of_sec: u64,
        pub as_of_nsec: u64,
        pub void_after_sec: u64,
        pub void_after_nsec: u64,
        pub bound_nsec: u64,
        pub max_drift_ppb: u32,
        pub reserved: u32,
        pub clock_status: u32,
    }

    impl Default for SegmentImage {
        /// A valid, initialized segment with zeroed clock error bound data.
        fn default() -> Self {
            SegmentImage {
                magic: SHM_MAGIC,
                total_size: MIN_SEGMENT_SIZE as u32,
                version: CLOCKBOUND_SHM_SUPPORTED_VERSION,
                generation: 2,
                as_of_sec: 0,
                as_of_nsec: 0,
                void_after_sec: 0,
                void_after_nsec: 0,
                bound_nsec: 0,
                max_drift_ppb: 0,
                reserved: 0,
                clock_status: ClockStatus::Unknown as u32,
            }
        }
    }

    impl SegmentImage {
        /// Encode the image into the little-endian segment layout.
        pub fn to_bytes(&self) -> [u8; MIN_SEGMENT_SIZE] {
            let mut buf = [0u8; MIN_SEGMENT_SIZE];
            LittleEndian::write_u32(&mut buf[MAGIC_OFFSET..], self.magic[0]);
            LittleEndian::write_u32(&mut buf[MAGIC_OFFSET + 4..], self.magic[1]);
            LittleEndian::write_u32(&mut buf[TOTAL_SIZE_OFFSET..], self.total_size);
            LittleEndian::write_u16(&mut buf[VERSION_OFFSET..], self.version);
            LittleEndian::write_u16(&mut buf[GENERATION_OFFSET..], self.generation);
            LittleEndian::write_u64(&mut buf[AS_OF_SEC_OFFSET..], self.as_of_sec);
            LittleEndian::write_u64(&mut buf[AS_OF_NSEC_OFFSET..], self.as_of_nsec);
            LittleEndian::write_u64(&mut buf[VOID_AFTER_SEC_OFFSET..], self.void_after_sec);
            LittleEndian::write_u64(&mut buf[VOID_AFTER_NSEC_OFFSET..], self.void_after_nsec);
            LittleEndian::write_u64(&mut buf[BOUND_NSEC_OFFSET..], self.bound_nsec);
            LittleEndian::write_u32(&mut buf[MAX_DRIFT_PPB_OFFSET..], self.max_drift_ppb);
            LittleEndian::write_u32(&mut buf[RESERVED_OFFSET..], self.reserved);
            LittleEndian::write_u32(&mut buf[CLOCK_STATUS_OFFSET..], self.clock_status);
            buf
        }
    }
}
