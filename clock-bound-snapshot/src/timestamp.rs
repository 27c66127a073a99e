// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use nix::sys::time::TimeSpec;
use std::fmt;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// The largest instant a Timestamp can represent, expressed in nanoseconds since the epoch.
const MAX_TOTAL_NANOS: u128 = u64::MAX as u128 * NANOS_PER_SEC + (NANOS_PER_SEC - 1);

/// An instant expressed in seconds and nanoseconds since the Unix epoch.
///
/// The nanoseconds are always normalized to be less than a second, which makes the derived
/// ordering (seconds first, then nanoseconds) the chronological one. Arithmetic saturates at the
/// epoch and at the largest representable instant instead of wrapping.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    secs: u64,
    nanos: u32,
}

impl Timestamp {
    /// Build a Timestamp from seconds and nanoseconds.
    ///
    /// The segment stores nanoseconds over 64 bits, so `nanos` may exceed a second. The excess is
    /// carried over into seconds, saturating if it does not fit.
    pub fn new(secs: u64, nanos: u64) -> Timestamp {
        let total = secs as u128 * NANOS_PER_SEC + nanos as u128;
        Timestamp::from_total_nanos(total)
    }

    pub fn secs(&self) -> u64 {
        self.secs
    }

    pub fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    /// Nanoseconds elapsed since the epoch.
    pub fn as_nanos(&self) -> u128 {
        self.secs as u128 * NANOS_PER_SEC + self.nanos as u128
    }

    /// Add `nanos` nanoseconds, clamping at the largest representable instant.
    pub fn saturating_add_nanos(&self, nanos: u64) -> Timestamp {
        Timestamp::from_total_nanos(self.as_nanos() + nanos as u128)
    }

    /// Subtract `nanos` nanoseconds, clamping at the epoch.
    pub fn saturating_sub_nanos(&self, nanos: u64) -> Timestamp {
        Timestamp::from_total_nanos(self.as_nanos().saturating_sub(nanos as u128))
    }

    fn from_total_nanos(total: u128) -> Timestamp {
        let total = total.min(MAX_TOTAL_NANOS);
        Timestamp {
            secs: (total / NANOS_PER_SEC) as u64,
            nanos: (total % NANOS_PER_SEC) as u32,
        }
    }
}

impl From<Timestamp> for TimeSpec {
    /// Convert to a TimeSpec. Seconds beyond `i64::MAX` saturate.
    fn from(ts: Timestamp) -> TimeSpec {
        let secs = i64::try_from(ts.secs).unwrap_or(i64::MAX);
        TimeSpec::new(secs, ts.nanos as i64)
    }
}

impl From<TimeSpec> for Timestamp {
    /// Convert from a TimeSpec. Instants before the epoch clamp to the epoch.
    fn from(ts: TimeSpec) -> Timestamp {
        match (u64::try_from(ts.tv_sec()), u64::try_from(ts.tv_nsec())) {
            (Ok(secs), Ok(nanos)) => Timestamp::new(secs, nanos),
            _ => Timestamp::default(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:0>9}", self.secs, self.nanos)
    }
}
