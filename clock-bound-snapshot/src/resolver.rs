// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::reader::Snapshot;
use crate::{ClockStatus, Timestamp};

/// A bound on the current time: true time is within `[earliest, latest]`.
///
/// The interval is centered on the `as_of` instant of the snapshot it was resolved from. The
/// status is the one published by the writer, unless the interval reaches past the instant the
/// data was declared void after, in which case no guarantee holds and the status is `Unknown`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BoundedNow {
    pub earliest: Timestamp,
    pub latest: Timestamp,
    pub status: ClockStatus,
}

impl BoundedNow {
    /// Whether `ts` falls within the interval, bounds included.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.earliest <= ts && ts <= self.latest
    }

    /// Best estimate of true time, halfway between both bounds.
    pub fn midpoint(&self) -> Timestamp {
        let half_width = self.latest.as_nanos().saturating_sub(self.earliest.as_nanos()) / 2;
        self.earliest
            .saturating_add_nanos(u64::try_from(half_width).unwrap_or(u64::MAX))
    }
}

impl From<&Snapshot> for BoundedNow {
    fn from(snapshot: &Snapshot) -> BoundedNow {
        let earliest = snapshot.as_of.saturating_sub_nanos(snapshot.bound_nsec);
        let latest = snapshot.as_of.saturating_add_nanos(snapshot.bound_nsec);

        let status = if latest > snapshot.void_after {
            ClockStatus::Unknown
        } else {
            snapshot.clock_status()
        };

        BoundedNow {
            earliest,
            latest,
            status,
        }
    }
}

impl Snapshot {
    /// Resolve the snapshot into a bound on the current time.
    pub fn bounded_now(&self) -> BoundedNow {
        BoundedNow::from(self)
    }
}
