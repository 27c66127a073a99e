// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{syserror, ShmError, Timestamp};
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};

pub const CLOCK_REALTIME: ClockId = ClockId::CLOCK_REALTIME;

// This primarily for development convenience
#[cfg(target_os = "macos")]
pub const CLOCK_MONOTONIC: ClockId = ClockId::CLOCK_MONOTONIC;
#[cfg(not(target_os = "macos"))]
pub const CLOCK_MONOTONIC: ClockId = ClockId::CLOCK_MONOTONIC_COARSE;

/// Read a specific view of time
///
/// This function wraps the `clock_gettime()` system call to conveniently return the current time
/// tracked by a specific clock.
///
/// The clock_id is one of ClockId::CLOCK_REALTIME, ClockId::CLOCK_MONOTONIC, etc.
pub fn clock_gettime_safe(clock_id: ClockId) -> Result<TimeSpec, ShmError> {
    match clock_gettime(clock_id) {
        Ok(ts) => Ok(ts),
        _ => syserror!(SyscallError, "clock_gettime"),
    }
}

/// Read the local realtime clock as a Timestamp.
///
/// This is the clock the ClockBound interval brackets. A clock set before the epoch reads as the
/// epoch.
pub fn realtime_now() -> Result<Timestamp, ShmError> {
    clock_gettime_safe(CLOCK_REALTIME).map(Timestamp::from)
}
