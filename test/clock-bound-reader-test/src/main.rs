// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::Parser;
use clock_bound_reader::{
    BoundedNow, ClockBoundClient, ClockBoundError, ClockStatus, Snapshot, Timestamp,
    CLOCKBOUND_SHM_DEFAULT_PATH,
};
use clock_bound_snapshot::common::realtime_now;
use std::thread;
use std::time::Duration;
use tracing::{debug, Level};

/// Poll the ClockBound shared memory segment and print the bound on the current time.
#[derive(Parser, Debug)]
#[command(author, name = "clock-bound-reader-test", version, about, long_about = None)]
struct Cli {
    /// Path to the ClockBound shared memory segment.
    #[arg(long, env = "CLOCKBOUND_SHM_PATH", default_value = CLOCKBOUND_SHM_DEFAULT_PATH)]
    shm_path: String,

    /// Pause between two reads, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Number of reads before exiting. Runs until interrupted if not set.
    #[arg(long)]
    count: Option<u64>,

    /// Minimum level of the log messages written to stderr.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Write log messages as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_level, args.json);

    let clockbound = ClockBoundClient::new_with_path(&args.shm_path)
        .map_err(|e| report("ClockBoundClient::new_with_path() failed", e))
        .with_context(|| format!("cannot read ClockBound segment at {}", args.shm_path))?;

    // Type Ctrl-C to send a SIGINT and quit the program when no count is given.
    let mut reads = 0;
    loop {
        if tracing::enabled!(Level::DEBUG) {
            let snapshot = clockbound
                .snapshot()
                .map_err(|e| report("ClockBoundClient::snapshot() failed", e))?;
            debug!("{}", format_snapshot(&snapshot));
        }

        let now = clockbound
            .now()
            .map_err(|e| report("ClockBoundClient::now() failed", e))?;
        let local = realtime_now().context("failed to read the local realtime clock")?;
        println!("{}", describe(&now, local));

        reads += 1;
        if matches!(args.count, Some(count) if reads >= count) {
            break;
        }
        thread::sleep(Duration::from_millis(args.interval_ms));
    }

    clockbound
        .close()
        .map_err(|e| report("ClockBoundClient::close() failed", e))?;
    debug!("Released ClockBound segment after {reads} reads");
    Ok(())
}

fn init_tracing(level: Level, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Print the ClockBound error details, and hand the error back for propagation.
fn report(detail: &str, error: ClockBoundError) -> ClockBoundError {
    eprintln!("{detail} {:?}", error);
    error
}

fn describe(now: &BoundedNow, local: Timestamp) -> String {
    let position = if now.contains(local) {
        "inside"
    } else {
        "outside"
    };
    let width = now.latest.as_nanos().saturating_sub(now.earliest.as_nanos());
    format!(
        "When now() was called true time was somewhere within {} and {} seconds since Jan 1 1970. \
         Best estimate is {}, the interval spans {} ns. \
         The clock status is {}. The local clock read {}, {} this interval.",
        now.earliest,
        now.latest,
        now.midpoint(),
        width,
        format_clock_status(&now.status),
        local,
        position
    )
}

/// Dump the content of the segment, as published by the writer.
fn format_snapshot(snapshot: &Snapshot) -> String {
    format!(
        "Segment version {}, generation {}: as_of {}, void_after {}, bound {} ns, \
         max drift {} ppb, clock status {} ({})",
        snapshot.version(),
        snapshot.generation(),
        snapshot.as_of(),
        snapshot.void_after(),
        snapshot.bound_nsec(),
        snapshot.max_drift_ppb(),
        snapshot.raw_status(),
        format_clock_status(&snapshot.clock_status()),
    )
}

fn format_clock_status(clock_status: &ClockStatus) -> &str {
    match clock_status {
        ClockStatus::Unknown => "Unknown",
        ClockStatus::Synchronized => "Synchronized",
        ClockStatus::FreeRunning => "FreeRunning",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock_bound_reader::ClockBoundErrorKind;
    use clock_bound_snapshot::{SegmentImage, ShmWrite, ShmWriter};
    use errno::Errno;
    use tempfile::NamedTempFile;

    #[test]
    fn test_report_returns_error() {
        let clock_bound_error = ClockBoundError {
            kind: ClockBoundErrorKind::SegmentNotInitialized,
            errno: Errno(9999),
            detail: "ClockBound daemon not running".to_string(),
        };

        let returned = report("Some details about the error", clock_bound_error.clone());
        assert_eq!(returned, clock_bound_error);
    }

    #[test]
    fn test_format_clock_status() {
        assert_eq!(format_clock_status(&ClockStatus::Unknown), "Unknown");
        assert_eq!(
            format_clock_status(&ClockStatus::Synchronized),
            "Synchronized"
        );
        assert_eq!(format_clock_status(&ClockStatus::FreeRunning), "FreeRunning");
    }

    #[test]
    fn test_describe_local_clock_position() {
        let now = BoundedNow {
            earliest: Timestamp::new(1_699_999_999, 995_000_000),
            latest: Timestamp::new(1_700_000_000, 5_000_000),
            status: ClockStatus::Synchronized,
        };

        let inside = describe(&now, Timestamp::new(1_700_000_000, 0));
        assert!(inside.contains("within 1699999999.995000000 and 1700000000.005000000"));
        assert!(inside.contains(
            "Best estimate is 1700000000.000000000, the interval spans 10000000 ns."
        ));
        assert!(inside.contains("The clock status is Synchronized."));
        assert!(inside.ends_with("1700000000.000000000, inside this interval."));

        let outside = describe(&now, Timestamp::new(1_700_000_001, 0));
        assert!(outside.ends_with("outside this interval."));
    }

    #[test]
    fn test_format_snapshot() {
        let file = NamedTempFile::new().expect("create clockbound file failed");
        let mut writer = ShmWriter::new(file.path()).expect("Failed to create a writer");
        writer.write(&SegmentImage {
            as_of_sec: 1_700_000_000,
            void_after_sec: 1_700_000_010,
            bound_nsec: 5_000_000,
            max_drift_ppb: 15_000,
            clock_status: ClockStatus::FreeRunning as u32,
            ..Default::default()
        });

        let path = file.path().to_str().expect("tempfile path not utf-8");
        let client = ClockBoundClient::new_with_path(path).expect("new_with_path failed");
        let snapshot = client.snapshot().expect("snapshot failed");

        assert_eq!(
            format_snapshot(&snapshot),
            "Segment version 1, generation 2: as_of 1700000000.000000000, \
             void_after 1700000010.000000000, bound 5000000 ns, max drift 15000 ppb, \
             clock status 2 (FreeRunning)"
        );
    }

    #[test]
    fn test_cli_defaults() {
        let args = Cli::try_parse_from(["clock-bound-reader-test", "--count", "3"])
            .expect("failed to parse arguments");
        assert_eq!(args.interval_ms, 1000);
        assert_eq!(args.count, Some(3));
        assert_eq!(args.log_level, Level::INFO);
        assert!(!args.json);
    }
}
