// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{info, Level};

use clock_bound_snapshot::common::realtime_now;
use clock_bound_snapshot::layout::CLOCKBOUND_SHM_DEFAULT_PATH;
use clock_bound_snapshot::{ClockStatus, SegmentImage, ShmWrite, ShmWriter, Timestamp};

/// CLI arguments are the possible field values that can be set in the ClockBound shared memory
/// segment.
#[derive(Parser, Debug)]
#[command(author, name = "snapshot-updater", version, about, long_about = None)]
struct Cli {
    /// Path to the ClockBound shared memory segment.
    #[arg(long, env = "CLOCKBOUND_SHM_PATH", default_value = CLOCKBOUND_SHM_DEFAULT_PATH)]
    shm_path: String,

    /// As-of time: seconds since the epoch. Defaults to the local realtime clock.
    #[arg(long)]
    as_of_sec: Option<u64>,

    /// As-of time: nanoseconds. Defaults to the local realtime clock.
    #[arg(long)]
    as_of_nsec: Option<u64>,

    /// Validity of the data past the as-of time, in milliseconds.
    ///
    /// Ignored if void_after_sec is set.
    #[arg(long, default_value_t = 10_000)]
    validity_ms: u64,

    /// Void-after time: seconds since the epoch.
    #[arg(long)]
    void_after_sec: Option<u64>,

    /// Void-after time: nanoseconds.
    #[arg(long, requires = "void_after_sec")]
    void_after_nsec: Option<u64>,

    /// Bound on clock error, in nanoseconds.
    #[arg(long, default_value_t = 1_000_000)]
    bound_nsec: u64,

    /// Maximum drift rate of the clock, in parts per billion.
    #[arg(long, default_value_t = 15_000)]
    max_drift_ppb: u32,

    /// Clock Status.
    ///
    /// The clock status indicates whether the clock is synchronized,
    /// free-running, etc.
    ///
    /// Maps to enum ClockStatus.
    #[arg(long, default_value = "Synchronized")]
    clock_status: String,

    /// Layout version written in the header. Other values than the supported one let testing
    /// how readers handle a version they do not know.
    #[arg(long)]
    layout_version: Option<u16>,

    /// Minimum level of the log messages written to stderr.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

/// Build the segment image described by the CLI arguments.
///
/// `local` is the local realtime clock, used when no as-of time is given.
fn build_image(args: &Cli, local: Timestamp) -> anyhow::Result<SegmentImage> {
    let clock_status = ClockStatus::from_str(args.clock_status.as_str()).map_err(|e| {
        anyhow!(
            "Failed to convert clock_status argument '{}' to a ClockStatus. {:?}",
            args.clock_status,
            e
        )
    })?;

    let as_of = Timestamp::new(
        args.as_of_sec.unwrap_or(local.secs()),
        args.as_of_nsec.unwrap_or(u64::from(local.subsec_nanos())),
    );

    let void_after = match args.void_after_sec {
        Some(secs) => Timestamp::new(secs, args.void_after_nsec.unwrap_or(0)),
        None => as_of.saturating_add_nanos(args.validity_ms.saturating_mul(1_000_000)),
    };

    let mut image = SegmentImage {
        as_of_sec: as_of.secs(),
        as_of_nsec: u64::from(as_of.subsec_nanos()),
        void_after_sec: void_after.secs(),
        void_after_nsec: u64::from(void_after.subsec_nanos()),
        bound_nsec: args.bound_nsec,
        max_drift_ppb: args.max_drift_ppb,
        clock_status: clock_status as u32,
        ..Default::default()
    };
    if let Some(version) = args.layout_version {
        image.version = version;
    }

    Ok(image)
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .init();

    let local = realtime_now().context("failed to read the local realtime clock")?;
    let image = build_image(&args, local)?;

    let mut writer = ShmWriter::new(Path::new(&args.shm_path))
        .with_context(|| format!("ShmWriter::new() failed for {}", args.shm_path))?;
    writer.write(&image);

    info!(generation = writer.generation(), "Published segment image");
    println!(
        "Successfully wrote the following SegmentImage to the ClockBound shared memory segment: {:?}",
        image
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock_bound_snapshot::{ReaderOptions, Region, SnapshotReader};
    use tempfile::NamedTempFile;

    fn parse(extra: &[&str]) -> Cli {
        let mut argv = vec!["snapshot-updater"];
        argv.extend_from_slice(extra);
        Cli::try_parse_from(argv).expect("failed to parse arguments")
    }

    #[test]
    fn test_build_image_defaults_to_local_clock() {
        let args = parse(&[]);
        let local = Timestamp::new(1_700_000_000, 250);

        let image = build_image(&args, local).expect("build_image failed");

        assert_eq!(image.as_of_sec, 1_700_000_000);
        assert_eq!(image.as_of_nsec, 250);
        assert_eq!(image.void_after_sec, 1_700_000_010);
        assert_eq!(image.void_after_nsec, 250);
        assert_eq!(image.bound_nsec, 1_000_000);
        assert_eq!(image.clock_status, ClockStatus::Synchronized as u32);
        assert_eq!(image.version, SegmentImage::default().version);
    }

    #[test]
    fn test_build_image_overrides() {
        let args = parse(&[
            "--as-of-sec",
            "1700000000",
            "--as-of-nsec",
            "0",
            "--void-after-sec",
            "1699999999",
            "--bound-nsec",
            "5000000",
            "--clock-status",
            "FreeRunning",
            "--layout-version",
            "2",
        ]);

        let image = build_image(&args, Timestamp::default()).expect("build_image failed");

        assert_eq!(image.as_of_sec, 1_700_000_000);
        assert_eq!(image.void_after_sec, 1_699_999_999);
        assert_eq!(image.void_after_nsec, 0);
        assert_eq!(image.bound_nsec, 5_000_000);
        assert_eq!(image.clock_status, ClockStatus::FreeRunning as u32);
        assert_eq!(image.version, 2);
    }

    #[test]
    fn test_build_image_rejects_unknown_status() {
        let args = parse(&["--clock-status", "Disrupted"]);
        assert!(build_image(&args, Timestamp::default()).is_err());
    }

    #[test]
    fn test_published_image_is_readable() {
        let tempfile = NamedTempFile::new().expect("create clockbound file failed");
        let args = parse(&["--as-of-sec", "1700000000", "--as-of-nsec", "0"]);
        let image = build_image(&args, Timestamp::default()).expect("build_image failed");

        let mut writer = ShmWriter::new(tempfile.path()).expect("Failed to create a writer");
        writer.write(&image);

        let region = Region::open(tempfile.path()).expect("Failed to open region");
        let reader = SnapshotReader::new(region, ReaderOptions::default()).expect("reader");
        let now = reader.snapshot().expect("snapshot failed").bounded_now();
        assert_eq!(now.earliest, Timestamp::new(1_699_999_999, 999_000_000));
        assert_eq!(now.latest, Timestamp::new(1_700_000_000, 1_000_000));
        assert_eq!(now.status, ClockStatus::Synchronized);
    }
}
