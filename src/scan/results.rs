//! Scan result record
//!
//! The aggregate produced by one scan: latency histogram, unreadable
//! blocks, throughput and seek statistics.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::time::Duration;

use humansize::{BINARY, format_size};
use serde::Serialize;

use crate::reader::ReadPath;

/// Number of latency buckets
pub const BUCKET_COUNT: usize = 6;

/// Elapsed-time class of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LatencyBucket {
    /// Under 3 ms
    Under3ms,
    /// 3 ms up to 10 ms
    Under10ms,
    /// 10 ms up to 50 ms
    Under50ms,
    /// 50 ms up to 150 ms
    Under150ms,
    /// 150 ms up to 500 ms
    Under500ms,
    /// 500 ms and above
    Over500ms,
}

impl LatencyBucket {
    /// All buckets, fastest first
    pub const ALL: [Self; BUCKET_COUNT] = [
        Self::Under3ms,
        Self::Under10ms,
        Self::Under50ms,
        Self::Under150ms,
        Self::Under500ms,
        Self::Over500ms,
    ];

    /// Returns the bucket a read of the given duration falls into
    pub fn for_duration(elapsed: Duration) -> Self {
        match elapsed.as_millis() {
            0..3 => Self::Under3ms,
            3..10 => Self::Under10ms,
            10..50 => Self::Under50ms,
            50..150 => Self::Under150ms,
            150..500 => Self::Under500ms,
            _ => Self::Over500ms,
        }
    }

    /// Returns the position of this bucket in [`ScanResults::buckets`]
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Returns a short label for reports
    pub fn label(self) -> &'static str {
        match self {
            Self::Under3ms => "<3ms",
            Self::Under10ms => "<10ms",
            Self::Under50ms => "<50ms",
            Self::Under150ms => "<150ms",
            Self::Under500ms => "<500ms",
            Self::Over500ms => ">=500ms",
        }
    }
}

/// How a scan ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Termination {
    /// Every block and every seek probe was processed
    Completed,
    /// The abort flag was raised
    Cancelled,
    /// The device connection was lost mid-scan
    Faulted(String),
}

/// Result of a media scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResults {
    /// Blocks on the medium
    pub total_blocks: u64,
    /// Bytes per block as read
    pub block_size: u32,
    /// Blocks per read request after size probing
    pub blocks_per_request: u32,
    /// Read command used for the scan
    pub read_path: Option<ReadPath>,
    /// Successfully read blocks per latency bucket, indexed by
    /// [`LatencyBucket::index`]
    pub buckets: [u64; BUCKET_COUNT],
    /// Blocks that could not be read
    pub unreadable: BTreeSet<u64>,
    /// Number of unreadable blocks
    pub errored: u64,
    /// Blocks skipped because of ignorable sense
    pub ignored: u64,
    /// Sum of command durations during the scan loop
    pub processing_time: Duration,
    /// Wall-clock duration of the whole scan
    pub total_time: Duration,
    /// Slowest non-zero instantaneous throughput, bytes per second
    pub min_speed: Option<f64>,
    /// Fastest instantaneous throughput, bytes per second
    pub max_speed: Option<f64>,
    /// Bytes read divided by processing time
    pub avg_speed: f64,
    /// Seek probes issued
    pub seek_count: u64,
    /// Fastest non-zero seek
    pub seek_min: Option<Duration>,
    /// Slowest seek
    pub seek_max: Option<Duration>,
    /// Sum of seek durations
    pub seek_total: Duration,
    /// Whether the scan ran to the end
    pub completed: bool,
    /// How the scan ended
    pub termination: Termination,
}

impl ScanResults {
    /// Creates an empty record for a medium
    pub fn new(total_blocks: u64, block_size: u32) -> Self {
        Self {
            total_blocks,
            block_size,
            blocks_per_request: 0,
            read_path: None,
            buckets: [0; BUCKET_COUNT],
            unreadable: BTreeSet::new(),
            errored: 0,
            ignored: 0,
            processing_time: Duration::ZERO,
            total_time: Duration::ZERO,
            min_speed: None,
            max_speed: None,
            avg_speed: 0.0,
            seek_count: 0,
            seek_min: None,
            seek_max: None,
            seek_total: Duration::ZERO,
            completed: false,
            termination: Termination::Cancelled,
        }
    }

    /// Returns the block count of one bucket
    #[inline]
    pub fn bucket(&self, bucket: LatencyBucket) -> u64 {
        self.buckets[bucket.index()]
    }

    /// Returns the number of successfully read blocks
    pub fn blocks_read(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Returns blocks read, unreadable or skipped
    pub fn blocks_processed(&self) -> u64 {
        self.blocks_read() + self.errored + self.ignored
    }

    /// Returns the mean seek time
    pub fn seek_average(&self) -> Option<Duration> {
        (self.seek_count > 0).then(|| self.seek_total.div_f64(self.seek_count as f64))
    }

    /// Records a successful read of `count` blocks
    pub(crate) fn record_read(&mut self, count: u32, elapsed: Duration) {
        self.buckets[LatencyBucket::for_duration(elapsed).index()] += u64::from(count);
        self.processing_time += elapsed;

        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let speed = f64::from(self.block_size) * f64::from(count) / secs;
            if speed > 0.0 {
                self.min_speed = Some(self.min_speed.map_or(speed, |m| m.min(speed)));
                self.max_speed = Some(self.max_speed.map_or(speed, |m| m.max(speed)));
            }
        }
    }

    /// Records blocks that could not be read
    pub(crate) fn record_unreadable(
        &mut self,
        blocks: impl IntoIterator<Item = u64>,
        elapsed: Duration,
    ) {
        self.processing_time += elapsed;
        for block in blocks {
            if block < self.total_blocks && self.unreadable.insert(block) {
                self.errored += 1;
            }
        }
    }

    /// Records blocks skipped on ignorable sense
    pub(crate) fn record_ignored(&mut self, count: u32, elapsed: Duration) {
        self.processing_time += elapsed;
        self.ignored += u64::from(count);
    }

    /// Records one seek probe
    pub(crate) fn record_seek(&mut self, elapsed: Duration) {
        self.seek_count += 1;
        self.seek_total += elapsed;
        if !elapsed.is_zero() {
            self.seek_min = Some(self.seek_min.map_or(elapsed, |m| m.min(elapsed)));
        }
        self.seek_max = Some(self.seek_max.map_or(elapsed, |m| m.max(elapsed)));
    }

    /// Fills in derived statistics and the termination state
    pub(crate) fn finish(&mut self, termination: Termination, total_time: Duration) {
        let secs = self.processing_time.as_secs_f64();
        self.avg_speed = if secs > 0.0 {
            self.blocks_read() as f64 * f64::from(self.block_size) / secs
        } else {
            0.0
        };
        self.total_time = total_time;
        self.completed = termination == Termination::Completed;
        self.termination = termination;
    }

    /// Returns a human-readable summary
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let status = match &self.termination {
            Termination::Completed => "completed".to_string(),
            Termination::Cancelled => "cancelled".to_string(),
            Termination::Faulted(reason) => format!("faulted: {reason}"),
        };
        let _ = writeln!(out, "Scan {status}");
        let _ = writeln!(
            out,
            "Medium: {} blocks x {} bytes ({})",
            self.total_blocks,
            self.block_size,
            format_size(self.total_blocks * u64::from(self.block_size), BINARY)
        );
        if let Some(path) = self.read_path {
            let _ = writeln!(
                out,
                "Read path: {path}, {} blocks per request",
                self.blocks_per_request
            );
        }
        let _ = writeln!(
            out,
            "Processed: {} of {} blocks in {:.2?} ({:.2?} busy)",
            self.blocks_processed(),
            self.total_blocks,
            self.total_time,
            self.processing_time
        );
        for bucket in LatencyBucket::ALL {
            let _ = writeln!(out, "  {:>8}: {}", bucket.label(), self.bucket(bucket));
        }
        let _ = writeln!(out, "Unreadable: {}", self.errored);
        if self.ignored > 0 {
            let _ = writeln!(out, "Skipped: {}", self.ignored);
        }
        let speed = |s: f64| format!("{}/s", format_size(s as u64, BINARY));
        let _ = writeln!(
            out,
            "Speed: avg {}, min {}, max {}",
            speed(self.avg_speed),
            self.min_speed.map_or_else(|| "-".to_string(), speed),
            self.max_speed.map_or_else(|| "-".to_string(), speed)
        );
        if self.seek_count > 0 {
            let _ = writeln!(
                out,
                "Seeks: {} probes, min {:.2?}, avg {:.2?}, max {:.2?}",
                self.seek_count,
                self.seek_min.unwrap_or_default(),
                self.seek_average().unwrap_or_default(),
                self.seek_max.unwrap_or_default()
            );
        }
        out
    }
}
