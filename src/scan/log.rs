//! Timing-log sinks fed inline by the scan loop.
//!
//! Both logs are append-only and written synchronously. A failing sink is
//! reported and otherwise ignored; it never stops a scan.

use std::io::{self, Write};
use std::time::Duration;

/// Duration recorded for a step whose command failed.
pub const FAILED_DURATION_MS: u16 = 65535;

/// Receives `(block index, duration in ms)` for every scan step.
pub trait BlockTimingLog {
    /// Called once when the scan loop starts.
    fn begin(&mut self, _total_blocks: u64, _block_size: u32) -> io::Result<()> {
        Ok(())
    }

    fn record(&mut self, block: u64, duration_ms: u16) -> io::Result<()>;
}

/// Closing record written to the speed log.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedLogSummary {
    pub device: String,
    pub total_blocks: u64,
    pub block_size: u32,
    pub total_time: Duration,
    /// Bytes read divided by processing time, bytes per second.
    pub average_speed: f64,
    /// Medium size divided by wall-clock time, bytes per second.
    pub derived_average: f64,
    pub device_path: String,
}

/// Receives `(block index, bytes per second)` for every successful step
/// and a summary at close.
pub trait SpeedLog {
    fn record(&mut self, block: u64, speed: f64) -> io::Result<()>;

    fn close(&mut self, summary: &SpeedLogSummary) -> io::Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl BlockTimingLog for NullLog {
    fn record(&mut self, _block: u64, _duration_ms: u16) -> io::Result<()> {
        Ok(())
    }
}

impl SpeedLog for NullLog {
    fn record(&mut self, _block: u64, _speed: f64) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self, _summary: &SpeedLogSummary) -> io::Result<()> {
        Ok(())
    }
}

impl<L: BlockTimingLog + ?Sized> BlockTimingLog for &mut L {
    fn begin(&mut self, total_blocks: u64, block_size: u32) -> io::Result<()> {
        (**self).begin(total_blocks, block_size)
    }

    fn record(&mut self, block: u64, duration_ms: u16) -> io::Result<()> {
        (**self).record(block, duration_ms)
    }
}

impl<L: SpeedLog + ?Sized> SpeedLog for &mut L {
    fn record(&mut self, block: u64, speed: f64) -> io::Result<()> {
        (**self).record(block, speed)
    }

    fn close(&mut self, summary: &SpeedLogSummary) -> io::Result<()> {
        (**self).close(summary)
    }
}

impl<L: BlockTimingLog + ?Sized> BlockTimingLog for Box<L> {
    fn begin(&mut self, total_blocks: u64, block_size: u32) -> io::Result<()> {
        (**self).begin(total_blocks, block_size)
    }

    fn record(&mut self, block: u64, duration_ms: u16) -> io::Result<()> {
        (**self).record(block, duration_ms)
    }
}

impl<L: SpeedLog + ?Sized> SpeedLog for Box<L> {
    fn record(&mut self, block: u64, speed: f64) -> io::Result<()> {
        (**self).record(block, speed)
    }

    fn close(&mut self, summary: &SpeedLogSummary) -> io::Result<()> {
        (**self).close(summary)
    }
}

/// Block timing log as `block,ms` lines.
#[derive(Debug)]
pub struct CsvBlockLog<W: Write> {
    out: W,
}

impl<W: Write> CsvBlockLog<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> BlockTimingLog for CsvBlockLog<W> {
    fn begin(&mut self, total_blocks: u64, block_size: u32) -> io::Result<()> {
        writeln!(self.out, "# blocks={total_blocks} block_size={block_size}")
    }

    fn record(&mut self, block: u64, duration_ms: u16) -> io::Result<()> {
        writeln!(self.out, "{block},{duration_ms}")
    }
}

/// Speed log as `block,bytes_per_second` lines followed by `# key=value`
/// summary lines.
#[derive(Debug)]
pub struct CsvSpeedLog<W: Write> {
    out: W,
}

impl<W: Write> CsvSpeedLog<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> SpeedLog for CsvSpeedLog<W> {
    fn record(&mut self, block: u64, speed: f64) -> io::Result<()> {
        writeln!(self.out, "{block},{speed:.0}")
    }

    fn close(&mut self, summary: &SpeedLogSummary) -> io::Result<()> {
        writeln!(self.out, "# device={}", summary.device)?;
        writeln!(self.out, "# path={}", summary.device_path)?;
        writeln!(self.out, "# blocks={} block_size={}", summary.total_blocks, summary.block_size)?;
        writeln!(self.out, "# total_time_ms={}", summary.total_time.as_millis())?;
        writeln!(
            self.out,
            "# average={:.0} derived_average={:.0}",
            summary.average_speed, summary.derived_average
        )?;
        self.out.flush()
    }
}

/// Duration in whole milliseconds, saturating below the failure sentinel.
pub fn duration_ms(elapsed: Duration) -> u16 {
    elapsed
        .as_millis()
        .min(u128::from(FAILED_DURATION_MS - 1)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_never_collides_with_sentinel() {
        assert_eq!(duration_ms(Duration::from_millis(12)), 12);
        assert_eq!(duration_ms(Duration::from_secs(3600)), FAILED_DURATION_MS - 1);
    }

    #[test]
    fn test_csv_logs() {
        let mut blocks = CsvBlockLog::new(Vec::new());
        blocks.begin(128, 512).unwrap();
        blocks.record(0, 4).unwrap();
        blocks.record(64, FAILED_DURATION_MS).unwrap();
        let text = String::from_utf8(blocks.into_inner()).unwrap();
        assert_eq!(text, "# blocks=128 block_size=512\n0,4\n64,65535\n");

        let mut speeds = CsvSpeedLog::new(Vec::new());
        speeds.record(0, 1024.4).unwrap();
        speeds
            .close(&SpeedLogSummary {
                device: "EMU DISK".into(),
                total_blocks: 128,
                block_size: 512,
                total_time: Duration::from_millis(250),
                average_speed: 2048.0,
                derived_average: 1000.0,
                device_path: "/dev/sg0".into(),
            })
            .unwrap();
        let text = String::from_utf8(speeds.into_inner()).unwrap();
        assert!(text.starts_with("0,1024\n# device=EMU DISK\n"));
        assert!(text.contains("# total_time_ms=250"));
    }
}
