use std::io;
use std::path::PathBuf;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use mediascan::InterfacePreference;
use mediascan::scan::{BlockTimingLog, FAILED_DURATION_MS, ScanOptions};

const PROGRESS_TEMPLATE: &str = "{msg}\n{spinner:.green} [{elapsed_precise}] \
    [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})";

#[derive(Parser)]
#[command(name = "mediascan")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Surface scan and seek benchmark for disks and optical drives")]
#[command(long_about = None)]
pub struct Cli {
    /// Device to scan (/dev/sg0, \\.\PhysicalDrive0, \\.\CdRom0)
    #[arg(required_unless_present = "image")]
    pub device: Option<String>,

    /// Scan a raw image file through the emulated device instead
    #[arg(long, conflicts_with = "device")]
    pub image: Option<PathBuf>,

    /// Block size of the image file
    #[arg(long, default_value = "512", requires = "image")]
    pub block_size: u32,

    /// Starting transfer size in blocks
    #[arg(short, long, default_value = "64")]
    pub blocks_per_request: u32,

    /// Seek benchmark probes, 0 to skip the benchmark
    #[arg(long, default_value = "1000")]
    pub seek_probes: u32,

    /// Seed for the seek offsets
    #[arg(long)]
    pub seed: Option<u64>,

    /// Use ATA pass-through commands
    #[arg(long, conflicts_with = "scsi")]
    pub ata: bool,

    /// Use SCSI commands only
    #[arg(long)]
    pub scsi: bool,

    /// Record failed steps whole instead of re-reading each block
    #[arg(long)]
    pub no_isolate: bool,

    /// Write `block,ms` lines for every step
    #[arg(long)]
    pub block_log: Option<PathBuf>,

    /// Write `block,bytes_per_second` lines and a summary
    #[arg(long)]
    pub speed_log: Option<PathBuf>,

    /// Print the results as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn device_label(&self) -> String {
        match (&self.device, &self.image) {
            (Some(device), _) => device.clone(),
            (None, Some(image)) => image.display().to_string(),
            (None, None) => String::new(),
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        let interface = if self.ata {
            InterfacePreference::Ata
        } else if self.scsi {
            InterfacePreference::Scsi
        } else {
            InterfacePreference::Auto
        };
        let mut options = ScanOptions::new(&self.device_label())
            .with_blocks_per_request(self.blocks_per_request)
            .with_seek_probes(self.seek_probes)
            .with_interface(interface);
        if let Some(seed) = self.seed {
            options = options.with_seed(seed);
        }
        if self.no_isolate {
            options = options.without_isolation();
        }
        options
    }
}

/// Progress bar fed from block timing records, optionally forwarding them
/// to a file log.
pub struct ProgressReporter<'a> {
    bar: ProgressBar,
    block_size: u64,
    failed: u64,
    forward: Option<Box<dyn BlockTimingLog + 'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(forward: Option<Box<dyn BlockTimingLog + 'a>>) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            block_size: 1,
            failed: 0,
            forward,
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl BlockTimingLog for ProgressReporter<'_> {
    fn begin(&mut self, total_blocks: u64, block_size: u32) -> io::Result<()> {
        self.block_size = u64::from(block_size.max(1));
        self.bar = ProgressBar::new(total_blocks * self.block_size);
        self.bar.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)
                .map_err(io::Error::other)?
                .progress_chars("#>-"),
        );
        self.bar.set_message("Scanning...");
        match &mut self.forward {
            Some(log) => log.begin(total_blocks, block_size),
            None => Ok(()),
        }
    }

    fn record(&mut self, block: u64, duration_ms: u16) -> io::Result<()> {
        self.bar.set_position(block * self.block_size);
        if duration_ms == FAILED_DURATION_MS {
            self.failed += 1;
            self.bar.set_message(format!("Scanning... {} failed steps", self.failed));
        }
        match &mut self.forward {
            Some(log) => log.record(block, duration_ms),
            None => Ok(()),
        }
    }
}
