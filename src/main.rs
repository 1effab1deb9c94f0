use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::Level;

use mediascan::scan::{
    AbortFlag, BlockTimingLog, CsvBlockLog, CsvSpeedLog, NullLog, ScanEngine, SpeedLog,
};
use mediascan::{DeviceTransport, EmulatedDevice, ScanResults, TransportError};

mod cli;

use cli::{Cli, ProgressReporter};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let abort = AbortFlag::new();
    let handler_flag = abort.clone();
    ctrlc::set_handler(move || handler_flag.raise()).context("Failed to install Ctrl-C handler")?;

    let mut transport = open_transport(&cli)?;
    let results = run_scan(&cli, transport.as_mut(), abort)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print!("{}", results.summary());
    }
    Ok(())
}

fn open_transport(cli: &Cli) -> Result<Box<dyn DeviceTransport>> {
    if let Some(image) = &cli.image {
        let device = EmulatedDevice::from_image(image, cli.block_size)
            .with_context(|| format!("Failed to open image: {}", image.display()))?;
        return Ok(Box::new(device));
    }
    let Some(path) = &cli.device else {
        bail!("no device given");
    };
    open_device(path).with_context(|| format!("Failed to open device: {path}"))
}

#[cfg(target_os = "linux")]
fn open_device(path: &str) -> std::result::Result<Box<dyn DeviceTransport>, TransportError> {
    Ok(Box::new(mediascan::transport::linux::SgIoTransport::open(path)?))
}

#[cfg(windows)]
fn open_device(path: &str) -> std::result::Result<Box<dyn DeviceTransport>, TransportError> {
    Ok(Box::new(mediascan::transport::windows::SptdTransport::open(path)?))
}

#[cfg(not(any(target_os = "linux", windows)))]
fn open_device(_path: &str) -> std::result::Result<Box<dyn DeviceTransport>, TransportError> {
    Err(TransportError::DeclinedByPolicy {
        reason: "no pass-through backend for this platform",
    })
}

fn create_log(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to create {}", path.display()))
}

fn run_scan(
    cli: &Cli,
    transport: &mut dyn DeviceTransport,
    abort: AbortFlag,
) -> Result<ScanResults> {
    let block_file: Option<Box<dyn BlockTimingLog>> = match &cli.block_log {
        Some(path) => {
            let file = create_log(path)?;
            Some(Box::new(CsvBlockLog::new(BufWriter::new(file))))
        }
        None => None,
    };
    let speed_log: Box<dyn SpeedLog> = match &cli.speed_log {
        Some(path) => {
            let file = create_log(path)?;
            Box::new(CsvSpeedLog::new(BufWriter::new(file)))
        }
        None => Box::new(NullLog),
    };

    let mut progress = ProgressReporter::new(block_file);
    let results = {
        let mut engine = ScanEngine::new(transport, cli.scan_options())
            .with_abort_flag(abort)
            .with_block_log(&mut progress)
            .with_speed_log(speed_log);
        engine.run().context("Scan failed")?
    };
    progress.finish();
    Ok(results)
}
