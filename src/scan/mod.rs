//! Full-surface media scan.
//!
//! [`ScanEngine::run`] walks the states
//! `Init → UnitReadyWait → SizeProbe → MediaTypeDetect → ScanLoop →
//! SeekBenchmark → Done`. Phase-level failures before the scan loop end
//! the run with a [`ScanError`] and no results. Once the loop has started
//! the engine always returns [`ScanResults`], partial if it was cancelled
//! or lost the device.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::{Classification, RetryReason, classify_scsi};
use crate::codec::mmc::{self, MediaKind, Toc};
use crate::codec::{Cdb, CommandDescriptor, DEFAULT_TIMEOUT};
use crate::core::ScanError;
use crate::device::{self, DeviceClass, DeviceInfo, InterfacePreference};
use crate::reader::BlockReader;
use crate::transport::DeviceTransport;

pub mod log;
pub mod results;
pub mod seek;

pub use log::{
    BlockTimingLog, CsvBlockLog, CsvSpeedLog, FAILED_DURATION_MS, NullLog, SpeedLog,
    SpeedLogSummary,
};
pub use results::{LatencyBucket, ScanResults, Termination};
pub use seek::SplitMix64;

const GET_CONFIGURATION_LEN: u16 = 8;
const TOC_LEN: u16 = 804;
/// GET CONFIGURATION RT field: header plus the one named feature.
const RT_SINGLE_FEATURE: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScanState {
    Init,
    UnitReadyWait,
    SizeProbe,
    MediaTypeDetect,
    ScanLoop,
    SeekBenchmark,
    Done,
    Aborted,
    Failed,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::UnitReadyWait => "unit-ready wait",
            Self::SizeProbe => "size probe",
            Self::MediaTypeDetect => "media type detection",
            Self::ScanLoop => "scan loop",
            Self::SeekBenchmark => "seek benchmark",
            Self::Done => "done",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        })
    }
}

/// Cooperative cancellation signal, polled once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for a media scan
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Device path reported in the speed-log summary
    pub device_path: String,
    /// Starting point of the transfer-size probe
    pub initial_blocks_per_request: u32,
    /// Timeout handed to the transport with every command
    pub command_timeout: Duration,
    /// Delay between unit-ready attempts
    pub unit_ready_delay: Duration,
    /// Unit-ready attempts while no medium is present
    pub medium_absent_attempts: u32,
    /// Unit-ready attempts while the unit is becoming ready or the medium
    /// changed
    pub becoming_ready_attempts: u32,
    /// Number of seek-benchmark probes
    pub seek_probes: u32,
    /// Seed for the seek offsets; `None` seeds from the clock
    pub seek_seed: Option<u64>,
    /// Re-read each block of a failed multi-block step once
    pub isolate_failures: bool,
    /// Command set preference
    pub interface: InterfacePreference,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            device_path: String::new(),
            initial_blocks_per_request: 64,
            command_timeout: DEFAULT_TIMEOUT,
            unit_ready_delay: Duration::from_secs(2),
            medium_absent_attempts: 5,
            becoming_ready_attempts: 10,
            seek_probes: 1000,
            seek_seed: None,
            isolate_failures: true,
            interface: InterfacePreference::Auto,
        }
    }
}

impl ScanOptions {
    /// Creates options for the given device path
    pub fn new(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
            ..Default::default()
        }
    }

    /// Sets the starting transfer size
    pub fn with_blocks_per_request(mut self, blocks: u32) -> Self {
        self.initial_blocks_per_request = blocks.max(1);
        self
    }

    /// Sets the per-command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the delay between unit-ready attempts
    pub fn with_unit_ready_delay(mut self, delay: Duration) -> Self {
        self.unit_ready_delay = delay;
        self
    }

    /// Sets the seek probe count
    pub fn with_seek_probes(mut self, probes: u32) -> Self {
        self.seek_probes = probes;
        self
    }

    /// Seeds the seek offsets
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seek_seed = Some(seed);
        self
    }

    /// Records failed steps whole instead of re-reading them per block
    pub fn without_isolation(mut self) -> Self {
        self.isolate_failures = false;
        self
    }

    /// Sets the command set preference
    pub fn with_interface(mut self, interface: InterfacePreference) -> Self {
        self.interface = interface;
        self
    }
}

/// How a loop phase ended.
enum Flow {
    Finished,
    Stopped(Termination),
}

/// One scan session over one device.
pub struct ScanEngine<'a, T: DeviceTransport + ?Sized> {
    transport: &'a mut T,
    options: ScanOptions,
    abort: AbortFlag,
    state: ScanState,
    block_log: Box<dyn BlockTimingLog + 'a>,
    speed_log: Box<dyn SpeedLog + 'a>,
}

impl<'a, T: DeviceTransport + ?Sized> ScanEngine<'a, T> {
    pub fn new(transport: &'a mut T, options: ScanOptions) -> Self {
        Self {
            transport,
            options,
            abort: AbortFlag::new(),
            state: ScanState::Init,
            block_log: Box::new(NullLog),
            speed_log: Box::new(NullLog),
        }
    }

    pub fn with_block_log(mut self, log: impl BlockTimingLog + 'a) -> Self {
        self.block_log = Box::new(log);
        self
    }

    pub fn with_speed_log(mut self, log: impl SpeedLog + 'a) -> Self {
        self.speed_log = Box::new(log);
        self
    }

    /// Uses an externally owned flag, e.g. one shared with a signal
    /// handler.
    pub fn with_abort_flag(mut self, flag: AbortFlag) -> Self {
        self.abort = flag;
        self
    }

    /// A handle that cancels this scan when raised.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    fn enter(&mut self, state: ScanState) {
        info!(from = %self.state, to = %state, "scan state");
        self.state = state;
    }

    pub fn run(&mut self) -> Result<ScanResults, ScanError> {
        let started = Instant::now();
        self.state = ScanState::Init;
        match self.run_phases(started) {
            Ok(results) => Ok(results),
            Err(err) => {
                warn!(%err, phase = %self.state, "scan failed");
                self.enter(ScanState::Failed);
                Err(err)
            }
        }
    }

    fn run_phases(&mut self, started: Instant) -> Result<ScanResults, ScanError> {
        let timeout = self.options.command_timeout;
        let device = device::discover(&mut *self.transport, self.options.interface, timeout)?;

        if device.removable() {
            self.enter(ScanState::UnitReadyWait);
            self.wait_unit_ready()?;
        }

        self.enter(ScanState::SizeProbe);
        let capacity = device::read_capacity(&mut *self.transport, &device, timeout)?;
        if capacity.total_blocks() == 0 {
            return Err(ScanError::ZeroBlocks);
        }
        let extended = self.transport.supports_extended_addressing();
        let mut reader = BlockReader::select(&device, capacity, extended, timeout)?;
        let mut blocks_per_request = reader.probe_transfer_size(
            &mut *self.transport,
            self.options.initial_blocks_per_request,
            ScanState::SizeProbe,
        )?;
        info!(blocks_per_request, "transfer size established");

        if device.class == DeviceClass::Optical {
            self.enter(ScanState::MediaTypeDetect);
            if self.detect_read_cd(&reader)? {
                reader.use_read_cd();
                blocks_per_request = reader.probe_transfer_size(
                    &mut *self.transport,
                    self.options.initial_blocks_per_request,
                    ScanState::MediaTypeDetect,
                )?;
                info!(blocks_per_request, "scanning with READ CD");
            }
        }

        let mut results = ScanResults::new(reader.total_blocks(), reader.bytes_per_block());
        results.blocks_per_request = blocks_per_request;
        results.read_path = Some(reader.path());

        self.enter(ScanState::ScanLoop);
        if let Err(err) = self.block_log.begin(results.total_blocks, results.block_size) {
            warn!(%err, "block timing log write failed");
        }
        let mut flow = self.scan_loop(&mut reader, &mut results, blocks_per_request)?;

        if matches!(flow, Flow::Finished) && self.options.seek_probes > 0 {
            self.enter(ScanState::SeekBenchmark);
            flow = self.seek_benchmark(&mut reader, &mut results)?;
        }

        let termination = match flow {
            Flow::Finished => {
                self.enter(ScanState::Done);
                Termination::Completed
            }
            Flow::Stopped(termination) => {
                self.enter(ScanState::Aborted);
                termination
            }
        };
        results.finish(termination, started.elapsed());
        self.close_speed_log(&device, &results);
        info!(
            completed = results.completed,
            errored = results.errored,
            "scan finished"
        );
        Ok(results)
    }

    fn wait_unit_ready(&mut self) -> Result<(), ScanError> {
        let cmd = CommandDescriptor::scsi(Cdb::test_unit_ready())
            .with_timeout(self.options.command_timeout);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = self
                .transport
                .execute(&cmd)
                .map_err(|e| ScanError::transport(ScanState::UnitReadyWait, e))?
                .into_scsi();
            match classify_scsi(&result) {
                Classification::Ok | Classification::Ignorable(_) => {
                    debug!(attempts, "unit ready");
                    return Ok(());
                }
                Classification::Retryable(reason) => {
                    let budget = match reason {
                        RetryReason::MediumNotPresent => self.options.medium_absent_attempts,
                        RetryReason::BecomingReady | RetryReason::MediumChanged => {
                            self.options.becoming_ready_attempts
                        }
                    };
                    if attempts >= budget {
                        return Err(match reason {
                            RetryReason::MediumNotPresent => ScanError::NoMedium,
                            reason => ScanError::NotReady { attempts, reason },
                        });
                    }
                    debug!(attempts, %reason, "unit not ready, waiting");
                    thread::sleep(self.options.unit_ready_delay);
                }
                Classification::Fatal(reason) => {
                    return Err(ScanError::CommandFailed {
                        command: "TEST UNIT READY",
                        detail: reason.to_string(),
                    });
                }
            }
        }
    }

    /// Decides whether an optical medium is read with READ CD. Requires a
    /// CD profile, a table of contents with at least one track, and a
    /// drive that answers READ CD. Sense failures along the way select the
    /// generic path, as do responses too short to decode. Transport
    /// failures end the scan.
    fn detect_read_cd(&mut self, reader: &BlockReader) -> Result<bool, ScanError> {
        let phase = ScanState::MediaTypeDetect;
        let timeout = self.options.command_timeout;

        let cmd = CommandDescriptor::scsi_in(
            Cdb::get_configuration(RT_SINGLE_FEATURE, 0, GET_CONFIGURATION_LEN),
            usize::from(GET_CONFIGURATION_LEN),
        )
        .with_timeout(timeout);
        let result = self
            .transport
            .execute(&cmd)
            .map_err(|e| ScanError::transport(phase, e))?
            .into_scsi();
        if !classify_scsi(&result).is_ok() {
            info!("GET CONFIGURATION failed, treating medium as non-optical");
            return Ok(false);
        }
        let profile = match mmc::current_profile(&result.data) {
            Ok(profile) => profile,
            Err(err) => {
                warn!(%err, "unusable configuration header, treating medium as non-optical");
                return Ok(false);
            }
        };
        let kind = mmc::media_kind(profile);
        info!(profile = format_args!("{profile:#06x}"), ?kind, "current profile");
        if kind != Some(MediaKind::Cd) {
            return Ok(false);
        }

        let cmd = CommandDescriptor::scsi_in(
            Cdb::read_toc(0, false, 0, TOC_LEN),
            usize::from(TOC_LEN),
        )
        .with_timeout(timeout);
        let result = self
            .transport
            .execute(&cmd)
            .map_err(|e| ScanError::transport(phase, e))?
            .into_scsi();
        if !classify_scsi(&result).is_ok() {
            info!("READ TOC failed, using generic read path");
            return Ok(false);
        }
        match Toc::parse(&result.data) {
            Ok(toc) if toc.has_tracks() => {
                debug!(tracks = toc.user_tracks().count(), "table of contents");
            }
            Ok(_) => return Ok(false),
            Err(err) => {
                warn!(%err, "unusable table of contents, using generic read path");
                return Ok(false);
            }
        }

        reader
            .supports_read_cd(&mut *self.transport)
            .map_err(|e| ScanError::transport(phase, e))
    }

    fn scan_loop(
        &mut self,
        reader: &mut BlockReader,
        results: &mut ScanResults,
        blocks_per_request: u32,
    ) -> Result<Flow, ScanError> {
        let total = reader.total_blocks();
        let bytes_per_block = f64::from(reader.bytes_per_block());
        let mut start = 0u64;

        while start < total {
            if self.abort.is_raised() {
                info!(block = start, "scan cancelled");
                return Ok(Flow::Stopped(Termination::Cancelled));
            }
            let count = u64::from(blocks_per_request).min(total - start) as u32;

            match reader.read_blocks(&mut *self.transport, start, count) {
                Ok(outcome) => match outcome.classification {
                    Classification::Ok => {
                        results.record_read(count, outcome.elapsed);
                        self.log_block(start, log::duration_ms(outcome.elapsed));
                        let secs = outcome.elapsed.as_secs_f64();
                        let speed = if secs > 0.0 {
                            bytes_per_block * f64::from(count) / secs
                        } else {
                            0.0
                        };
                        self.log_speed(start, speed);
                    }
                    Classification::Ignorable(reason) => {
                        debug!(block = start, ?reason, "skipping step on ignorable sense");
                        results.record_ignored(count, outcome.elapsed);
                        self.log_block(start, log::duration_ms(outcome.elapsed));
                    }
                    failure => {
                        debug!(block = start, count, ?failure, "read failed");
                        self.log_block(start, FAILED_DURATION_MS);
                        let elapsed = outcome.elapsed;
                        if let Some(stop) =
                            self.record_failure(reader, results, start, count, elapsed)?
                        {
                            return Ok(Flow::Stopped(stop));
                        }
                    }
                },
                Err(err) if err.is_session_fatal() => {
                    warn!(%err, block = start, "device lost during scan");
                    return Ok(Flow::Stopped(Termination::Faulted(err.to_string())));
                }
                Err(err) if err.is_refusal() => {
                    return Err(ScanError::transport(ScanState::ScanLoop, err));
                }
                Err(err) => {
                    debug!(block = start, count, %err, "read rejected by transport");
                    self.log_block(start, FAILED_DURATION_MS);
                    if let Some(stop) =
                        self.record_failure(reader, results, start, count, Duration::ZERO)?
                    {
                        return Ok(Flow::Stopped(stop));
                    }
                }
            }
            start += u64::from(count);
        }
        Ok(Flow::Finished)
    }

    /// Attributes a failed step. With isolation on, each block of a
    /// multi-block step is re-read exactly once.
    fn record_failure(
        &mut self,
        reader: &mut BlockReader,
        results: &mut ScanResults,
        start: u64,
        count: u32,
        elapsed: Duration,
    ) -> Result<Option<Termination>, ScanError> {
        let end = start + u64::from(count);
        if !self.options.isolate_failures || count == 1 {
            results.record_unreadable(start..end, elapsed);
            return Ok(None);
        }

        results.record_unreadable(std::iter::empty(), elapsed);
        for block in start..end {
            if self.abort.is_raised() {
                return Ok(Some(Termination::Cancelled));
            }
            match reader.read_blocks(&mut *self.transport, block, 1) {
                Ok(outcome) => match outcome.classification {
                    Classification::Ok => results.record_read(1, outcome.elapsed),
                    Classification::Ignorable(_) => results.record_ignored(1, outcome.elapsed),
                    _ => results.record_unreadable([block], outcome.elapsed),
                },
                Err(err) if err.is_session_fatal() => {
                    warn!(%err, block, "device lost during scan");
                    return Ok(Some(Termination::Faulted(err.to_string())));
                }
                Err(err) if err.is_refusal() => {
                    return Err(ScanError::transport(ScanState::ScanLoop, err));
                }
                Err(_) => results.record_unreadable([block], Duration::ZERO),
            }
        }
        Ok(None)
    }

    fn seek_benchmark(
        &mut self,
        reader: &mut BlockReader,
        results: &mut ScanResults,
    ) -> Result<Flow, ScanError> {
        let total = reader.total_blocks();
        let mut rng = self
            .options
            .seek_seed
            .map_or_else(SplitMix64::from_time, SplitMix64::new);

        for _ in 0..self.options.seek_probes {
            if self.abort.is_raised() {
                info!("seek benchmark cancelled");
                return Ok(Flow::Stopped(Termination::Cancelled));
            }
            let lba = rng.next_below(total);
            match reader.seek(&mut *self.transport, lba) {
                Ok(outcome) => results.record_seek(outcome.elapsed),
                Err(err) if err.is_session_fatal() => {
                    warn!(%err, "device lost during seek benchmark");
                    return Ok(Flow::Stopped(Termination::Faulted(err.to_string())));
                }
                Err(err) if err.is_refusal() => {
                    return Err(ScanError::transport(ScanState::SeekBenchmark, err));
                }
                Err(err) => debug!(lba, %err, "seek rejected by transport"),
            }
        }
        Ok(Flow::Finished)
    }

    fn log_block(&mut self, block: u64, duration_ms: u16) {
        if let Err(err) = self.block_log.record(block, duration_ms) {
            warn!(%err, block, "block timing log write failed");
        }
    }

    fn log_speed(&mut self, block: u64, speed: f64) {
        if let Err(err) = self.speed_log.record(block, speed) {
            warn!(%err, block, "speed log write failed");
        }
    }

    fn close_speed_log(&mut self, device: &DeviceInfo, results: &ScanResults) {
        let wall = results.total_time.as_secs_f64();
        let bytes = results.total_blocks as f64 * f64::from(results.block_size);
        let summary = SpeedLogSummary {
            device: format!("{} {}", device.inquiry.vendor, device.inquiry.product)
                .trim()
                .to_string(),
            total_blocks: results.total_blocks,
            block_size: results.block_size,
            total_time: results.total_time,
            average_speed: results.avg_speed,
            derived_average: if wall > 0.0 { bytes / wall } else { 0.0 },
            device_path: self.options.device_path.clone(),
        };
        if let Err(err) = self.speed_log.close(&summary) {
            warn!(%err, "speed log summary write failed");
        }
    }
}
