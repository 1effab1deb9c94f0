//! Scan engine tests
//!
//! End-to-end scans against emulated disks, optical drives and ATA devices.

use std::io;
use std::time::Duration;

use mediascan::codec::SenseTriple;
use mediascan::codec::ata;
use mediascan::codec::cdb::opcode;
use mediascan::codec::mmc::profile;
use mediascan::reader::{AtaReadMode, ScsiReadCommand};
use mediascan::scan::{BlockTimingLog, FAILED_DURATION_MS, LatencyBucket, SpeedLog, SpeedLogSummary};
use mediascan::transport::emulated::{AtaFeatures, FaultKind};
use mediascan::{
    AbortFlag, EmulatedDevice, InterfacePreference, ReadPath, ScanEngine, ScanError, ScanOptions,
    ScanState, Termination,
};
use mediascan::classify::RetryReason;
use mediascan::codec::AddressingMode;
use rstest::*;

#[fixture]
fn options() -> ScanOptions {
    ScanOptions::new("emulated")
        .with_unit_ready_delay(Duration::ZERO)
        .with_seek_probes(20)
        .with_seed(0x5EED)
}

#[derive(Default)]
struct RecordingLog {
    begun: Option<(u64, u32)>,
    steps: Vec<(u64, u16)>,
}

impl BlockTimingLog for RecordingLog {
    fn begin(&mut self, total_blocks: u64, block_size: u32) -> io::Result<()> {
        self.begun = Some((total_blocks, block_size));
        Ok(())
    }

    fn record(&mut self, block: u64, duration_ms: u16) -> io::Result<()> {
        self.steps.push((block, duration_ms));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSpeedLog {
    speeds: Vec<(u64, f64)>,
    summary: Option<SpeedLogSummary>,
}

impl SpeedLog for RecordingSpeedLog {
    fn record(&mut self, block: u64, speed: f64) -> io::Result<()> {
        self.speeds.push((block, speed));
        Ok(())
    }

    fn close(&mut self, summary: &SpeedLogSummary) -> io::Result<()> {
        self.summary = Some(summary.clone());
        Ok(())
    }
}

/// Raises the abort flag once the step covering `at` has been logged.
struct AbortAt {
    flag: AbortFlag,
    at: u64,
    step: u64,
}

impl BlockTimingLog for AbortAt {
    fn record(&mut self, block: u64, _duration_ms: u16) -> io::Result<()> {
        if block + self.step >= self.at {
            self.flag.raise();
        }
        Ok(())
    }
}

struct FailingLog;

impl BlockTimingLog for FailingLog {
    fn record(&mut self, _block: u64, _duration_ms: u16) -> io::Result<()> {
        Err(io::Error::other("disk full"))
    }
}

// ============================================================================
// Clean media
// ============================================================================

#[rstest]
fn test_clean_disk_fills_fastest_bucket(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(1000, 512);
    let mut log = RecordingLog::default();
    let mut speeds = RecordingSpeedLog::default();

    let results = ScanEngine::new(&mut dev, options)
        .with_block_log(&mut log)
        .with_speed_log(&mut speeds)
        .run()
        .unwrap();

    assert!(results.completed);
    assert_eq!(results.termination, Termination::Completed);
    assert_eq!(results.total_blocks, 1000);
    assert_eq!(results.block_size, 512);
    assert_eq!(results.blocks_per_request, 64);
    assert_eq!(results.read_path, Some(ReadPath::Scsi(ScsiReadCommand::Read10)));
    assert_eq!(results.bucket(LatencyBucket::Under3ms), 1000);
    assert_eq!(results.blocks_read(), 1000);
    assert_eq!(results.errored, 0);
    assert!(results.unreadable.is_empty());
    assert_eq!(results.seek_count, 20);
    assert_eq!(results.seek_min, Some(Duration::from_millis(8)));
    assert!(results.avg_speed > 0.0);

    assert_eq!(log.begun, Some((1000, 512)));
    assert_eq!(log.steps.len(), 16);
    assert_eq!(log.steps.last(), Some(&(960, 1)));
    assert_eq!(speeds.speeds.len(), 16);
    let summary = speeds.summary.unwrap();
    assert_eq!(summary.device_path, "emulated");
    assert_eq!(summary.total_blocks, 1000);
}

#[rstest]
fn test_latency_lands_in_matching_bucket(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(256, 512)
        .with_range_latency(64..128, Duration::from_millis(20))
        .with_range_latency(192..256, Duration::from_millis(600));
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert_eq!(results.bucket(LatencyBucket::Under3ms), 128);
    assert_eq!(results.bucket(LatencyBucket::Under50ms), 64);
    assert_eq!(results.bucket(LatencyBucket::Over500ms), 64);
}

#[rstest]
fn test_last_step_is_clamped_to_medium(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(100, 512);
    let results = ScanEngine::new(&mut dev, options.with_seek_probes(0)).run().unwrap();
    assert_eq!(results.blocks_read(), 100);
    assert_eq!(results.ignored, 0);
    assert_eq!(results.seek_count, 0);
}

#[rstest]
fn test_sink_failure_does_not_stop_scan(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(200, 512);
    let results = ScanEngine::new(&mut dev, options)
        .with_block_log(FailingLog)
        .run()
        .unwrap();
    assert!(results.completed);
    assert_eq!(results.blocks_read(), 200);
}

// ============================================================================
// Failure attribution
// ============================================================================

#[rstest]
fn test_unrecovered_read_error_attributed_per_block(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(1000, 512)
        .with_fault(500..510, FaultKind::Sense(SenseTriple::UNRECOVERED_READ_ERROR));
    let mut log = RecordingLog::default();
    let results = ScanEngine::new(&mut dev, options)
        .with_block_log(&mut log)
        .run()
        .unwrap();

    assert!(results.completed);
    assert_eq!(results.errored, 10);
    assert_eq!(
        results.unreadable.iter().copied().collect::<Vec<_>>(),
        (500..510).collect::<Vec<_>>()
    );
    assert_eq!(results.blocks_read(), 990);
    assert!(log.steps.contains(&(448, FAILED_DURATION_MS)));
}

#[rstest]
fn test_without_isolation_whole_step_is_unreadable(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(1000, 512)
        .with_fault(500..510, FaultKind::Sense(SenseTriple::UNRECOVERED_READ_ERROR));
    let results = ScanEngine::new(&mut dev, options.without_isolation()).run().unwrap();

    assert_eq!(results.errored, 64);
    assert_eq!(results.unreadable.first(), Some(&448));
    assert_eq!(results.unreadable.last(), Some(&511));
    assert_eq!(results.blocks_read(), 936);
}

#[rstest]
fn test_transport_rejection_is_isolated(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(256, 512).with_fault(130..132, FaultKind::Transport);
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert!(results.completed);
    assert_eq!(results.unreadable.iter().copied().collect::<Vec<_>>(), vec![130, 131]);
    assert_eq!(results.blocks_read(), 254);
}

#[rstest]
fn test_ignorable_sense_skips_step(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(256, 512)
        .with_fault(64..128, FaultKind::Sense(SenseTriple::ILLEGAL_MODE_FOR_TRACK));
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert!(results.completed);
    assert_eq!(results.ignored, 64);
    assert_eq!(results.errored, 0);
    assert_eq!(results.blocks_read(), 192);
    assert_eq!(results.blocks_processed(), 256);
}

// ============================================================================
// Cancellation and device loss
// ============================================================================

#[rstest]
fn test_cancellation_returns_partial_results(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(1000, 512);
    let flag = AbortFlag::new();
    let sink = AbortAt {
        flag: flag.clone(),
        at: 320,
        step: 64,
    };
    let mut engine = ScanEngine::new(&mut dev, options)
        .with_abort_flag(flag)
        .with_block_log(sink);
    let results = engine.run().unwrap();

    assert_eq!(engine.state(), ScanState::Aborted);
    assert!(!results.completed);
    assert_eq!(results.termination, Termination::Cancelled);
    assert!(results.blocks_read() <= 320);
    assert_eq!(results.blocks_read(), 320);
    assert_eq!(results.seek_count, 0);
}

#[rstest]
fn test_disconnect_faults_scan(options: ScanOptions) {
    // INQUIRY, READ CAPACITY and the size probe, then two scan steps.
    let mut dev = EmulatedDevice::disk(1000, 512).disconnect_after(5);
    let mut engine = ScanEngine::new(&mut dev, options);
    let results = engine.run().unwrap();

    assert_eq!(engine.state(), ScanState::Aborted);
    assert!(!results.completed);
    assert!(matches!(results.termination, Termination::Faulted(_)));
    assert_eq!(results.blocks_read(), 128);
}

// ============================================================================
// Unit-ready negotiation
// ============================================================================

#[rstest]
fn test_medium_absent_gives_up_after_budget(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(100, 512)
        .removable()
        .with_not_ready([SenseTriple::MEDIUM_NOT_PRESENT; 20]);
    let err = ScanEngine::new(&mut dev, options).run().unwrap_err();

    assert!(matches!(err, ScanError::NoMedium));
    assert_eq!(dev.count(opcode::TEST_UNIT_READY), 5);
}

#[rstest]
fn test_becoming_ready_gives_up_after_budget(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(100, 512)
        .removable()
        .with_not_ready([SenseTriple::BECOMING_READY; 20]);
    let err = ScanEngine::new(&mut dev, options).run().unwrap_err();

    assert!(matches!(
        err,
        ScanError::NotReady {
            attempts: 10,
            reason: RetryReason::BecomingReady
        }
    ));
    assert_eq!(dev.count(opcode::TEST_UNIT_READY), 10);
}

#[rstest]
fn test_unit_becomes_ready_within_budget(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(100, 512).removable().with_not_ready([
        SenseTriple::MEDIUM_CHANGED,
        SenseTriple::BECOMING_READY,
        SenseTriple::BECOMING_READY,
    ]);
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert!(results.completed);
    assert_eq!(dev.count(opcode::TEST_UNIT_READY), 4);
}

#[rstest]
fn test_fixed_disk_skips_unit_ready(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(100, 512);
    ScanEngine::new(&mut dev, options).run().unwrap();
    assert_eq!(dev.count(opcode::TEST_UNIT_READY), 0);
}

#[rstest]
fn test_empty_medium_is_zero_blocks(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(0, 512);
    let mut engine = ScanEngine::new(&mut dev, options);
    assert!(matches!(engine.run(), Err(ScanError::ZeroBlocks)));
    assert_eq!(engine.state(), ScanState::Failed);
}

// ============================================================================
// Transfer size
// ============================================================================

#[rstest]
fn test_transfer_size_halves_to_accepted(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(1000, 512).with_max_transfer_blocks(16);
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert_eq!(results.blocks_per_request, 16);
    assert_eq!(results.blocks_read(), 1000);
}

#[rstest]
#[case(40, 32)]
#[case(63, 32)]
#[case(5, 4)]
#[case(1, 1)]
fn test_small_medium_probes_power_of_two(
    options: ScanOptions,
    #[case] blocks: u64,
    #[case] expected: u32,
) {
    let mut dev = EmulatedDevice::disk(blocks, 512);
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert!(results.completed);
    assert!(results.blocks_per_request.is_power_of_two());
    assert_eq!(results.blocks_per_request, expected);
    assert_eq!(results.blocks_read(), blocks);
}

#[rstest]
fn test_read_10_rejection_falls_back(options: ScanOptions) {
    let mut dev = EmulatedDevice::disk(500, 512).with_unsupported_opcode(opcode::READ_10);
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert_eq!(results.read_path, Some(ReadPath::Scsi(ScsiReadCommand::Read12)));
    assert_eq!(results.blocks_read(), 500);
    assert_eq!(dev.count(opcode::READ_10), 1);
}

// ============================================================================
// Optical media
// ============================================================================

#[rstest]
fn test_cd_scans_with_read_cd(options: ScanOptions) {
    let mut dev = EmulatedDevice::optical(600);
    let mut engine = ScanEngine::new(&mut dev, options);
    let results = engine.run().unwrap();

    assert_eq!(engine.state(), ScanState::Done);
    assert_eq!(results.read_path, Some(ReadPath::ReadCd));
    assert_eq!(results.block_size, 2352);
    assert_eq!(results.blocks_read(), 600);
    drop(engine);
    assert!(dev.count(opcode::READ_CD) > 1);
    assert_eq!(dev.count(opcode::GET_CONFIGURATION), 1);
    assert_eq!(dev.count(opcode::READ_TOC_PMA_ATIP), 1);
}

#[rstest]
#[case::dvd(EmulatedDevice::optical(600).with_profile(profile::DVD_ROM))]
#[case::no_toc(EmulatedDevice::optical(600).with_toc(None))]
#[case::no_read_cd(EmulatedDevice::optical(600).with_read_cd(false))]
#[case::no_profile(EmulatedDevice::optical(600).with_profile(profile::NONE))]
#[case::short_configuration(
    EmulatedDevice::optical(600).with_short_response(opcode::GET_CONFIGURATION, 4)
)]
fn test_optical_generic_path(options: ScanOptions, #[case] mut dev: EmulatedDevice) {
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert_eq!(results.read_path, Some(ReadPath::Scsi(ScsiReadCommand::Read10)));
    assert_eq!(results.block_size, 2048);
    assert_eq!(results.blocks_read(), 600);
}

// ============================================================================
// ATA devices
// ============================================================================

#[rstest]
fn test_ata_disk_scans_with_lba48_dma(options: ScanOptions) {
    let mut dev = EmulatedDevice::ata(1000, AtaFeatures::default());
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert!(results.completed);
    assert_eq!(
        results.read_path,
        Some(ReadPath::Ata(AtaReadMode {
            addressing: AddressingMode::Lba48,
            dma: true
        }))
    );
    assert_eq!(results.blocks_read(), 1000);
    assert!(dev.count_ata(ata::command::READ_DMA_EXT) >= 16);
    assert_eq!(dev.count_ata(ata::command::SEEK), 20);
    assert!(
        dev.history()
            .iter()
            .filter(|issued| issued.ata_command == Some(ata::command::SEEK))
            .all(|issued| !issued.extended)
    );
}

#[rstest]
fn test_ata_media_error_attributed_per_block(options: ScanOptions) {
    let mut dev = EmulatedDevice::ata(1000, AtaFeatures::default())
        .with_fault(500..510, FaultKind::Sense(SenseTriple::UNRECOVERED_READ_ERROR));
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert_eq!(results.errored, 10);
    assert_eq!(results.unreadable.first(), Some(&500));
}

#[rstest]
fn test_ata_lba28_pio_when_extended_not_permitted(options: ScanOptions) {
    let features = AtaFeatures {
        dma: false,
        ..AtaFeatures::default()
    };
    let mut dev = EmulatedDevice::ata(1000, features).without_extended_addressing();
    let results = ScanEngine::new(&mut dev, options).run().unwrap();

    assert_eq!(
        results.read_path,
        Some(ReadPath::Ata(AtaReadMode {
            addressing: AddressingMode::Lba28,
            dma: false
        }))
    );
    assert_eq!(dev.count_ata(ata::command::READ_SECTORS_EXT), 0);
    assert!(dev.count_ata(ata::command::READ_SECTORS) > 0);
}

#[rstest]
fn test_lba48_only_disk_declined_by_policy(options: ScanOptions) {
    let features = AtaFeatures {
        lba: false,
        ..AtaFeatures::default()
    };
    let mut dev = EmulatedDevice::ata(1000, features).without_extended_addressing();
    let err = ScanEngine::new(&mut dev, options).run().unwrap_err();

    assert!(matches!(err, ScanError::Declined { .. }));
    assert_eq!(dev.count_ata(ata::command::READ_DMA_EXT), 0);
}

#[rstest]
fn test_scsi_preference_skips_identify(options: ScanOptions) {
    let mut dev = EmulatedDevice::ata(100, AtaFeatures::default());
    let results = ScanEngine::new(&mut dev, options.with_interface(InterfacePreference::Scsi))
        .run()
        .unwrap();

    assert_eq!(dev.count_ata(ata::command::IDENTIFY_DEVICE), 0);
    assert!(matches!(results.read_path, Some(ReadPath::Scsi(_))));
}
