//! Block reader tests
//!
//! Read path selection, transfer-size probing and seeks against emulated
//! devices.

use std::time::Duration;

use mediascan::codec::ata;
use mediascan::codec::cdb::opcode;
use mediascan::codec::{AddressingMode, CommandDescriptor, DEFAULT_TIMEOUT};
use mediascan::device::{self, DeviceInfo};
use mediascan::reader::{BlockReader, ScsiReadCommand};
use mediascan::transport::emulated::{AtaFeatures, FaultKind};
use mediascan::{
    Classification, DeviceClass, DeviceTransport, EmulatedDevice, EncodingError,
    InterfacePreference, ReadPath, ScanError, ScanState, TransportError,
};
use rstest::*;

fn reader_for(
    dev: &mut EmulatedDevice,
    preference: InterfacePreference,
) -> (DeviceInfo, BlockReader) {
    let info = device::discover(dev, preference, DEFAULT_TIMEOUT).unwrap();
    let capacity = device::read_capacity(dev, &info, DEFAULT_TIMEOUT).unwrap();
    let extended = dev.supports_extended_addressing();
    let reader = BlockReader::select(&info, capacity, extended, DEFAULT_TIMEOUT).unwrap();
    (info, reader)
}

// ============================================================================
// Discovery
// ============================================================================

#[rstest]
#[case::disk(EmulatedDevice::disk(10, 512), DeviceClass::DirectAccess)]
#[case::optical(EmulatedDevice::optical(10), DeviceClass::Optical)]
#[case::ata(EmulatedDevice::ata(10, AtaFeatures::default()), DeviceClass::Ata)]
fn test_discover_class(#[case] mut dev: EmulatedDevice, #[case] expected: DeviceClass) {
    let info = device::discover(&mut dev, InterfacePreference::Auto, DEFAULT_TIMEOUT).unwrap();
    assert_eq!(info.class, expected);
}

#[test]
fn test_discover_reads_identification() {
    let mut dev = EmulatedDevice::disk(10, 512).with_identity("ACME", "SPINNER 9000");
    let info = device::discover(&mut dev, InterfacePreference::Auto, DEFAULT_TIMEOUT).unwrap();
    assert_eq!(info.inquiry.vendor, "ACME");
    assert_eq!(info.inquiry.product, "SPINNER 9000");
}

#[test]
fn test_forced_ata_on_scsi_disk_fails() {
    let mut dev = EmulatedDevice::disk(10, 512);
    let err = device::discover(&mut dev, InterfacePreference::Ata, DEFAULT_TIMEOUT).unwrap_err();
    assert!(matches!(err, ScanError::CommandFailed { command: "IDENTIFY DEVICE", .. }));
}

#[test]
fn test_ata_capacity_from_identify() {
    let mut dev = EmulatedDevice::ata(12345, AtaFeatures::default());
    let (info, reader) = reader_for(&mut dev, InterfacePreference::Auto);
    assert!(info.ata.is_some());
    assert_eq!(reader.total_blocks(), 12345);
    assert_eq!(dev.count(opcode::READ_CAPACITY_10), 0);
}

// ============================================================================
// Reads
// ============================================================================

#[test]
fn test_read_returns_stamped_blocks() {
    let mut dev = EmulatedDevice::disk(100, 512);
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    let outcome = reader.read_blocks(&mut dev, 10, 2).unwrap();

    assert_eq!(outcome.classification, Classification::Ok);
    assert_eq!(outcome.data.len(), 1024);
    assert_eq!(u64::from_le_bytes(outcome.data[..8].try_into().unwrap()), 10);
    assert_eq!(u64::from_le_bytes(outcome.data[512..520].try_into().unwrap()), 11);
    assert_eq!(outcome.elapsed, Duration::from_millis(1));
}

#[test]
fn test_media_error_is_an_outcome_not_an_error() {
    let mut dev = EmulatedDevice::disk(100, 512).with_fault(
        5..6,
        FaultKind::Sense(mediascan::SenseTriple::UNRECOVERED_READ_ERROR),
    );
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    let outcome = reader.read_blocks(&mut dev, 0, 10).unwrap();
    assert!(matches!(outcome.classification, Classification::Fatal(_)));
}

#[rstest]
#[case(vec![opcode::READ_10], ScsiReadCommand::Read12)]
#[case(vec![opcode::READ_10, opcode::READ_12], ScsiReadCommand::Read16)]
#[case(vec![opcode::READ_10, opcode::READ_12, opcode::READ_16], ScsiReadCommand::Read6)]
fn test_read_fallback_order(#[case] unsupported: Vec<u8>, #[case] expected: ScsiReadCommand) {
    let mut dev = unsupported
        .into_iter()
        .fold(EmulatedDevice::disk(100, 512), |dev, op| dev.with_unsupported_opcode(op));
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    let outcome = reader.read_blocks(&mut dev, 0, 4).unwrap();

    assert_eq!(outcome.classification, Classification::Ok);
    assert_eq!(reader.path(), ReadPath::Scsi(expected));
}

#[test]
fn test_read_cd_returns_raw_sectors() {
    let mut dev = EmulatedDevice::optical(50);
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    assert!(reader.supports_read_cd(&mut dev).unwrap());
    reader.use_read_cd();
    let outcome = reader.read_blocks(&mut dev, 3, 2).unwrap();

    assert_eq!(reader.bytes_per_block(), 2352);
    assert_eq!(reader.logical_block_size(), 2048);
    assert_eq!(outcome.data.len(), 2 * 2352);
    assert_eq!(dev.count(opcode::READ_CD), 2);
}

// ============================================================================
// Transfer size
// ============================================================================

#[rstest]
#[case(None, 64)]
#[case(Some(40), 32)]
#[case(Some(1), 1)]
fn test_probe_halves_on_rejection(#[case] limit: Option<u32>, #[case] expected: u32) {
    let dev = EmulatedDevice::disk(1000, 512);
    let mut dev = match limit {
        Some(blocks) => dev.with_max_transfer_blocks(blocks),
        None => dev,
    };
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    let size = reader
        .probe_transfer_size(&mut dev, 64, ScanState::SizeProbe)
        .unwrap();
    assert_eq!(size, expected);
}

#[rstest]
#[case(10, 64, 8)]
#[case(1000, 48, 32)]
#[case(64, 64, 64)]
fn test_probe_starts_at_power_of_two(
    #[case] blocks: u64,
    #[case] initial: u32,
    #[case] expected: u32,
) {
    let mut dev = EmulatedDevice::disk(blocks, 512);
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    let size = reader
        .probe_transfer_size(&mut dev, initial, ScanState::SizeProbe)
        .unwrap();
    assert_eq!(size, expected);
    assert_eq!(dev.history().last().map(|issued| issued.blocks), Some(expected));
}

#[test]
fn test_fallback_beyond_cdb_limit_is_encoding_error() {
    let mut dev = EmulatedDevice::disk(100, 512)
        .with_unsupported_opcode(opcode::READ_10)
        .with_max_cdb_length(10);
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    let err = reader
        .probe_transfer_size(&mut dev, 64, ScanState::SizeProbe)
        .unwrap_err();
    assert!(matches!(err, ScanError::Encoding(EncodingError::CdbTooLong { len: 12, max: 10 })));
    assert_eq!(dev.count(opcode::READ_12), 0);
}

#[test]
fn test_probe_gives_up_at_one_block() {
    let mut dev = EmulatedDevice::disk(100, 512).with_fault(0..1, FaultKind::Transport);
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    let err = reader
        .probe_transfer_size(&mut dev, 64, ScanState::SizeProbe)
        .unwrap_err();
    assert!(matches!(err, ScanError::TransferSizeUnknown));
}

#[test]
fn test_lba48_declined_before_submission() {
    let features = AtaFeatures {
        lba: false,
        ..AtaFeatures::default()
    };
    let mut dev = EmulatedDevice::ata(100, features).without_extended_addressing();
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    let issued = dev.history().len();

    let err = reader.read_blocks(&mut dev, 0, 1).unwrap_err();
    assert!(matches!(err, TransportError::DeclinedByPolicy { .. }));
    assert_eq!(dev.history().len(), issued);
}

// ============================================================================
// Seeks
// ============================================================================

#[test]
fn test_seek_falls_back_to_single_block_reads() {
    let mut dev = EmulatedDevice::disk(100, 512).with_unsupported_opcode(opcode::SEEK_10);
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);

    for lba in [10, 20, 30] {
        let outcome = reader.seek(&mut dev, lba).unwrap();
        assert_eq!(outcome.classification, Classification::Ok);
    }
    assert_eq!(dev.count(opcode::SEEK_10), 1);
    assert_eq!(dev.count(opcode::READ_10), 3);
}

#[test]
fn test_ata_seek_uses_28_bit_task_file() {
    let mut dev = EmulatedDevice::ata(1000, AtaFeatures::default());
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    assert!(matches!(
        reader.path(),
        ReadPath::Ata(mode) if mode.addressing == AddressingMode::Lba48
    ));

    let outcome = reader.seek(&mut dev, 777).unwrap();
    assert_eq!(outcome.classification, Classification::Ok);
    let issued = dev.history().last().copied().unwrap();
    assert_eq!(issued.ata_command, Some(ata::command::SEEK));
    assert_eq!(issued.lba, Some(777));
    assert!(!issued.extended);
}

#[test]
fn test_seek_reports_device_latency() {
    let mut dev = EmulatedDevice::disk(100, 512).with_seek_latency(Duration::from_millis(12));
    let (_, mut reader) = reader_for(&mut dev, InterfacePreference::Auto);
    let outcome = reader.seek(&mut dev, 50).unwrap();
    assert_eq!(outcome.elapsed, Duration::from_millis(12));
}

#[test]
fn test_raw_execute_against_emulated_device() {
    let mut dev = EmulatedDevice::disk(100, 512);
    let cmd = CommandDescriptor::scsi(mediascan::codec::Cdb::test_unit_ready());
    let raw = dev.execute(&cmd).unwrap();
    assert!(raw.into_scsi().is_good());
}
