//! Codec tests
//!
//! CDB builders, ATA register packing and sense decoding.

use mediascan::codec::ata::{self, AtaRegistersLba28, AtaRegistersLba48, join_u16, split_u16};
use mediascan::codec::cdb::opcode;
use mediascan::codec::mmc::Toc;
use mediascan::codec::{
    AtaCommand, AtaErrorRegisters, AtaProtocol, AtaRegisters, Cdb, CommandDescriptor, DataDirection,
    SenseData, SenseTriple,
};
use mediascan::EncodingError;
use proptest::prelude::*;
use rstest::*;

// ============================================================================
// Encoding
// ============================================================================

#[test]
fn test_cdb_longer_than_transport_limit_is_refused() {
    let cdb = Cdb::from_bytes(vec![0xC0; 17]);
    let cmd = CommandDescriptor::scsi(cdb);
    match cmd.encode(16) {
        Err(EncodingError::CdbTooLong { len, max }) => assert_eq!((len, max), (17, 16)),
        other => panic!("expected CdbTooLong, got {other:?}"),
    }
    assert!(cmd.encode(255).is_ok());
}

#[test]
fn test_empty_cdb_and_empty_transfer_are_refused() {
    let empty = CommandDescriptor::scsi(Cdb::from_bytes(Vec::new()));
    assert!(matches!(empty.encode(16), Err(EncodingError::EmptyCdb)));

    let no_buffer = CommandDescriptor::scsi_in(Cdb::inquiry(36), 0);
    assert!(matches!(
        no_buffer.encode(16),
        Err(EncodingError::EmptyTransfer {
            direction: DataDirection::In
        })
    ));

    let no_payload = CommandDescriptor::scsi_out(Cdb::from_bytes(vec![0x2A; 10]), Vec::new());
    assert!(matches!(
        no_payload.encode(16),
        Err(EncodingError::EmptyTransfer {
            direction: DataDirection::Out
        })
    ));
}

#[test]
fn test_data_out_carries_payload() {
    let cmd = CommandDescriptor::scsi_out(Cdb::from_bytes(vec![0x2A; 10]), vec![7; 512]);
    let encoded = cmd.encode(16).unwrap();
    assert_eq!(encoded.direction, DataDirection::Out);
    assert_eq!(encoded.transfer_length, 512);
    assert_eq!(encoded.payload, &[7u8; 512][..]);
}

#[rstest]
#[case::read_6_lba(Cdb::read_6(0x20_0000, 1))]
#[case::read_6_count(Cdb::read_6(0, 257))]
#[case::read_10_count(Cdb::read_10(0, 0x1_0000))]
#[case::read_10_lba(Cdb::read_10(1 << 32, 1))]
#[case::read_cd_count(Cdb::read_cd(0, 0x100_0000))]
fn test_builders_refuse_out_of_range(#[case] built: Result<Cdb, EncodingError>) {
    assert!(matches!(built, Err(EncodingError::FieldOutOfRange { .. })));
}

#[test]
fn test_read_10_layout() {
    let cdb = Cdb::read_10(0x0102_0304, 0x0506).unwrap();
    assert_eq!(cdb.as_slice(), &[opcode::READ_10, 0, 1, 2, 3, 4, 0, 5, 6, 0]);
}

#[test]
fn test_ata_command_encodes_as_sat_pass_through() {
    let regs = AtaRegistersLba48::new(ata::command::READ_DMA_EXT, 0x0000_1234_5678, 8).unwrap();
    let command = AtaCommand::new(AtaRegisters::Lba48(regs), AtaProtocol::DmaIn, 8 * 512);
    let cmd = CommandDescriptor::ata(command);
    let encoded = cmd.encode(16).unwrap();

    assert_eq!(encoded.opcode(), opcode::ATA_PASS_THROUGH_16);
    assert_eq!(encoded.cdb.len(), 16);
    assert_eq!(encoded.cdb[14], ata::command::READ_DMA_EXT);
    assert_eq!(encoded.cdb[1] & 1, 1, "extend bit");
    assert!(encoded.ata.is_some_and(|tf| tf.extended));
    assert!(cmd.requires_extended_addressing());
}

// ============================================================================
// Register packing
// ============================================================================

#[test]
fn test_lba48_register_pairs() {
    let regs =
        AtaRegistersLba48::new(ata::command::READ_SECTORS_EXT, 0x0000_1234_5678, 0x0100).unwrap();
    let pairs = regs.register_pairs();
    assert_eq!(pairs[0], (0x78, 0x12));
    assert_eq!(pairs[1], (0x56, 0x00));
    assert_eq!(pairs[2], (0x34, 0x00));
    assert_eq!(pairs[4], (0x00, 0x01));
}

#[test]
fn test_lba_limits() {
    assert!(AtaRegistersLba28::new(ata::command::READ_SECTORS, ata::MAX_LBA28 + 1, 1).is_err());
    assert!(AtaRegistersLba48::new(ata::command::READ_SECTORS_EXT, ata::MAX_LBA48 + 1, 1).is_err());
}

proptest! {
    #[test]
    fn prop_split_join_roundtrip(value: u16) {
        let (low, high) = split_u16(value);
        prop_assert_eq!(join_u16(low, high), value);
    }

    #[test]
    fn prop_lba48_task_file_roundtrip(lba in 0u64..=ata::MAX_LBA48, count: u16) {
        let regs = AtaRegistersLba48::new(ata::command::READ_SECTORS_EXT, lba, count).unwrap();
        prop_assert_eq!(regs.lba(), lba);
        let tf = AtaRegisters::Lba48(regs).task_file();
        let echoed = AtaErrorRegisters::from_task_file(&tf, ata::AddressingMode::Lba48);
        prop_assert_eq!(echoed.lba(), Some(lba));
    }

    #[test]
    fn prop_lba28_roundtrip(lba in 0u64..=ata::MAX_LBA28) {
        let regs = AtaRegistersLba28::new(ata::command::READ_SECTORS, lba, 1).unwrap();
        prop_assert_eq!(regs.lba(), lba);
    }

    #[test]
    fn prop_sense_decode_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = SenseData::decode(&raw);
    }

    #[test]
    fn prop_toc_parse_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..128)) {
        let _ = Toc::parse(&raw);
    }
}

// ============================================================================
// Sense decoding
// ============================================================================

#[rstest]
#[case::fixed(SenseTriple::MEDIUM_NOT_PRESENT.to_fixed_sense())]
#[case::descriptor(SenseTriple::MEDIUM_NOT_PRESENT.to_descriptor_sense(&[]))]
fn test_sense_formats_decode_to_same_triple(#[case] raw: Vec<u8>) {
    let sense = SenseData::decode(&raw).unwrap();
    assert_eq!(sense.triple, SenseTriple::MEDIUM_NOT_PRESENT);
    assert!(!sense.deferred);
}

#[test]
fn test_unknown_response_code_is_malformed() {
    let mut raw = SenseTriple::ABORTED_COMMAND.to_fixed_sense();
    raw[0] = 0x7F;
    assert!(SenseData::decode(&raw).is_err());
}
