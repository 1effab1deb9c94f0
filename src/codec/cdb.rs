//! SCSI command descriptor blocks.
//!
//! Layouts follow SPC-4 (primary commands), SBC-3 (block commands) and
//! MMC-6 (multimedia commands). Every multi-byte field in a CDB is
//! big-endian. Builders that take an address or a length refuse values the
//! field cannot hold instead of silently truncating them.

use crate::core::EncodingError;

/// Operation codes used by this crate.
pub mod opcode {
    /// SPC-4 6.47
    pub const TEST_UNIT_READY: u8 = 0x00;
    /// SBC-3 5.12
    pub const READ_6: u8 = 0x08;
    /// SPC-4 6.6
    pub const INQUIRY: u8 = 0x12;
    /// SBC-3 5.16
    pub const READ_CAPACITY_10: u8 = 0x25;
    /// SBC-3 5.13
    pub const READ_10: u8 = 0x28;
    /// SBC-2 5.x (obsolete in SBC-3, still implemented by most drives)
    pub const SEEK_10: u8 = 0x2B;
    /// MMC-6 6.32
    pub const READ_TOC_PMA_ATIP: u8 = 0x43;
    /// MMC-6 6.6
    pub const GET_CONFIGURATION: u8 = 0x46;
    /// SAT-3 12.2.2
    pub const ATA_PASS_THROUGH_16: u8 = 0x85;
    /// SBC-3 5.15
    pub const READ_16: u8 = 0x88;
    /// SBC-3 5.17 (READ CAPACITY (16) is service action 0x10)
    pub const SERVICE_ACTION_IN_16: u8 = 0x9E;
    /// SBC-3 5.14
    pub const READ_12: u8 = 0xA8;
    /// MMC-6 6.19
    pub const READ_CD: u8 = 0xBE;
}

const READ_CAPACITY_16_SERVICE_ACTION: u8 = 0x10;

/// Largest LBA a READ (6) can address (21 bits).
pub const MAX_READ_6_LBA: u64 = 0x1F_FFFF;
/// Largest transfer length a READ CD can carry (24 bits).
pub const MAX_READ_CD_BLOCKS: u32 = 0xFF_FFFF;
/// Bytes per sector returned by [`Cdb::read_cd`]: sync, headers, user data
/// and EDC/ECC of a CD sector.
pub const RAW_CD_SECTOR_SIZE: u32 = 2352;

/// READ CD byte 9: SYNC, all header codes, USER DATA and EDC/ECC.
const READ_CD_FULL_SECTOR: u8 = 0b1111_1000;

/// The raw bytes of a SCSI command.
///
/// Builders produce the standard 6/10/12/16 byte forms. [`Cdb::from_bytes`]
/// accepts any length so vendor and variable-length CDBs can be issued;
/// whether the transport can carry them is checked when the command is
/// encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cdb {
    bytes: Vec<u8>,
}

impl Cdb {
    fn zeroed(operation_code: u8, len: usize) -> Self {
        let mut bytes = vec![0; len];
        bytes[0] = operation_code;
        Self { bytes }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn operation_code(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// "The TEST UNIT READY command provides a means to check if the logical
    /// unit is ready."
    pub fn test_unit_ready() -> Self {
        Self::zeroed(opcode::TEST_UNIT_READY, 6)
    }

    /// Standard INQUIRY data, `allocation_length` bytes (at least 36 are
    /// needed for vendor and product identification).
    pub fn inquiry(allocation_length: u16) -> Self {
        let mut cdb = Self::zeroed(opcode::INQUIRY, 6);
        cdb.bytes[3..5].copy_from_slice(&allocation_length.to_be_bytes());
        cdb
    }

    pub fn read_capacity_10() -> Self {
        Self::zeroed(opcode::READ_CAPACITY_10, 10)
    }

    pub fn read_capacity_16(allocation_length: u32) -> Self {
        let mut cdb = Self::zeroed(opcode::SERVICE_ACTION_IN_16, 16);
        cdb.bytes[1] = READ_CAPACITY_16_SERVICE_ACTION;
        cdb.bytes[10..14].copy_from_slice(&allocation_length.to_be_bytes());
        cdb
    }

    /// READ (6). A transfer length of 256 is encoded as zero.
    pub fn read_6(lba: u64, blocks: u32) -> Result<Self, EncodingError> {
        check("READ (6) logical block address", lba, MAX_READ_6_LBA)?;
        if blocks == 0 {
            return Err(EncodingError::FieldOutOfRange {
                field: "READ (6) transfer length",
                value: 0,
                max: 256,
            });
        }
        check("READ (6) transfer length", u64::from(blocks), 256)?;

        let mut cdb = Self::zeroed(opcode::READ_6, 6);
        let lba = (lba as u32).to_be_bytes();
        cdb.bytes[1] = lba[1] & 0x1F;
        cdb.bytes[2] = lba[2];
        cdb.bytes[3] = lba[3];
        cdb.bytes[4] = (blocks & 0xFF) as u8;
        Ok(cdb)
    }

    pub fn read_10(lba: u64, blocks: u32) -> Result<Self, EncodingError> {
        check("READ (10) logical block address", lba, u64::from(u32::MAX))?;
        check("READ (10) transfer length", u64::from(blocks), u64::from(u16::MAX))?;

        let mut cdb = Self::zeroed(opcode::READ_10, 10);
        cdb.bytes[2..6].copy_from_slice(&(lba as u32).to_be_bytes());
        cdb.bytes[7..9].copy_from_slice(&(blocks as u16).to_be_bytes());
        Ok(cdb)
    }

    pub fn read_12(lba: u64, blocks: u32) -> Result<Self, EncodingError> {
        check("READ (12) logical block address", lba, u64::from(u32::MAX))?;

        let mut cdb = Self::zeroed(opcode::READ_12, 12);
        cdb.bytes[2..6].copy_from_slice(&(lba as u32).to_be_bytes());
        cdb.bytes[6..10].copy_from_slice(&blocks.to_be_bytes());
        Ok(cdb)
    }

    pub fn read_16(lba: u64, blocks: u32) -> Self {
        let mut cdb = Self::zeroed(opcode::READ_16, 16);
        cdb.bytes[2..10].copy_from_slice(&lba.to_be_bytes());
        cdb.bytes[10..14].copy_from_slice(&blocks.to_be_bytes());
        cdb
    }

    pub fn seek_10(lba: u64) -> Result<Self, EncodingError> {
        check("SEEK (10) logical block address", lba, u64::from(u32::MAX))?;

        let mut cdb = Self::zeroed(opcode::SEEK_10, 10);
        cdb.bytes[2..6].copy_from_slice(&(lba as u32).to_be_bytes());
        Ok(cdb)
    }

    /// READ TOC/PMA/ATIP. Format 0 returns the formatted table of contents.
    pub fn read_toc(format: u8, msf: bool, track: u8, allocation_length: u16) -> Self {
        let mut cdb = Self::zeroed(opcode::READ_TOC_PMA_ATIP, 10);
        cdb.bytes[1] = if msf { 0b10 } else { 0 };
        cdb.bytes[2] = format & 0x0F;
        cdb.bytes[6] = track;
        cdb.bytes[7..9].copy_from_slice(&allocation_length.to_be_bytes());
        cdb
    }

    /// GET CONFIGURATION. `request_type` 0x02 returns only the feature named
    /// by `starting_feature`; the header (with the current profile) is
    /// always returned.
    pub fn get_configuration(
        request_type: u8,
        starting_feature: u16,
        allocation_length: u16,
    ) -> Self {
        let mut cdb = Self::zeroed(opcode::GET_CONFIGURATION, 10);
        cdb.bytes[1] = request_type & 0b11;
        cdb.bytes[2..4].copy_from_slice(&starting_feature.to_be_bytes());
        cdb.bytes[7..9].copy_from_slice(&allocation_length.to_be_bytes());
        cdb
    }

    /// READ CD of full 2352-byte sectors, any sector type, no subchannel.
    pub fn read_cd(lba: u64, blocks: u32) -> Result<Self, EncodingError> {
        check("READ CD logical block address", lba, u64::from(u32::MAX))?;
        check("READ CD transfer length", u64::from(blocks), u64::from(MAX_READ_CD_BLOCKS))?;

        let mut cdb = Self::zeroed(opcode::READ_CD, 12);
        cdb.bytes[2..6].copy_from_slice(&(lba as u32).to_be_bytes());
        cdb.bytes[6..9].copy_from_slice(&blocks.to_be_bytes()[1..]);
        cdb.bytes[9] = READ_CD_FULL_SECTOR;
        Ok(cdb)
    }
}

fn check(field: &'static str, value: u64, max: u64) -> Result<(), EncodingError> {
    if value > max {
        Err(EncodingError::FieldOutOfRange { field, value, max })
    } else {
        Ok(())
    }
}

/// Reads a big-endian integer of up to eight bytes from `bytes`.
pub(crate) fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}
