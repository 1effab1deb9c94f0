//! ATA task-file registers.
//!
//! Three addressing layouts exist: CHS, 28-bit LBA and 48-bit LBA. In the
//! 48-bit layout every register is 16 bits wide and is written twice: the
//! low byte lands in the "current" register and the high byte in the
//! "previous" (HOB) register. [`split_u16`] and [`join_u16`] are the single
//! byte-order convention used for both directions.
//!
//! Commands reach the device either as a SAT ATA PASS-THROUGH (16) CDB
//! ([`AtaCommand::sat_cdb`]) or as a raw current/previous task-file pair
//! ([`AtaRegisters::task_file`]), depending on what the OS interface takes.

use serde::Serialize;

use crate::codec::DataDirection;
use crate::core::{DecodeError, EncodingError};

/// ATA command opcodes.
pub mod command {
    pub const READ_SECTORS: u8 = 0x20;
    pub const READ_SECTORS_EXT: u8 = 0x24;
    pub const READ_DMA_EXT: u8 = 0x25;
    pub const SEEK: u8 = 0x70;
    pub const READ_DMA: u8 = 0xC8;
    pub const IDENTIFY_DEVICE: u8 = 0xEC;
}

/// Status register bits.
pub mod status {
    pub const BSY: u8 = 0x80;
    pub const DRDY: u8 = 0x40;
    pub const DF: u8 = 0x20;
    pub const DRQ: u8 = 0x08;
    pub const CORR: u8 = 0x04;
    pub const ERR: u8 = 0x01;

    /// BSY, DF, CORR and ERR. Any of them set after completion means the
    /// command did not succeed cleanly.
    pub const ERROR_MASK: u8 = 0xA5;
}

/// Error register bits.
pub mod error {
    pub const UNC: u8 = 0x40;
    pub const IDNF: u8 = 0x10;
    pub const ABRT: u8 = 0x04;
}

pub const MAX_LBA28: u64 = 0x0FFF_FFFF;
pub const MAX_LBA48: u64 = 0xFFFF_FFFF_FFFF;

const DEVICE_LBA: u8 = 0x40;
const DEVICE_CHS: u8 = 0xA0;

/// Splits a 16-bit register value into `(low, high)`. The low byte is the
/// one sent first.
#[inline]
pub const fn split_u16(value: u16) -> (u8, u8) {
    ((value & 0xFF) as u8, (value >> 8) as u8)
}

#[inline]
pub const fn join_u16(low: u8, high: u8) -> u16 {
    ((high as u16) << 8) + low as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressingMode {
    Chs,
    Lba28,
    Lba48,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtaRegistersChs {
    pub feature: u8,
    pub sector_count: u8,
    pub sector: u8,
    pub cylinder: u16,
    pub head: u8,
    pub command: u8,
}

impl AtaRegistersChs {
    pub fn new(
        command: u8,
        cylinder: u16,
        head: u8,
        sector: u8,
        sector_count: u8,
    ) -> Result<Self, EncodingError> {
        if sector == 0 {
            return Err(EncodingError::FieldOutOfRange {
                field: "CHS sector (numbered from 1)",
                value: 0,
                max: 255,
            });
        }
        if head > 15 {
            return Err(EncodingError::FieldOutOfRange {
                field: "CHS head",
                value: u64::from(head),
                max: 15,
            });
        }
        Ok(Self {
            feature: 0,
            sector_count,
            sector,
            cylinder,
            head,
            command,
        })
    }

    #[inline]
    pub fn device_head(&self) -> u8 {
        DEVICE_CHS | (self.head & 0x0F)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtaRegistersLba28 {
    pub feature: u8,
    pub sector_count: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub device_head: u8,
    pub command: u8,
}

impl AtaRegistersLba28 {
    pub fn new(command: u8, lba: u64, sector_count: u8) -> Result<Self, EncodingError> {
        if lba > MAX_LBA28 {
            return Err(EncodingError::FieldOutOfRange {
                field: "LBA28 address",
                value: lba,
                max: MAX_LBA28,
            });
        }
        Ok(Self {
            feature: 0,
            sector_count,
            lba_low: lba as u8,
            lba_mid: (lba >> 8) as u8,
            lba_high: (lba >> 16) as u8,
            device_head: DEVICE_LBA | ((lba >> 24) as u8 & 0x0F),
            command,
        })
    }

    pub fn lba(&self) -> u64 {
        u64::from(self.device_head & 0x0F) << 24
            | u64::from(self.lba_high) << 16
            | u64::from(self.lba_mid) << 8
            | u64::from(self.lba_low)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtaRegistersLba48 {
    pub feature: u16,
    pub sector_count: u16,
    pub lba_low: u16,
    pub lba_mid: u16,
    pub lba_high: u16,
    pub device_head: u8,
    pub command: u8,
}

impl AtaRegistersLba48 {
    /// A `sector_count` of zero means 65536 sectors to the device.
    pub fn new(command: u8, lba: u64, sector_count: u16) -> Result<Self, EncodingError> {
        if lba > MAX_LBA48 {
            return Err(EncodingError::FieldOutOfRange {
                field: "LBA48 address",
                value: lba,
                max: MAX_LBA48,
            });
        }
        let byte = |shift: u32| (lba >> shift) as u8 as u16;
        Ok(Self {
            feature: 0,
            sector_count,
            lba_low: byte(24) << 8 | byte(0),
            lba_mid: byte(32) << 8 | byte(8),
            lba_high: byte(40) << 8 | byte(16),
            device_head: DEVICE_LBA,
            command,
        })
    }

    pub fn lba(&self) -> u64 {
        let (l0, l3) = split_u16(self.lba_low);
        let (l1, l4) = split_u16(self.lba_mid);
        let (l2, l5) = split_u16(self.lba_high);
        [l5, l4, l3, l2, l1, l0]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }

    /// `(low, high)` byte pairs in the order lbaLow, lbaMid, lbaHigh,
    /// feature, sectorCount.
    pub fn register_pairs(&self) -> [(u8, u8); 5] {
        [
            split_u16(self.lba_low),
            split_u16(self.lba_mid),
            split_u16(self.lba_high),
            split_u16(self.feature),
            split_u16(self.sector_count),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaRegisters {
    Chs(AtaRegistersChs),
    Lba28(AtaRegistersLba28),
    Lba48(AtaRegistersLba48),
}

impl AtaRegisters {
    pub fn mode(&self) -> AddressingMode {
        match self {
            Self::Chs(_) => AddressingMode::Chs,
            Self::Lba28(_) => AddressingMode::Lba28,
            Self::Lba48(_) => AddressingMode::Lba48,
        }
    }

    #[inline]
    pub fn is_extended(&self) -> bool {
        matches!(self, Self::Lba48(_))
    }

    pub fn command(&self) -> u8 {
        match self {
            Self::Chs(r) => r.command,
            Self::Lba28(r) => r.command,
            Self::Lba48(r) => r.command,
        }
    }

    fn image(&self) -> RegisterImage {
        match *self {
            Self::Chs(r) => {
                let (cyl_low, cyl_high) = split_u16(r.cylinder);
                RegisterImage {
                    feature: (r.feature, 0),
                    count: (r.sector_count, 0),
                    lba_low: (r.sector, 0),
                    lba_mid: (cyl_low, 0),
                    lba_high: (cyl_high, 0),
                    device: r.device_head(),
                    command: r.command,
                }
            }
            Self::Lba28(r) => RegisterImage {
                feature: (r.feature, 0),
                count: (r.sector_count, 0),
                lba_low: (r.lba_low, 0),
                lba_mid: (r.lba_mid, 0),
                lba_high: (r.lba_high, 0),
                device: r.device_head,
                command: r.command,
            },
            Self::Lba48(r) => {
                let [lba_low, lba_mid, lba_high, feature, count] = r.register_pairs();
                RegisterImage {
                    feature,
                    count,
                    lba_low,
                    lba_mid,
                    lba_high,
                    device: r.device_head,
                    command: r.command,
                }
            }
        }
    }

    /// Current/previous register pair as taken by task-file interfaces.
    pub fn task_file(&self) -> AtaTaskFile {
        let img = self.image();
        AtaTaskFile {
            current: [
                img.feature.0,
                img.count.0,
                img.lba_low.0,
                img.lba_mid.0,
                img.lba_high.0,
                img.device,
                img.command,
                0,
            ],
            previous: [
                img.feature.1,
                img.count.1,
                img.lba_low.1,
                img.lba_mid.1,
                img.lba_high.1,
                0,
                0,
                0,
            ],
            extended: self.is_extended(),
        }
    }
}

/// Register contents in `(low, high)` form, shared by the outbound
/// encoders.
struct RegisterImage {
    feature: (u8, u8),
    count: (u8, u8),
    lba_low: (u8, u8),
    lba_mid: (u8, u8),
    lba_high: (u8, u8),
    device: u8,
    command: u8,
}

/// Offsets into [`AtaTaskFile::current`] / [`AtaTaskFile::previous`].
pub mod task_file {
    pub const FEATURE: usize = 0;
    pub const COUNT: usize = 1;
    pub const LBA_LOW: usize = 2;
    pub const LBA_MID: usize = 3;
    pub const LBA_HIGH: usize = 4;
    pub const DEVICE: usize = 5;
    /// Command on the way out, status on the way back.
    pub const COMMAND: usize = 6;
}

/// The eight-byte current and previous task-file images.
///
/// On the way back from the device the feature slot holds the error
/// register and the command slot holds the status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtaTaskFile {
    pub current: [u8; 8],
    pub previous: [u8; 8],
    pub extended: bool,
}

impl AtaTaskFile {
    fn pair(&self, index: usize) -> u16 {
        join_u16(self.current[index], self.previous[index])
    }

    /// Rebuilds the outbound register set. Used by device emulation to see
    /// what was sent.
    pub fn registers(&self) -> AtaRegisters {
        use task_file::*;
        let command = self.current[COMMAND];
        let device = self.current[DEVICE];
        if self.extended {
            AtaRegisters::Lba48(AtaRegistersLba48 {
                feature: self.pair(FEATURE),
                sector_count: self.pair(COUNT),
                lba_low: self.pair(LBA_LOW),
                lba_mid: self.pair(LBA_MID),
                lba_high: self.pair(LBA_HIGH),
                device_head: device,
                command,
            })
        } else if device & DEVICE_LBA != 0 {
            AtaRegisters::Lba28(AtaRegistersLba28 {
                feature: self.current[FEATURE],
                sector_count: self.current[COUNT],
                lba_low: self.current[LBA_LOW],
                lba_mid: self.current[LBA_MID],
                lba_high: self.current[LBA_HIGH],
                device_head: device,
                command,
            })
        } else {
            AtaRegisters::Chs(AtaRegistersChs {
                feature: self.current[FEATURE],
                sector_count: self.current[COUNT],
                sector: self.current[LBA_LOW],
                cylinder: join_u16(self.current[LBA_MID], self.current[LBA_HIGH]),
                head: device & 0x0F,
                command,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AtaProtocol {
    NonData,
    PioIn,
    DmaIn,
}

impl AtaProtocol {
    /// SAT-3 PROTOCOL field value.
    fn sat_code(self) -> u8 {
        match self {
            Self::NonData => 3,
            Self::PioIn => 4,
            Self::DmaIn => 6,
        }
    }

    pub fn direction(self) -> DataDirection {
        match self {
            Self::NonData => DataDirection::None,
            Self::PioIn | Self::DmaIn => DataDirection::In,
        }
    }

    pub fn is_dma(self) -> bool {
        matches!(self, Self::DmaIn)
    }
}

const SAT_CK_COND: u8 = 0x20;
const SAT_T_DIR_IN: u8 = 0x08;
const SAT_BYT_BLOK: u8 = 0x04;
/// T_LENGTH: transfer length is in the SECTOR COUNT field.
const SAT_T_LENGTH_COUNT: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtaCommand {
    pub registers: AtaRegisters,
    pub protocol: AtaProtocol,
    /// Bytes expected from the device.
    pub transfer_length: usize,
}

impl AtaCommand {
    pub fn new(registers: AtaRegisters, protocol: AtaProtocol, transfer_length: usize) -> Self {
        Self {
            registers,
            protocol,
            transfer_length,
        }
    }

    pub fn identify_device() -> Self {
        let registers = AtaRegisters::Chs(AtaRegistersChs {
            command: command::IDENTIFY_DEVICE,
            ..AtaRegistersChs::default()
        });
        Self::new(registers, AtaProtocol::PioIn, 512)
    }

    /// SAT ATA PASS-THROUGH (16). `CK_COND` is always set so the device
    /// returns the ATA Return Descriptor whether or not the command failed.
    pub fn sat_cdb(&self) -> [u8; 16] {
        let img = self.registers.image();
        let mut cdb = [0u8; 16];
        cdb[0] = super::cdb::opcode::ATA_PASS_THROUGH_16;
        cdb[1] = self.protocol.sat_code() << 1 | u8::from(self.registers.is_extended());
        cdb[2] = SAT_CK_COND;
        if self.protocol.direction() == DataDirection::In {
            cdb[2] |= SAT_T_DIR_IN | SAT_BYT_BLOK | SAT_T_LENGTH_COUNT;
        }
        let fields = [img.feature, img.count, img.lba_low, img.lba_mid, img.lba_high];
        for (i, (low, high)) in fields.into_iter().enumerate() {
            cdb[3 + 2 * i] = high;
            cdb[4 + 2 * i] = low;
        }
        cdb[13] = img.device;
        cdb[14] = img.command;
        cdb
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AtaErrorRegistersChs {
    pub status: u8,
    pub error: u8,
    pub sector_count: u8,
    pub sector: u8,
    pub cylinder: u16,
    pub device_head: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AtaErrorRegistersLba28 {
    pub status: u8,
    pub error: u8,
    pub sector_count: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub device_head: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AtaErrorRegistersLba48 {
    pub status: u8,
    pub error: u8,
    pub sector_count: u16,
    pub lba_low: u16,
    pub lba_mid: u16,
    pub lba_high: u16,
    pub device_head: u8,
}

/// Register contents after command completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AtaErrorRegisters {
    Chs(AtaErrorRegistersChs),
    Lba28(AtaErrorRegistersLba28),
    Lba48(AtaErrorRegistersLba48),
}

/// Inbound register contents in `(low, high)` form.
#[derive(Default)]
struct ReturnImage {
    error: u8,
    count: (u8, u8),
    lba_low: (u8, u8),
    lba_mid: (u8, u8),
    lba_high: (u8, u8),
    device: u8,
    status: u8,
}

impl ReturnImage {
    fn into_registers(self, mode: AddressingMode) -> AtaErrorRegisters {
        let Self {
            error,
            count,
            lba_low,
            lba_mid,
            lba_high,
            device,
            status,
        } = self;
        match mode {
            AddressingMode::Chs => AtaErrorRegisters::Chs(AtaErrorRegistersChs {
                status,
                error,
                sector_count: count.0,
                sector: lba_low.0,
                cylinder: join_u16(lba_mid.0, lba_high.0),
                device_head: device,
            }),
            AddressingMode::Lba28 => AtaErrorRegisters::Lba28(AtaErrorRegistersLba28 {
                status,
                error,
                sector_count: count.0,
                lba_low: lba_low.0,
                lba_mid: lba_mid.0,
                lba_high: lba_high.0,
                device_head: device,
            }),
            AddressingMode::Lba48 => AtaErrorRegisters::Lba48(AtaErrorRegistersLba48 {
                status,
                error,
                sector_count: join_u16(count.0, count.1),
                lba_low: join_u16(lba_low.0, lba_low.1),
                lba_mid: join_u16(lba_mid.0, lba_mid.1),
                lba_high: join_u16(lba_high.0, lba_high.1),
                device_head: device,
            }),
        }
    }
}

/// Descriptor code of the SAT ATA Return Descriptor.
pub const ATA_RETURN_DESCRIPTOR: u8 = 0x09;
const ATA_RETURN_DESCRIPTOR_LEN: usize = 14;

impl AtaErrorRegisters {
    pub fn status(&self) -> u8 {
        match self {
            Self::Chs(r) => r.status,
            Self::Lba28(r) => r.status,
            Self::Lba48(r) => r.status,
        }
    }

    pub fn error(&self) -> u8 {
        match self {
            Self::Chs(r) => r.error,
            Self::Lba28(r) => r.error,
            Self::Lba48(r) => r.error,
        }
    }

    pub fn mode(&self) -> AddressingMode {
        match self {
            Self::Chs(_) => AddressingMode::Chs,
            Self::Lba28(_) => AddressingMode::Lba28,
            Self::Lba48(_) => AddressingMode::Lba48,
        }
    }

    /// True when the command failed: a non-zero error register, or any of
    /// the [`status::ERROR_MASK`] bits.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.error() != 0 || self.status() & status::ERROR_MASK != 0
    }

    /// Decodes a task-file echo as returned by task-file interfaces.
    pub fn from_task_file(tf: &AtaTaskFile, mode: AddressingMode) -> Self {
        use task_file::*;
        let pair = |i: usize| (tf.current[i], tf.previous[i]);
        ReturnImage {
            error: tf.current[FEATURE],
            count: pair(COUNT),
            lba_low: pair(LBA_LOW),
            lba_mid: pair(LBA_MID),
            lba_high: pair(LBA_HIGH),
            device: tf.current[DEVICE],
            status: tf.current[COMMAND],
        }
        .into_registers(mode)
    }

    /// Decodes the body of an ATA Return Descriptor (descriptor code 0x09,
    /// starting at the code byte).
    pub fn from_return_descriptor(
        descriptor: &[u8],
        mode: AddressingMode,
    ) -> Result<Self, DecodeError> {
        if descriptor.len() < ATA_RETURN_DESCRIPTOR_LEN {
            return Err(DecodeError::Truncated {
                what: "ATA return descriptor",
                needed: ATA_RETURN_DESCRIPTOR_LEN,
                actual: descriptor.len(),
            });
        }
        if descriptor[0] != ATA_RETURN_DESCRIPTOR {
            return Err(DecodeError::Malformed {
                what: "ATA return descriptor",
                reason: format!("descriptor code {:#04x}", descriptor[0]),
            });
        }
        let d = descriptor;
        Ok(ReturnImage {
            error: d[3],
            count: (d[5], d[4]),
            lba_low: (d[7], d[6]),
            lba_mid: (d[9], d[8]),
            lba_high: (d[11], d[10]),
            device: d[12],
            status: d[13],
        }
        .into_registers(mode))
    }

    /// Decodes SAT fixed-format ATA status sense. Only the 28-bit fields are
    /// carried in this format, so the high bytes read back as zero.
    pub fn from_fixed_sense(sense: &[u8], mode: AddressingMode) -> Result<Self, DecodeError> {
        const NEEDED: usize = 12;
        if sense.len() < NEEDED {
            return Err(DecodeError::Truncated {
                what: "fixed-format ATA sense",
                needed: NEEDED,
                actual: sense.len(),
            });
        }
        Ok(ReturnImage {
            error: sense[3],
            status: sense[4],
            device: sense[5],
            count: (sense[6], 0),
            lba_low: (sense[9], 0),
            lba_mid: (sense[10], 0),
            lba_high: (sense[11], 0),
        }
        .into_registers(mode))
    }

    /// Address echoed back by the device, where the mode carries one.
    pub fn lba(&self) -> Option<u64> {
        match *self {
            Self::Chs(_) => None,
            Self::Lba28(r) => Some(
                u64::from(r.device_head & 0x0F) << 24
                    | u64::from(r.lba_high) << 16
                    | u64::from(r.lba_mid) << 8
                    | u64::from(r.lba_low),
            ),
            Self::Lba48(r) => Some(
                AtaRegistersLba48 {
                    lba_low: r.lba_low,
                    lba_mid: r.lba_mid,
                    lba_high: r.lba_high,
                    ..AtaRegistersLba48::default()
                }
                .lba(),
            ),
        }
    }
}
