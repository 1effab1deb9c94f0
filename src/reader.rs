//! Uniform "read N blocks at LBA" over SCSI, MMC and ATA commands.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::{Classification, FatalReason, classify_ata, classify_scsi};
use crate::codec::ata::{self, AtaRegistersChs, AtaRegistersLba28, AtaRegistersLba48};
use crate::codec::cdb::{MAX_READ_6_LBA, MAX_READ_CD_BLOCKS, RAW_CD_SECTOR_SIZE};
use crate::codec::sense::key;
use crate::codec::{AddressingMode, AtaCommand, AtaProtocol, AtaRegisters, Cdb, CommandDescriptor};
use crate::core::{EncodingError, ScanError, TransportError};
use crate::device::{Capacity, DeviceClass, DeviceInfo};
use crate::scan::ScanState;
use crate::transport::DeviceTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScsiReadCommand {
    Read6,
    Read10,
    Read12,
    Read16,
}

impl ScsiReadCommand {
    fn max_blocks(self) -> u32 {
        match self {
            Self::Read6 => 256,
            Self::Read10 => u32::from(u16::MAX),
            Self::Read12 | Self::Read16 => u32::MAX,
        }
    }

    fn max_lba(self) -> u64 {
        match self {
            Self::Read6 => MAX_READ_6_LBA,
            Self::Read10 | Self::Read12 => u64::from(u32::MAX),
            Self::Read16 => u64::MAX,
        }
    }

    fn cdb(self, lba: u64, blocks: u32) -> Result<Cdb, EncodingError> {
        match self {
            Self::Read6 => Cdb::read_6(lba, blocks),
            Self::Read10 => Cdb::read_10(lba, blocks),
            Self::Read12 => Cdb::read_12(lba, blocks),
            Self::Read16 => Ok(Cdb::read_16(lba, blocks)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AtaReadMode {
    pub addressing: AddressingMode,
    pub dma: bool,
}

impl AtaReadMode {
    fn opcode(self) -> u8 {
        match (self.addressing, self.dma) {
            (AddressingMode::Lba48, true) => ata::command::READ_DMA_EXT,
            (AddressingMode::Lba48, false) => ata::command::READ_SECTORS_EXT,
            (_, true) => ata::command::READ_DMA,
            (_, false) => ata::command::READ_SECTORS,
        }
    }

    fn max_blocks(self) -> u32 {
        match self.addressing {
            AddressingMode::Lba48 => 65536,
            _ => 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReadPath {
    Scsi(ScsiReadCommand),
    /// MMC READ CD of full 2352-byte sectors.
    ReadCd,
    Ata(AtaReadMode),
}

impl fmt::Display for ReadPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scsi(ScsiReadCommand::Read6) => f.write_str("READ (6)"),
            Self::Scsi(ScsiReadCommand::Read10) => f.write_str("READ (10)"),
            Self::Scsi(ScsiReadCommand::Read12) => f.write_str("READ (12)"),
            Self::Scsi(ScsiReadCommand::Read16) => f.write_str("READ (16)"),
            Self::ReadCd => f.write_str("READ CD"),
            Self::Ata(mode) => write!(
                f,
                "ATA {:?} {}",
                mode.addressing,
                if mode.dma { "DMA" } else { "PIO" }
            ),
        }
    }
}

/// Result of one read or seek that reached the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub elapsed: Duration,
    pub classification: Classification,
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    heads: u64,
    sectors_per_track: u64,
}

impl Geometry {
    const MAX_HEADS: u16 = 16;
    const MAX_SECTORS_PER_TRACK: u16 = 255;

    /// Zero counts are read as one; counts the CHS task file cannot carry
    /// are refused.
    fn from_identity(heads: u16, sectors_per_track: u16) -> Result<Self, EncodingError> {
        if heads > Self::MAX_HEADS {
            return Err(EncodingError::FieldOutOfRange {
                field: "CHS head count",
                value: u64::from(heads),
                max: u64::from(Self::MAX_HEADS),
            });
        }
        if sectors_per_track > Self::MAX_SECTORS_PER_TRACK {
            return Err(EncodingError::FieldOutOfRange {
                field: "CHS sectors per track",
                value: u64::from(sectors_per_track),
                max: u64::from(Self::MAX_SECTORS_PER_TRACK),
            });
        }
        Ok(Self {
            heads: u64::from(heads.max(1)),
            sectors_per_track: u64::from(sectors_per_track.max(1)),
        })
    }
}

pub struct BlockReader {
    path: ReadPath,
    block_size: u32,
    total_blocks: u64,
    timeout: Duration,
    scsi_seek: bool,
    geometry: Option<Geometry>,
}

impl BlockReader {
    /// Picks the read command for a device.
    ///
    /// SCSI devices start on READ (10), or READ (16) past 32-bit addressing.
    /// ATA devices use LBA48 when supported and either permitted, needed for
    /// the capacity, or the only LBA mode; then LBA28; then CHS. DMA is used
    /// whenever IDENTIFY reports it. A CHS geometry the task file cannot
    /// address is an [`EncodingError`].
    pub fn select(
        device: &DeviceInfo,
        capacity: Capacity,
        extended_permitted: bool,
        timeout: Duration,
    ) -> Result<Self, EncodingError> {
        let mut geometry = None;
        let path = match (&device.class, &device.ata) {
            (DeviceClass::Ata, Some(id)) => {
                let addressing = if id.lba48
                    && (extended_permitted || capacity.last_lba > ata::MAX_LBA28 || !id.lba)
                {
                    AddressingMode::Lba48
                } else if id.lba {
                    AddressingMode::Lba28
                } else {
                    geometry = Some(Geometry::from_identity(id.heads, id.sectors_per_track)?);
                    AddressingMode::Chs
                };
                ReadPath::Ata(AtaReadMode {
                    addressing,
                    dma: id.dma,
                })
            }
            _ if capacity.last_lba > u64::from(u32::MAX) => ReadPath::Scsi(ScsiReadCommand::Read16),
            _ => ReadPath::Scsi(ScsiReadCommand::Read10),
        };
        info!(path = %path, block_size = capacity.block_size, "read path selected");

        Ok(Self {
            path,
            block_size: capacity.block_size,
            total_blocks: capacity.total_blocks(),
            timeout,
            scsi_seek: true,
            geometry,
        })
    }

    #[inline]
    pub fn path(&self) -> ReadPath {
        self.path
    }

    #[inline]
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    #[inline]
    pub fn logical_block_size(&self) -> u32 {
        self.block_size
    }

    /// Bytes each block occupies in returned data.
    pub fn bytes_per_block(&self) -> u32 {
        match self.path {
            ReadPath::ReadCd => RAW_CD_SECTOR_SIZE,
            _ => self.block_size,
        }
    }

    /// Largest block count one command of the current path can carry.
    pub fn max_transfer_blocks(&self) -> u32 {
        match self.path {
            ReadPath::Scsi(cmd) => cmd.max_blocks(),
            ReadPath::ReadCd => MAX_READ_CD_BLOCKS,
            ReadPath::Ata(mode) => mode.max_blocks(),
        }
    }

    /// Switches every later read and seek to READ CD.
    pub fn use_read_cd(&mut self) {
        self.path = ReadPath::ReadCd;
    }

    /// Tests whether the device answers READ CD, one sector at LBA 0.
    pub fn supports_read_cd<T: DeviceTransport + ?Sized>(
        &self,
        transport: &mut T,
    ) -> Result<bool, TransportError> {
        let cmd = CommandDescriptor::scsi_in(Cdb::read_cd(0, 1)?, RAW_CD_SECTOR_SIZE as usize)
            .with_timeout(self.timeout);
        let result = transport.execute(&cmd)?.into_scsi();
        Ok(classify_scsi(&result).is_ok())
    }

    fn scsi_fallbacks(&self, failed: ScsiReadCommand) -> Option<ScsiReadCommand> {
        use ScsiReadCommand::*;
        let last = self.total_blocks.saturating_sub(1);
        let order = [Read10, Read12, Read16, Read6];
        let at = order.iter().position(|&c| c == failed)?;
        order[at + 1..]
            .iter()
            .copied()
            .find(|c| last <= c.max_lba())
    }

    /// Reads `count` blocks starting at `start`.
    ///
    /// `Err` means no result came back at all. A command the device failed
    /// is `Ok` and carries its classification.
    pub fn read_blocks<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        start: u64,
        count: u32,
    ) -> Result<ReadOutcome, TransportError> {
        loop {
            let outcome = match self.path {
                ReadPath::Scsi(cmd) => {
                    let len = count as usize * self.block_size as usize;
                    let desc = CommandDescriptor::scsi_in(cmd.cdb(start, count)?, len)
                        .with_timeout(self.timeout);
                    self.run_scsi(transport, &desc)?
                }
                ReadPath::ReadCd => {
                    let len = count as usize * RAW_CD_SECTOR_SIZE as usize;
                    let desc = CommandDescriptor::scsi_in(Cdb::read_cd(start, count)?, len)
                        .with_timeout(self.timeout);
                    self.run_scsi(transport, &desc)?
                }
                ReadPath::Ata(mode) => {
                    let registers = self.ata_registers(mode, mode.opcode(), start, count)?;
                    let protocol = if mode.dma { AtaProtocol::DmaIn } else { AtaProtocol::PioIn };
                    let len = count as usize * self.block_size as usize;
                    let desc = CommandDescriptor::ata(AtaCommand::new(registers, protocol, len))
                        .with_timeout(self.timeout);
                    self.run_ata(transport, &desc, mode.addressing)?
                }
            };

            if let ReadPath::Scsi(cmd) = self.path
                && is_rejected_opcode(&outcome.classification)
                && let Some(next) = self.scsi_fallbacks(cmd)
            {
                warn!(from = ?cmd, to = ?next, "read command rejected, falling back");
                self.path = ReadPath::Scsi(next);
                continue;
            }
            return Ok(outcome);
        }
    }

    /// Positions the head at `lba` for the seek benchmark.
    pub fn seek<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        lba: u64,
    ) -> Result<ReadOutcome, TransportError> {
        match self.path {
            ReadPath::Scsi(_) if self.scsi_seek && lba <= u64::from(u32::MAX) => {
                let desc = CommandDescriptor::scsi(Cdb::seek_10(lba)?).with_timeout(self.timeout);
                let outcome = self.run_scsi(transport, &desc)?;
                if !is_rejected_opcode(&outcome.classification) {
                    return Ok(outcome);
                }
                debug!("SEEK (10) rejected, seeking with single-block reads");
                self.scsi_seek = false;
                self.read_blocks(transport, lba, 1)
            }
            ReadPath::Ata(mode) => {
                // SEEK has no 48-bit form; LBA48 devices get the 28-bit one.
                let mode = match mode.addressing {
                    AddressingMode::Lba48 => AtaReadMode {
                        addressing: AddressingMode::Lba28,
                        ..mode
                    },
                    _ => mode,
                };
                let target = match mode.addressing {
                    AddressingMode::Lba28 => lba.min(ata::MAX_LBA28),
                    _ => lba,
                };
                let registers = self.ata_registers(mode, ata::command::SEEK, target, 1)?;
                let command = AtaCommand::new(registers, AtaProtocol::NonData, 0);
                let desc = CommandDescriptor::ata(command).with_timeout(self.timeout);
                self.run_ata(transport, &desc, mode.addressing)
            }
            _ => self.read_blocks(transport, lba, 1),
        }
    }

    /// Finds a transfer size the OS accepts.
    ///
    /// Starts at the largest power of two no greater than `initial`, the
    /// path limit or the medium, and halves after every transport-level
    /// rejection. A read
    /// that reaches the device settles the size even if the device failed
    /// it. Failing at one block is [`ScanError::TransferSizeUnknown`].
    pub fn probe_transfer_size<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        initial: u32,
        phase: ScanState,
    ) -> Result<u32, ScanError> {
        let medium = u32::try_from(self.total_blocks).unwrap_or(u32::MAX);
        let limit = initial.min(self.max_transfer_blocks()).min(medium).max(1);
        let mut size = 1u32 << limit.ilog2();
        loop {
            match self.read_blocks(transport, 0, size) {
                Ok(outcome) => {
                    let classification = outcome.classification;
                    debug!(size, ?classification, "transfer size accepted");
                    return Ok(size);
                }
                Err(err) if err.is_refusal() || err.is_session_fatal() => {
                    return Err(ScanError::transport(phase, err));
                }
                Err(err) if size == 1 => {
                    warn!(%err, "single-block read rejected");
                    return Err(ScanError::TransferSizeUnknown);
                }
                Err(err) => {
                    debug!(size, %err, "transfer size rejected, halving");
                    size /= 2;
                }
            }
        }
    }

    fn ata_registers(
        &self,
        mode: AtaReadMode,
        command: u8,
        lba: u64,
        count: u32,
    ) -> Result<AtaRegisters, EncodingError> {
        let out_of_range = |max: u64| EncodingError::FieldOutOfRange {
            field: "ATA sector count",
            value: u64::from(count),
            max,
        };
        match mode.addressing {
            AddressingMode::Lba48 => {
                if count == 0 || count > 65536 {
                    return Err(out_of_range(65536));
                }
                let n = if count == 65536 { 0 } else { count as u16 };
                Ok(AtaRegisters::Lba48(AtaRegistersLba48::new(command, lba, n)?))
            }
            AddressingMode::Lba28 => {
                if count == 0 || count > 256 {
                    return Err(out_of_range(256));
                }
                let n = if count == 256 { 0 } else { count as u8 };
                Ok(AtaRegisters::Lba28(AtaRegistersLba28::new(command, lba, n)?))
            }
            AddressingMode::Chs => {
                if count == 0 || count > 256 {
                    return Err(out_of_range(256));
                }
                let n = if count == 256 { 0 } else { count as u8 };
                let g = self.geometry.unwrap_or(Geometry {
                    heads: 16,
                    sectors_per_track: 63,
                });
                let sector = lba % g.sectors_per_track + 1;
                let track = lba / g.sectors_per_track;
                let head = track % g.heads;
                let cylinder = track / g.heads;
                if cylinder > u64::from(u16::MAX) {
                    return Err(EncodingError::FieldOutOfRange {
                        field: "CHS cylinder",
                        value: cylinder,
                        max: u64::from(u16::MAX),
                    });
                }
                Ok(AtaRegisters::Chs(AtaRegistersChs::new(
                    command,
                    cylinder as u16,
                    head as u8,
                    sector as u8,
                    n,
                )?))
            }
        }
    }

    fn run_scsi<T: DeviceTransport + ?Sized>(
        &self,
        transport: &mut T,
        desc: &CommandDescriptor,
    ) -> Result<ReadOutcome, TransportError> {
        let result = transport.execute(desc)?.into_scsi();
        let classification = classify_scsi(&result);
        Ok(ReadOutcome {
            elapsed: result.elapsed,
            data: result.data,
            classification,
        })
    }

    fn run_ata<T: DeviceTransport + ?Sized>(
        &self,
        transport: &mut T,
        desc: &CommandDescriptor,
        mode: AddressingMode,
    ) -> Result<ReadOutcome, TransportError> {
        let result = transport.execute(desc)?.into_ata(mode);
        let classification = classify_ata(&result);
        Ok(ReadOutcome {
            elapsed: result.scsi.elapsed,
            data: result.scsi.data,
            classification,
        })
    }
}

/// ILLEGAL REQUEST with INVALID COMMAND OPERATION CODE or INVALID FIELD IN
/// CDB: the device does not do this command, as opposed to failing it.
fn is_rejected_opcode(classification: &Classification) -> bool {
    matches!(
        classification,
        Classification::Fatal(FatalReason::Sense(t))
            if t.key() == key::ILLEGAL_REQUEST && matches!(t.asc(), 0x20 | 0x24)
    )
}
