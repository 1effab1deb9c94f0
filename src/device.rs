//! Device identification and capacity discovery.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::classify::{Classification, classify_ata, classify_scsi};
use crate::codec::cdb::be_uint;
use crate::codec::{AddressingMode, AtaCommand, Cdb, CommandDescriptor, ScsiResult};
use crate::core::{DecodeError, ScanError};
use crate::scan::ScanState;
use crate::transport::DeviceTransport;

const INQUIRY_LEN: usize = 36;
const READ_CAPACITY_16_LEN: usize = 32;
const IDENTIFY_LEN: usize = 512;
const PERIPHERAL_OPTICAL: u8 = 0x05;

/// Command set to drive the device with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum InterfacePreference {
    /// ATA when the device identifies as an ATA disk, SCSI otherwise.
    #[default]
    Auto,
    Scsi,
    Ata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceClass {
    DirectAccess,
    Optical,
    Ata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inquiry {
    pub peripheral_type: u8,
    pub removable: bool,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl Inquiry {
    /// Standard INQUIRY data. Text fields are space-trimmed ASCII.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < INQUIRY_LEN {
            return Err(DecodeError::Truncated {
                what: "INQUIRY data",
                needed: INQUIRY_LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            peripheral_type: data[0] & 0x1F,
            removable: data[1] & 0x80 != 0,
            vendor: ascii_field(&data[8..16]),
            product: ascii_field(&data[16..32]),
            revision: ascii_field(&data[32..36]),
        })
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub last_lba: u64,
    pub block_size: u32,
}

impl Capacity {
    /// Block count; a zero block length means an empty medium.
    #[inline]
    pub fn total_blocks(&self) -> u64 {
        if self.block_size == 0 {
            0
        } else {
            self.last_lba.saturating_add(1)
        }
    }

    /// READ CAPACITY (10) data. A last LBA of 0xFFFFFFFF means "ask READ
    /// CAPACITY (16)".
    pub fn parse_10(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 8 {
            return Err(DecodeError::Truncated {
                what: "READ CAPACITY (10) data",
                needed: 8,
                actual: data.len(),
            });
        }
        Ok(Self {
            last_lba: be_uint(&data[0..4]),
            block_size: be_uint(&data[4..8]) as u32,
        })
    }

    pub fn parse_16(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 12 {
            return Err(DecodeError::Truncated {
                what: "READ CAPACITY (16) data",
                needed: 12,
                actual: data.len(),
            });
        }
        Ok(Self {
            last_lba: be_uint(&data[0..8]),
            block_size: be_uint(&data[8..12]) as u32,
        })
    }

    fn needs_16(&self) -> bool {
        self.last_lba == u64::from(u32::MAX)
    }
}

/// Decoded IDENTIFY DEVICE data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtaIdentity {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub lba: bool,
    pub lba48: bool,
    pub dma: bool,
    pub cylinders: u16,
    pub heads: u16,
    pub sectors_per_track: u16,
    pub lba28_sectors: u32,
    pub lba48_sectors: u64,
    pub logical_sector_size: u32,
}

impl AtaIdentity {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < IDENTIFY_LEN {
            return Err(DecodeError::Truncated {
                what: "IDENTIFY DEVICE data",
                needed: IDENTIFY_LEN,
                actual: data.len(),
            });
        }
        let word = |i: usize| u16::from_le_bytes([data[2 * i], data[2 * i + 1]]);
        let dword = |i: usize| u32::from(word(i)) | u32::from(word(i + 1)) << 16;

        let lba48_sectors = (0..4).fold(0u64, |acc, i| acc | u64::from(word(100 + i)) << (16 * i));
        // Word 106: bit 14 set and bit 15 clear marks the word valid;
        // bit 12 means words 117-118 hold the logical sector size in words.
        let w106 = word(106);
        let logical_sector_size = if w106 & 0xC000 == 0x4000 && w106 & (1 << 12) != 0 {
            dword(117).saturating_mul(2)
        } else {
            512
        };

        Ok(Self {
            model: ata_string(data, 27, 47),
            serial: ata_string(data, 10, 20),
            firmware: ata_string(data, 23, 27),
            lba: word(49) & (1 << 9) != 0,
            lba48: word(83) & (1 << 10) != 0,
            dma: word(49) & (1 << 8) != 0,
            cylinders: word(1),
            heads: word(3),
            sectors_per_track: word(6),
            lba28_sectors: dword(60),
            lba48_sectors,
            logical_sector_size: if logical_sector_size == 0 { 512 } else { logical_sector_size },
        })
    }

    /// Addressable sectors in the widest mode the device supports.
    pub fn total_sectors(&self) -> u64 {
        if self.lba48 && self.lba48_sectors != 0 {
            self.lba48_sectors
        } else if self.lba {
            u64::from(self.lba28_sectors)
        } else {
            u64::from(self.cylinders) * u64::from(self.heads) * u64::from(self.sectors_per_track)
        }
    }
}

/// Words `start..end` as an ATA string: two characters per word, first
/// character in the high byte.
fn ata_string(data: &[u8], start: usize, end: usize) -> String {
    let bytes: Vec<u8> = data[2 * start..2 * end]
        .chunks_exact(2)
        .flat_map(|w| [w[1], w[0]])
        .collect();
    ascii_field(&bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub class: DeviceClass,
    pub inquiry: Inquiry,
    pub ata: Option<AtaIdentity>,
}

impl DeviceInfo {
    #[inline]
    pub fn removable(&self) -> bool {
        self.inquiry.removable
    }
}

/// Identifies the device behind `transport`.
pub fn discover<T: DeviceTransport + ?Sized>(
    transport: &mut T,
    preference: InterfacePreference,
    timeout: Duration,
) -> Result<DeviceInfo, ScanError> {
    let phase = ScanState::Init;
    let cmd = CommandDescriptor::scsi_in(Cdb::inquiry(INQUIRY_LEN as u16), INQUIRY_LEN)
        .with_timeout(timeout);
    let result = checked_scsi(transport, &cmd, phase, "INQUIRY")?;
    let inquiry = Inquiry::parse(&result.data).map_err(ScanError::decoding(phase))?;

    info!(
        vendor = %inquiry.vendor,
        product = %inquiry.product,
        peripheral_type = inquiry.peripheral_type,
        removable = inquiry.removable,
        "device identified"
    );

    if inquiry.peripheral_type == PERIPHERAL_OPTICAL {
        return Ok(DeviceInfo {
            class: DeviceClass::Optical,
            inquiry,
            ata: None,
        });
    }

    let try_ata = match preference {
        InterfacePreference::Ata => true,
        InterfacePreference::Auto => inquiry.vendor == "ATA",
        InterfacePreference::Scsi => false,
    };
    if try_ata {
        match identify(transport, timeout) {
            Ok(identity) => {
                info!(model = %identity.model, lba48 = identity.lba48, "ATA device");
                return Ok(DeviceInfo {
                    class: DeviceClass::Ata,
                    inquiry,
                    ata: Some(identity),
                });
            }
            Err(err) if preference == InterfacePreference::Ata => return Err(err),
            Err(err) => debug!(%err, "IDENTIFY DEVICE failed, using SCSI commands"),
        }
    }

    Ok(DeviceInfo {
        class: DeviceClass::DirectAccess,
        inquiry,
        ata: None,
    })
}

fn identify<T: DeviceTransport + ?Sized>(
    transport: &mut T,
    timeout: Duration,
) -> Result<AtaIdentity, ScanError> {
    let phase = ScanState::Init;
    let cmd = CommandDescriptor::ata(AtaCommand::identify_device()).with_timeout(timeout);
    let raw = transport
        .execute(&cmd)
        .map_err(|e| ScanError::transport(phase, e))?;
    let result = raw.into_ata(AddressingMode::Chs);
    match classify_ata(&result) {
        Classification::Ok => {}
        other => {
            return Err(ScanError::CommandFailed {
                command: "IDENTIFY DEVICE",
                detail: format!("{other:?}"),
            });
        }
    }
    AtaIdentity::parse(&result.scsi.data).map_err(ScanError::decoding(phase))
}

/// Medium capacity. Removable media report it only once ready, so this
/// runs after unit-ready negotiation.
pub fn read_capacity<T: DeviceTransport + ?Sized>(
    transport: &mut T,
    device: &DeviceInfo,
    timeout: Duration,
) -> Result<Capacity, ScanError> {
    let phase = ScanState::SizeProbe;
    if let Some(identity) = &device.ata {
        if identity.total_sectors() == 0 {
            return Err(ScanError::ZeroBlocks);
        }
        return Ok(Capacity {
            last_lba: identity.total_sectors().saturating_sub(1),
            block_size: identity.logical_sector_size,
        });
    }

    let cmd = CommandDescriptor::scsi_in(Cdb::read_capacity_10(), 8).with_timeout(timeout);
    let result = checked_scsi(transport, &cmd, phase, "READ CAPACITY (10)")?;
    let capacity = Capacity::parse_10(&result.data).map_err(ScanError::decoding(phase))?;
    if !capacity.needs_16() {
        return Ok(capacity);
    }

    debug!("capacity exceeds 32 bits, using READ CAPACITY (16)");
    let cmd = CommandDescriptor::scsi_in(
        Cdb::read_capacity_16(READ_CAPACITY_16_LEN as u32),
        READ_CAPACITY_16_LEN,
    )
    .with_timeout(timeout);
    let result = checked_scsi(transport, &cmd, phase, "READ CAPACITY (16)")?;
    Capacity::parse_16(&result.data).map_err(ScanError::decoding(phase))
}

/// Runs a SCSI command that has to succeed.
pub(crate) fn checked_scsi<T: DeviceTransport + ?Sized>(
    transport: &mut T,
    cmd: &CommandDescriptor,
    phase: ScanState,
    name: &'static str,
) -> Result<ScsiResult, ScanError> {
    let result = transport
        .execute(cmd)
        .map_err(|e| ScanError::transport(phase, e))?
        .into_scsi();
    match classify_scsi(&result) {
        Classification::Ok => Ok(result),
        other => Err(ScanError::CommandFailed {
            command: name,
            detail: format!("{other:?}"),
        }),
    }
}
