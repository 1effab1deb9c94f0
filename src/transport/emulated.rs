//! In-process emulated device.
//!
//! Answers the command set this crate issues the way a SCSI disk, an MMC
//! optical drive or an ATA disk behind a SAT layer would. Medium content is
//! either synthetic (every block starts with its own LBA, little-endian) or
//! a memory-mapped image file. Faults, latency and not-ready periods are
//! scripted up front.
//!
//! Latency is reported through [`RawResult::elapsed`] without sleeping, so
//! scans over emulated media are fast and their timing is deterministic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::codec::ata::{self, AtaErrorRegisters, AtaRegisters, ATA_RETURN_DESCRIPTOR};
use crate::codec::cdb::{RAW_CD_SECTOR_SIZE, be_uint, opcode};
use crate::codec::mmc::{Toc, TocTrack, profile};
use crate::codec::sense::{SenseTriple, status};
use crate::codec::{DataDirection, EncodedCommand, MAX_INLINE_CDB};
use crate::core::TransportError;
use crate::transport::{DeviceTransport, RawResult};

// EIO
const EMULATED_IO_ERROR: i32 = 5;
// EINVAL
const EMULATED_TRANSFER_TOO_LONG: i32 = 22;

const OPTICAL_BLOCK_SIZE: u32 = 2048;

/// Which command set the device answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulatedClass {
    Disk,
    Optical {
        profile: u16,
        toc: Option<Toc>,
        read_cd: bool,
    },
    Ata(AtaFeatures),
}

/// Capabilities reported by an emulated ATA disk's IDENTIFY data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtaFeatures {
    pub lba: bool,
    pub lba48: bool,
    pub dma: bool,
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl Default for AtaFeatures {
    fn default() -> Self {
        Self {
            lba: true,
            lba48: true,
            dma: true,
            cylinders: 16383,
            heads: 16,
            sectors_per_track: 63,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// CHECK CONDITION with this sense (an ATA device reports UNC instead).
    Sense(SenseTriple),
    /// The OS rejects the submission.
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fault {
    blocks: Range<u64>,
    kind: FaultKind,
}

enum Media {
    Synthetic,
    Image(Mmap),
}

/// One command as the device saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issued {
    pub opcode: u8,
    pub ata_command: Option<u8>,
    pub lba: Option<u64>,
    pub blocks: u32,
    /// 48-bit ATA task file.
    pub extended: bool,
}

pub struct EmulatedDevice {
    class: EmulatedClass,
    block_size: u32,
    total_blocks: u64,
    media: Media,
    removable: bool,
    vendor: String,
    product: String,
    not_ready: VecDeque<SenseTriple>,
    faults: Vec<Fault>,
    latency: Duration,
    range_latency: Vec<(Range<u64>, Duration)>,
    seek_latency: Duration,
    max_transfer_blocks: Option<u32>,
    unsupported: HashSet<u8>,
    short_responses: HashMap<u8, usize>,
    extended_addressing: bool,
    max_cdb_length: usize,
    disconnect_after: Option<usize>,
    history: Vec<Issued>,
}

impl EmulatedDevice {
    fn with_class(class: EmulatedClass, total_blocks: u64, block_size: u32) -> Self {
        Self {
            class,
            block_size,
            total_blocks,
            media: Media::Synthetic,
            removable: false,
            vendor: "MEDIASCN".to_string(),
            product: "EMULATED DEVICE".to_string(),
            not_ready: VecDeque::new(),
            faults: Vec::new(),
            latency: Duration::from_millis(1),
            range_latency: Vec::new(),
            seek_latency: Duration::from_millis(8),
            max_transfer_blocks: None,
            unsupported: HashSet::new(),
            short_responses: HashMap::new(),
            extended_addressing: true,
            max_cdb_length: MAX_INLINE_CDB,
            disconnect_after: None,
            history: Vec::new(),
        }
    }

    /// A SCSI direct-access disk.
    pub fn disk(total_blocks: u64, block_size: u32) -> Self {
        Self::with_class(EmulatedClass::Disk, total_blocks, block_size)
    }

    /// A removable MMC drive holding a single-data-track CD. Capacity is
    /// reported in 2048-byte blocks.
    pub fn optical(total_blocks: u64) -> Self {
        let toc = Toc {
            first_track: 1,
            last_track: 1,
            tracks: vec![
                TocTrack {
                    number: 1,
                    adr: 1,
                    control: 4,
                    start_lba: 0,
                },
                TocTrack {
                    number: TocTrack::LEAD_OUT,
                    adr: 1,
                    control: 4,
                    start_lba: total_blocks.min(u64::from(u32::MAX)) as u32,
                },
            ],
        };
        let mut dev = Self::with_class(
            EmulatedClass::Optical {
                profile: profile::CD_ROM,
                toc: Some(toc),
                read_cd: true,
            },
            total_blocks,
            OPTICAL_BLOCK_SIZE,
        );
        dev.removable = true;
        dev.product = "EMULATED CDROM".to_string();
        dev
    }

    /// An ATA disk reached through ATA PASS-THROUGH.
    pub fn ata(total_blocks: u64, features: AtaFeatures) -> Self {
        let mut dev = Self::with_class(EmulatedClass::Ata(features), total_blocks, 512);
        dev.vendor = "ATA".to_string();
        dev.product = "EMULATED ATA".to_string();
        dev
    }

    /// A disk whose medium is the content of `path`. Trailing bytes that do
    /// not fill a whole block are not addressable.
    pub fn from_image(path: impl AsRef<Path>, block_size: u32) -> io::Result<Self> {
        if block_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block size must be non-zero",
            ));
        }
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        let mut dev = Self::disk(len / u64::from(block_size), block_size);
        if len == 0 {
            return Ok(dev);
        }

        #[cfg(target_os = "linux")]
        {
            use rustix::fs::{Advice, fadvise};
            if let Err(err) = fadvise(&file, 0, None, Advice::Sequential) {
                debug!(%err, "sequential read-ahead hint not applied");
            }
        }

        // SAFETY: the mapping is read-only; a concurrent writer could change
        // the bytes under us but never invalidate the mapping.
        let mmap = unsafe { Mmap::map(&file) }?;
        dev.media = Media::Image(mmap);
        dev.product = "IMAGE FILE".to_string();
        Ok(dev)
    }

    pub fn removable(mut self) -> Self {
        self.removable = true;
        self
    }

    pub fn with_identity(mut self, vendor: &str, product: &str) -> Self {
        self.vendor = vendor.to_string();
        self.product = product.to_string();
        self
    }

    /// TEST UNIT READY answers these, in order, before reporting ready.
    pub fn with_not_ready(mut self, script: impl IntoIterator<Item = SenseTriple>) -> Self {
        self.not_ready.extend(script);
        self
    }

    /// Every read touching `blocks` fails with `kind`.
    pub fn with_fault(mut self, blocks: Range<u64>, kind: FaultKind) -> Self {
        self.faults.push(Fault { blocks, kind });
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Reads starting inside `blocks` take `latency`.
    pub fn with_range_latency(mut self, blocks: Range<u64>, latency: Duration) -> Self {
        self.range_latency.push((blocks, latency));
        self
    }

    pub fn with_seek_latency(mut self, latency: Duration) -> Self {
        self.seek_latency = latency;
        self
    }

    /// Reads of more than `blocks` are rejected by the "OS".
    pub fn with_max_transfer_blocks(mut self, blocks: u32) -> Self {
        self.max_transfer_blocks = Some(blocks);
        self
    }

    pub fn with_unsupported_opcode(mut self, opcode: u8) -> Self {
        self.unsupported.insert(opcode);
        self
    }

    /// Data returned for `op` is cut to `len` bytes.
    pub fn with_short_response(mut self, op: u8, len: usize) -> Self {
        self.short_responses.insert(op, len);
        self
    }

    pub fn with_profile(mut self, new_profile: u16) -> Self {
        if let EmulatedClass::Optical { profile, .. } = &mut self.class {
            *profile = new_profile;
        }
        self
    }

    pub fn with_toc(mut self, new_toc: Option<Toc>) -> Self {
        if let EmulatedClass::Optical { toc, .. } = &mut self.class {
            *toc = new_toc;
        }
        self
    }

    pub fn with_read_cd(mut self, supported: bool) -> Self {
        if let EmulatedClass::Optical { read_cd, .. } = &mut self.class {
            *read_cd = supported;
        }
        self
    }

    /// Makes 48-bit ATA unavailable on the emulated platform.
    pub fn without_extended_addressing(mut self) -> Self {
        self.extended_addressing = false;
        self
    }

    pub fn with_max_cdb_length(mut self, len: usize) -> Self {
        self.max_cdb_length = len;
        self
    }

    /// After `commands` submissions the handle goes away.
    pub fn disconnect_after(mut self, commands: usize) -> Self {
        self.disconnect_after = Some(commands);
        self
    }

    #[inline]
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn history(&self) -> &[Issued] {
        &self.history
    }

    pub fn count(&self, op: u8) -> usize {
        self.history.iter().filter(|i| i.opcode == op).count()
    }

    pub fn count_ata(&self, command: u8) -> usize {
        self.history
            .iter()
            .filter(|i| i.ata_command == Some(command))
            .count()
    }

    fn fill_block(&self, lba: u64, out: &mut Vec<u8>, bytes_per_block: usize) {
        let start = out.len();
        match &self.media {
            Media::Synthetic => {
                out.resize(start + bytes_per_block, 0);
                let stamp = lba.to_le_bytes();
                let n = stamp.len().min(bytes_per_block);
                out[start..start + n].copy_from_slice(&stamp[..n]);
            }
            Media::Image(mmap) => {
                let bs = self.block_size as usize;
                let offset = lba as usize * bs;
                out.extend_from_slice(&mmap[offset..offset + bs]);
                out.resize(start + bytes_per_block, 0);
            }
        }
    }

    fn latency_for(&self, lba: u64) -> Duration {
        self.range_latency
            .iter()
            .find(|(range, _)| range.contains(&lba))
            .map_or(self.latency, |(_, d)| *d)
    }

    fn fault_for(&self, lba: u64, blocks: u64) -> Option<FaultKind> {
        let end = lba.saturating_add(blocks);
        self.faults
            .iter()
            .find(|f| f.blocks.start < end && lba < f.blocks.end)
            .map(|f| f.kind)
    }

    fn read(
        &self,
        lba: u64,
        blocks: u32,
        bytes_per_block: usize,
    ) -> Result<RawResult, TransportError> {
        if self.max_transfer_blocks.is_some_and(|max| blocks > max) {
            return Err(TransportError::Rejected {
                code: EMULATED_TRANSFER_TOO_LONG,
            });
        }
        if lba.saturating_add(u64::from(blocks)) > self.total_blocks {
            return Ok(check_condition(SenseTriple::LBA_OUT_OF_RANGE, Duration::ZERO));
        }
        let elapsed = self.latency_for(lba);
        match self.fault_for(lba, u64::from(blocks)) {
            Some(FaultKind::Sense(sense)) => return Ok(check_condition(sense, elapsed)),
            Some(FaultKind::Transport) => {
                return Err(TransportError::Rejected {
                    code: EMULATED_IO_ERROR,
                });
            }
            None => {}
        }
        let mut data = Vec::with_capacity(blocks as usize * bytes_per_block);
        for i in 0..u64::from(blocks) {
            self.fill_block(lba + i, &mut data, bytes_per_block);
        }
        Ok(good(data, elapsed))
    }

    fn seek(&self, lba: u64) -> RawResult {
        if lba >= self.total_blocks {
            check_condition(SenseTriple::LBA_OUT_OF_RANGE, Duration::ZERO)
        } else {
            good(Vec::new(), self.seek_latency)
        }
    }

    fn inquiry(&self) -> Vec<u8> {
        let mut data = vec![0u8; 36];
        data[0] = match self.class {
            EmulatedClass::Optical { .. } => 0x05,
            _ => 0x00,
        };
        if self.removable {
            data[1] = 0x80;
        }
        data[2] = 0x05;
        data[3] = 0x02;
        data[4] = 31;
        padded(&mut data[8..16], &self.vendor);
        padded(&mut data[16..32], &self.product);
        padded(&mut data[32..36], "1.0");
        data
    }

    /// An empty medium reports a zero block length.
    fn reported_block_size(&self) -> u32 {
        if self.total_blocks == 0 { 0 } else { self.block_size }
    }

    fn read_capacity_10(&self) -> Vec<u8> {
        let last = self.total_blocks.saturating_sub(1);
        let last = u32::try_from(last).unwrap_or(u32::MAX);
        let mut data = last.to_be_bytes().to_vec();
        data.extend_from_slice(&self.reported_block_size().to_be_bytes());
        data
    }

    fn read_capacity_16(&self) -> Vec<u8> {
        let mut data = vec![0u8; 32];
        data[..8].copy_from_slice(&self.total_blocks.saturating_sub(1).to_be_bytes());
        data[8..12].copy_from_slice(&self.reported_block_size().to_be_bytes());
        data
    }

    fn handle_scsi(
        &mut self,
        cdb: &[u8],
        transfer_length: usize,
    ) -> Result<RawResult, TransportError> {
        let op = cdb[0];
        if self.unsupported.contains(&op) {
            return Ok(check_condition(SenseTriple::INVALID_OPCODE, Duration::ZERO));
        }
        let optical = match &self.class {
            EmulatedClass::Optical {
                profile,
                toc,
                read_cd,
            } => Some((*profile, toc.clone(), *read_cd)),
            _ => None,
        };
        let bs = self.block_size as usize;

        let mut result = match op {
            opcode::TEST_UNIT_READY => match self.not_ready.pop_front() {
                Some(sense) => check_condition(sense, Duration::ZERO),
                None => good(Vec::new(), Duration::ZERO),
            },
            opcode::INQUIRY => good(clip(self.inquiry(), transfer_length), Duration::ZERO),
            opcode::READ_CAPACITY_10 => good(self.read_capacity_10(), Duration::ZERO),
            opcode::SERVICE_ACTION_IN_16 if cdb.get(1).is_some_and(|sa| sa & 0x1F == 0x10) => {
                good(clip(self.read_capacity_16(), transfer_length), Duration::ZERO)
            }
            opcode::READ_6 if cdb.len() >= 6 => {
                let lba = be_uint(&cdb[1..4]) & 0x1F_FFFF;
                let blocks = if cdb[4] == 0 { 256 } else { u32::from(cdb[4]) };
                self.read(lba, blocks, bs)?
            }
            opcode::READ_10 if cdb.len() >= 10 => {
                self.read(be_uint(&cdb[2..6]), be_uint(&cdb[7..9]) as u32, bs)?
            }
            opcode::READ_12 if cdb.len() >= 12 => {
                self.read(be_uint(&cdb[2..6]), be_uint(&cdb[6..10]) as u32, bs)?
            }
            opcode::READ_16 if cdb.len() >= 16 => {
                self.read(be_uint(&cdb[2..10]), be_uint(&cdb[10..14]) as u32, bs)?
            }
            opcode::SEEK_10 if cdb.len() >= 10 => self.seek(be_uint(&cdb[2..6])),
            opcode::GET_CONFIGURATION if optical.is_some() => {
                let profile = optical.as_ref().map_or(profile::NONE, |o| o.0);
                let mut header = vec![0, 0, 0, 4, 0, 0, 0, 0];
                header[6..8].copy_from_slice(&profile.to_be_bytes());
                good(clip(header, transfer_length), Duration::ZERO)
            }
            opcode::READ_TOC_PMA_ATIP => match optical.and_then(|(_, toc, _)| toc) {
                Some(toc) => good(clip(toc.to_response(), transfer_length), Duration::ZERO),
                None => check_condition(SenseTriple::INVALID_FIELD_IN_CDB, Duration::ZERO),
            },
            opcode::READ_CD if cdb.len() >= 12 && optical.as_ref().is_some_and(|o| o.2) => {
                let lba = be_uint(&cdb[2..6]);
                let blocks = be_uint(&cdb[6..9]) as u32;
                if blocks == 0 {
                    good(Vec::new(), Duration::ZERO)
                } else {
                    self.read(lba, blocks, RAW_CD_SECTOR_SIZE as usize)?
                }
            }
            _ => check_condition(SenseTriple::INVALID_OPCODE, Duration::ZERO),
        };
        if let Some(&len) = self.short_responses.get(&op) {
            result.data.truncate(len);
        }
        Ok(result)
    }

    fn handle_ata(&mut self, registers: AtaRegisters) -> Result<RawResult, TransportError> {
        let EmulatedClass::Ata(features) = self.class else {
            return Ok(check_condition(SenseTriple::INVALID_OPCODE, Duration::ZERO));
        };

        let command = registers.command();
        let (lba, count) = ata_address(&registers, &features);
        let extended = registers.is_extended();

        let unsupported = match command {
            ata::command::READ_SECTORS_EXT | ata::command::READ_DMA_EXT if !features.lba48 => true,
            ata::command::READ_DMA | ata::command::READ_DMA_EXT if !features.dma => true,
            _ => extended && !features.lba48,
        };
        if unsupported {
            return Ok(ata_completion(&registers, ata::error::ABRT, Vec::new(), Duration::ZERO));
        }

        match command {
            ata::command::IDENTIFY_DEVICE => {
                let data = identify_data(&features, self.total_blocks, self.block_size);
                Ok(ata_completion(&registers, 0, data, Duration::ZERO))
            }
            ata::command::SEEK => {
                let seek = self.seek(lba);
                let error = if seek.status == status::GOOD { 0 } else { ata::error::IDNF };
                Ok(ata_completion(&registers, error, Vec::new(), seek.elapsed))
            }
            ata::command::READ_SECTORS
            | ata::command::READ_SECTORS_EXT
            | ata::command::READ_DMA
            | ata::command::READ_DMA_EXT => {
                let raw = self.read(lba, count, self.block_size as usize)?;
                let past_end = lba.saturating_add(u64::from(count)) > self.total_blocks;
                let error = match raw.status {
                    status::GOOD => 0,
                    _ if past_end => ata::error::IDNF,
                    _ => ata::error::UNC,
                };
                Ok(ata_completion(&registers, error, raw.data, raw.elapsed))
            }
            _ => Ok(ata_completion(&registers, ata::error::ABRT, Vec::new(), Duration::ZERO)),
        }
    }
}

impl DeviceTransport for EmulatedDevice {
    fn submit(&mut self, command: &EncodedCommand<'_>) -> Result<RawResult, TransportError> {
        if self
            .disconnect_after
            .is_some_and(|limit| self.history.len() >= limit)
        {
            return Err(TransportError::InvalidHandle);
        }

        let registers = command.ata.map(|tf| tf.registers());
        let issued = match registers {
            Some(regs) => {
                let features = match self.class {
                    EmulatedClass::Ata(f) => f,
                    _ => AtaFeatures::default(),
                };
                let (lba, blocks) = ata_address(&regs, &features);
                Issued {
                    opcode: command.opcode(),
                    ata_command: Some(regs.command()),
                    lba: Some(lba),
                    blocks,
                    extended: regs.is_extended(),
                }
            }
            None => scsi_issued(&command.cdb),
        };
        trace!(?issued, "emulated device received command");
        self.history.push(issued);

        let mut result = match registers {
            Some(regs) => self.handle_ata(regs)?,
            None => self.handle_scsi(&command.cdb, command.transfer_length)?,
        };
        if command.direction == DataDirection::In {
            result.data.truncate(command.transfer_length);
        } else {
            result.data.clear();
        }
        Ok(result)
    }

    fn max_cdb_length(&self) -> usize {
        self.max_cdb_length
    }

    fn supports_extended_addressing(&self) -> bool {
        self.extended_addressing
    }
}

fn good(data: Vec<u8>, elapsed: Duration) -> RawResult {
    RawResult {
        status: status::GOOD,
        sense: Vec::new(),
        data,
        elapsed,
        ata_registers: None,
    }
}

fn check_condition(sense: SenseTriple, elapsed: Duration) -> RawResult {
    RawResult {
        status: status::CHECK_CONDITION,
        sense: sense.to_fixed_sense(),
        data: Vec::new(),
        elapsed,
        ata_registers: None,
    }
}

fn clip(mut data: Vec<u8>, len: usize) -> Vec<u8> {
    data.truncate(len);
    data
}

fn padded(field: &mut [u8], text: &str) {
    field.fill(b' ');
    let n = text.len().min(field.len());
    field[..n].copy_from_slice(&text.as_bytes()[..n]);
}

fn scsi_issued(cdb: &[u8]) -> Issued {
    let op = cdb[0];
    let (lba, blocks) = match (op, cdb.len()) {
        (opcode::READ_6, 6..) => (
            Some(be_uint(&cdb[1..4]) & 0x1F_FFFF),
            if cdb[4] == 0 { 256 } else { u32::from(cdb[4]) },
        ),
        (opcode::READ_10, 10..) => (Some(be_uint(&cdb[2..6])), be_uint(&cdb[7..9]) as u32),
        (opcode::READ_12, 12..) | (opcode::READ_CD, 12..) => {
            let blocks = if op == opcode::READ_CD {
                be_uint(&cdb[6..9])
            } else {
                be_uint(&cdb[6..10])
            };
            (Some(be_uint(&cdb[2..6])), blocks as u32)
        }
        (opcode::READ_16, 16..) => (Some(be_uint(&cdb[2..10])), be_uint(&cdb[10..14]) as u32),
        (opcode::SEEK_10, 10..) => (Some(be_uint(&cdb[2..6])), 0),
        _ => (None, 0),
    };
    Issued {
        opcode: op,
        ata_command: None,
        lba,
        blocks,
        extended: false,
    }
}

/// Address and sector count an ATA register set refers to.
fn ata_address(registers: &AtaRegisters, features: &AtaFeatures) -> (u64, u32) {
    match registers {
        AtaRegisters::Chs(r) => {
            let heads = u64::from(features.heads.max(1));
            let spt = u64::from(features.sectors_per_track.max(1));
            let lba = (u64::from(r.cylinder) * heads + u64::from(r.head)) * spt
                + u64::from(r.sector).saturating_sub(1);
            (lba, if r.sector_count == 0 { 256 } else { u32::from(r.sector_count) })
        }
        AtaRegisters::Lba28(r) => (
            r.lba(),
            if r.sector_count == 0 { 256 } else { u32::from(r.sector_count) },
        ),
        AtaRegisters::Lba48(r) => (
            r.lba(),
            if r.sector_count == 0 { 65536 } else { u32::from(r.sector_count) },
        ),
    }
}

/// CHECK CONDITION carrying ATA PASS-THROUGH INFORMATION AVAILABLE and an
/// ATA Return Descriptor, as a SAT layer answers with CK_COND set.
fn ata_completion(
    registers: &AtaRegisters,
    error: u8,
    data: Vec<u8>,
    elapsed: Duration,
) -> RawResult {
    let tf = registers.task_file();
    let status_reg = if error == 0 {
        ata::status::DRDY
    } else {
        ata::status::DRDY | ata::status::ERR
    };
    let c = &tf.current;
    let p = &tf.previous;
    let desc = [
        ATA_RETURN_DESCRIPTOR,
        0x0C,
        u8::from(tf.extended),
        error,
        p[1],
        c[1],
        p[2],
        c[2],
        p[3],
        c[3],
        p[4],
        c[4],
        c[5],
        status_reg,
    ];
    debug_assert!(
        AtaErrorRegisters::from_return_descriptor(&desc, registers.mode()).is_ok(),
        "return descriptor must decode"
    );
    RawResult {
        status: status::CHECK_CONDITION,
        sense: SenseTriple::ATA_PASS_THROUGH_INFORMATION.to_descriptor_sense(&desc),
        data,
        elapsed,
        ata_registers: None,
    }
}

fn identify_data(features: &AtaFeatures, total_blocks: u64, block_size: u32) -> Vec<u8> {
    let mut words = [0u16; 256];
    words[1] = features.cylinders;
    words[3] = u16::from(features.heads);
    words[6] = u16::from(features.sectors_per_track);
    put_ata_string(&mut words[10..20], "EMU0000001");
    put_ata_string(&mut words[23..27], "1.0");
    put_ata_string(&mut words[27..47], "MEDIASCAN EMULATED ATA");
    if features.dma {
        words[49] |= 1 << 8;
    }
    if features.lba {
        words[49] |= 1 << 9;
        let lba28 = total_blocks.min(ata::MAX_LBA28) as u32;
        words[60] = lba28 as u16;
        words[61] = (lba28 >> 16) as u16;
    }
    if features.lba48 {
        words[83] |= 1 << 10;
        for (i, w) in words[100..104].iter_mut().enumerate() {
            *w = (total_blocks >> (16 * i)) as u16;
        }
    }
    if block_size != 512 {
        let words_per_sector = block_size / 2;
        words[106] = 0x4000 | (1 << 12);
        words[117] = words_per_sector as u16;
        words[118] = (words_per_sector >> 16) as u16;
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// ATA strings store two characters per word, first character in the high
/// byte.
fn put_ata_string(words: &mut [u16], text: &str) {
    let mut bytes = text.bytes().chain(std::iter::repeat(b' '));
    for w in words {
        let hi = bytes.next().unwrap_or(b' ');
        let lo = bytes.next().unwrap_or(b' ');
        *w = u16::from_be_bytes([hi, lo]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Cdb, CommandDescriptor};

    #[test]
    fn test_synthetic_blocks_carry_their_lba() {
        let mut dev = EmulatedDevice::disk(100, 512);
        let cmd = CommandDescriptor::scsi_in(Cdb::read_10(42, 2).unwrap(), 1024);
        let raw = dev.execute(&cmd).unwrap();
        assert_eq!(raw.status, status::GOOD);
        assert_eq!(raw.data.len(), 1024);
        assert_eq!(&raw.data[..8], &42u64.to_le_bytes());
        assert_eq!(&raw.data[512..520], &43u64.to_le_bytes());
        assert_eq!(dev.count(opcode::READ_10), 1);
    }

    #[test]
    fn test_read_past_end_is_lba_out_of_range() {
        let mut dev = EmulatedDevice::disk(10, 512);
        let cmd = CommandDescriptor::scsi_in(Cdb::read_10(9, 2).unwrap(), 1024);
        let scsi = dev.execute(&cmd).unwrap().into_scsi();
        assert_eq!(scsi.triple(), Some(SenseTriple::LBA_OUT_OF_RANGE));
    }

    #[test]
    fn test_transfer_limit_is_transport_error() {
        let mut dev = EmulatedDevice::disk(100, 512).with_max_transfer_blocks(8);
        let cmd = CommandDescriptor::scsi_in(Cdb::read_10(0, 16).unwrap(), 16 * 512);
        assert!(matches!(
            dev.execute(&cmd),
            Err(TransportError::Rejected { code: 22 })
        ));
    }

    #[test]
    fn test_identify_strings_are_word_swapped() {
        let data = identify_data(&AtaFeatures::default(), 1000, 512);
        assert_eq!(&data[54..58], b"EMID");
    }

    #[test]
    fn test_disconnect() {
        let mut dev = EmulatedDevice::disk(10, 512).disconnect_after(1);
        let tur = CommandDescriptor::scsi(Cdb::test_unit_ready());
        assert!(dev.execute(&tur).is_ok());
        let err = dev.execute(&tur).unwrap_err();
        assert!(err.is_session_fatal());
    }
}
