//! Command encoding and result decoding.
//!
//! Nothing in this module performs I/O. A [`CommandDescriptor`] is built
//! fresh for each command and turned into an [`EncodedCommand`] against the
//! limits of a particular transport; results come back through
//! [`ScsiResult`] and [`AtaErrorRegisters`].

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::core::EncodingError;

pub mod ata;
pub mod cdb;
pub mod mmc;
pub mod sense;

pub use ata::{
    AddressingMode, AtaCommand, AtaErrorRegisters, AtaProtocol, AtaRegisters, AtaTaskFile,
};
pub use cdb::Cdb;
pub use sense::{ScsiResult, SenseData, SenseTriple};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Largest CDB that fits inline in the common pass-through structures.
pub const MAX_INLINE_CDB: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DataDirection {
    None,
    In,
    Out,
}

impl fmt::Display for DataDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::In => "in",
            Self::Out => "out",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    Scsi(Cdb),
    Ata(AtaCommand),
}

/// A single device command, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    body: CommandBody,
    direction: DataDirection,
    transfer_length: usize,
    payload: Vec<u8>,
    timeout: Duration,
}

impl CommandDescriptor {
    /// SCSI command with no data phase.
    pub fn scsi(cdb: Cdb) -> Self {
        Self {
            body: CommandBody::Scsi(cdb),
            direction: DataDirection::None,
            transfer_length: 0,
            payload: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// SCSI command reading `transfer_length` bytes from the device.
    pub fn scsi_in(cdb: Cdb, transfer_length: usize) -> Self {
        Self {
            direction: DataDirection::In,
            transfer_length,
            ..Self::scsi(cdb)
        }
    }

    /// SCSI command writing `payload` to the device.
    pub fn scsi_out(cdb: Cdb, payload: Vec<u8>) -> Self {
        Self {
            direction: DataDirection::Out,
            transfer_length: payload.len(),
            payload,
            ..Self::scsi(cdb)
        }
    }

    pub fn ata(command: AtaCommand) -> Self {
        Self {
            direction: command.protocol.direction(),
            transfer_length: command.transfer_length,
            body: CommandBody::Ata(command),
            payload: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[inline]
    pub fn body(&self) -> &CommandBody {
        &self.body
    }

    #[inline]
    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    #[inline]
    pub fn transfer_length(&self) -> usize {
        self.transfer_length
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_ata(&self) -> bool {
        matches!(self.body, CommandBody::Ata(_))
    }

    /// Addressing mode of an ATA command.
    pub fn ata_mode(&self) -> Option<AddressingMode> {
        match &self.body {
            CommandBody::Ata(cmd) => Some(cmd.registers.mode()),
            CommandBody::Scsi(_) => None,
        }
    }

    /// Whether this command uses 48-bit ATA addressing.
    pub fn requires_extended_addressing(&self) -> bool {
        matches!(&self.body, CommandBody::Ata(cmd) if cmd.registers.is_extended())
    }

    /// Validates the command against a transport that accepts CDBs of up
    /// to `max_cdb_length` bytes and produces its wire form.
    pub fn encode(&self, max_cdb_length: usize) -> Result<EncodedCommand<'_>, EncodingError> {
        let (cdb, ata) = match &self.body {
            CommandBody::Scsi(cdb) => (Cow::Borrowed(cdb.as_slice()), None),
            CommandBody::Ata(cmd) => (
                Cow::Owned(cmd.sat_cdb().to_vec()),
                Some(cmd.registers.task_file()),
            ),
        };

        if cdb.is_empty() {
            return Err(EncodingError::EmptyCdb);
        }
        if cdb.len() > max_cdb_length {
            return Err(EncodingError::CdbTooLong {
                len: cdb.len(),
                max: max_cdb_length,
            });
        }
        if self.direction != DataDirection::None && self.transfer_length == 0 {
            return Err(EncodingError::EmptyTransfer {
                direction: self.direction,
            });
        }

        Ok(EncodedCommand {
            cdb,
            ata,
            direction: self.direction,
            transfer_length: self.transfer_length,
            payload: &self.payload,
            timeout: self.timeout,
        })
    }
}

/// A validated command ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand<'a> {
    /// Never empty and never longer than the limit it was encoded against.
    pub cdb: Cow<'a, [u8]>,
    /// Task-file form of an ATA command, for interfaces that take
    /// registers instead of a SAT CDB.
    pub ata: Option<AtaTaskFile>,
    pub direction: DataDirection,
    pub transfer_length: usize,
    pub payload: &'a [u8],
    pub timeout: Duration,
}

impl EncodedCommand<'_> {
    #[inline]
    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdb_longer_than_transport_maximum_is_refused() {
        let desc = CommandDescriptor::scsi(Cdb::from_bytes(vec![0xC0; 20]));
        assert_eq!(
            desc.encode(MAX_INLINE_CDB).unwrap_err(),
            EncodingError::CdbTooLong { len: 20, max: 16 }
        );
        assert_eq!(desc.encode(255).unwrap().cdb.len(), 20);
    }

    #[test]
    fn test_empty_cdb_is_refused() {
        let desc = CommandDescriptor::scsi(Cdb::from_bytes(Vec::new()));
        assert_eq!(desc.encode(16).unwrap_err(), EncodingError::EmptyCdb);
    }

    #[test]
    fn test_zero_length_transfer_is_refused() {
        let desc = CommandDescriptor::scsi_in(Cdb::inquiry(0), 0);
        assert_eq!(
            desc.encode(16).unwrap_err(),
            EncodingError::EmptyTransfer {
                direction: DataDirection::In
            }
        );
    }

    #[test]
    fn test_ata_encodes_both_forms() {
        let desc = CommandDescriptor::ata(AtaCommand::identify_device());
        let enc = desc.encode(16).unwrap();
        assert_eq!(enc.opcode(), cdb::opcode::ATA_PASS_THROUGH_16);
        assert_eq!(enc.direction, DataDirection::In);
        assert_eq!(enc.transfer_length, 512);
        let tf = enc.ata.unwrap();
        assert_eq!(tf.current[ata::task_file::COMMAND], ata::command::IDENTIFY_DEVICE);
        assert!(!desc.requires_extended_addressing());
    }
}
