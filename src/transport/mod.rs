//! Raw-device command transport.
//!
//! A [`DeviceTransport`] takes an [`EncodedCommand`] to the operating
//! system and hands back a [`RawResult`]. One command is outstanding per
//! transport at a time; `submit` blocks until the device answers.

use std::time::Duration;

use tracing::trace;

use crate::codec::{
    AddressingMode, AtaErrorRegisters, AtaTaskFile, CommandDescriptor, EncodedCommand, ScsiResult,
};
use crate::codec::ata::ATA_RETURN_DESCRIPTOR;
use crate::codec::sense::{SenseFormat, SenseTriple};
use crate::core::{DecodeError, TransportError};

pub mod buffer;
pub mod emulated;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod policy;
#[cfg(windows)]
pub mod windows;

pub use buffer::ScratchBuffer;
pub use emulated::EmulatedDevice;

/// What came back from a command that reached the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResult {
    pub status: u8,
    /// Sense bytes actually written by the device.
    pub sense: Vec<u8>,
    /// Data-in bytes actually transferred.
    pub data: Vec<u8>,
    /// Wall-clock time around the native call.
    pub elapsed: Duration,
    /// Register echo from interfaces that return a task file.
    pub ata_registers: Option<AtaTaskFile>,
}

impl RawResult {
    pub fn into_scsi(self) -> ScsiResult {
        ScsiResult::decode(self.status, &self.sense, self.data, self.elapsed)
    }

    /// Decodes the result of an ATA command issued in `mode`.
    ///
    /// Registers are taken from the task-file echo when the transport
    /// supplied one, else from the ATA Return Descriptor in descriptor
    /// sense, else from fixed-format ATA status sense.
    pub fn into_ata(self, mode: AddressingMode) -> AtaResult {
        let echo = self.ata_registers;
        let scsi = self.into_scsi();
        let registers = match (echo, scsi.sense.as_ref()) {
            (Some(tf), _) => Ok(AtaErrorRegisters::from_task_file(&tf, mode)),
            (None, Some(sense)) => match sense.format {
                SenseFormat::Descriptor => match sense.descriptor(ATA_RETURN_DESCRIPTOR) {
                    Some(desc) => AtaErrorRegisters::from_return_descriptor(desc, mode),
                    None => Err(DecodeError::Malformed {
                        what: "ATA status",
                        reason: format!("no ATA return descriptor in sense ({})", sense.triple),
                    }),
                },
                SenseFormat::Fixed if sense.triple == SenseTriple::ATA_PASS_THROUGH_INFORMATION => {
                    AtaErrorRegisters::from_fixed_sense(sense.raw(), mode)
                }
                SenseFormat::Fixed => Err(DecodeError::Malformed {
                    what: "ATA status",
                    reason: format!("fixed-format sense without ATA status ({})", sense.triple),
                }),
            },
            (None, None) => match &scsi.sense_error {
                Some(err) => Err(err.clone()),
                None => Err(DecodeError::Truncated {
                    what: "ATA status",
                    needed: 1,
                    actual: 0,
                }),
            },
        };
        AtaResult { registers, scsi }
    }
}

/// Outcome of an ATA command that made it through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtaResult {
    pub registers: Result<AtaErrorRegisters, DecodeError>,
    /// The SCSI-level view: status, raw sense and data.
    pub scsi: ScsiResult,
}

/// Capability interface implemented once per platform.
pub trait DeviceTransport {
    /// Hands an already-encoded command to the device.
    ///
    /// Returns `Err` only when no result exists at all: the handle is
    /// invalid or the OS refused the submission. A command the device
    /// itself failed is `Ok` with CHECK CONDITION status and sense.
    fn submit(&mut self, command: &EncodedCommand<'_>) -> Result<RawResult, TransportError>;

    /// Largest CDB the interface can carry.
    fn max_cdb_length(&self) -> usize;

    /// Whether 48-bit ATA commands may be issued on this platform.
    fn supports_extended_addressing(&self) -> bool;

    /// Policy check, encode, submit.
    fn execute(&mut self, command: &CommandDescriptor) -> Result<RawResult, TransportError> {
        if command.requires_extended_addressing() && !self.supports_extended_addressing() {
            return Err(TransportError::DeclinedByPolicy {
                reason: "48-bit ATA addressing is unsafe on this platform",
            });
        }
        let encoded = command.encode(self.max_cdb_length())?;
        trace!(
            opcode = format_args!("{:#04x}", encoded.opcode()),
            direction = %encoded.direction,
            len = encoded.transfer_length,
            "submitting command"
        );
        self.submit(&encoded)
    }
}

impl<T: DeviceTransport + ?Sized> DeviceTransport for &mut T {
    fn submit(&mut self, command: &EncodedCommand<'_>) -> Result<RawResult, TransportError> {
        (**self).submit(command)
    }

    fn max_cdb_length(&self) -> usize {
        (**self).max_cdb_length()
    }

    fn supports_extended_addressing(&self) -> bool {
        (**self).supports_extended_addressing()
    }
}

impl<T: DeviceTransport + ?Sized> DeviceTransport for Box<T> {
    fn submit(&mut self, command: &EncodedCommand<'_>) -> Result<RawResult, TransportError> {
        (**self).submit(command)
    }

    fn max_cdb_length(&self) -> usize {
        (**self).max_cdb_length()
    }

    fn supports_extended_addressing(&self) -> bool {
        (**self).supports_extended_addressing()
    }
}
