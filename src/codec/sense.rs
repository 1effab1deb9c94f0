//! SCSI sense data and command results.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::codec::cdb::be_uint;
use crate::core::DecodeError;

/// SCSI status byte values (SAM-5 5.3).
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// Sense keys (SPC-4 4.5.6).
pub mod key {
    pub const NO_SENSE: u8 = 0x0;
    pub const RECOVERED_ERROR: u8 = 0x1;
    pub const NOT_READY: u8 = 0x2;
    pub const MEDIUM_ERROR: u8 = 0x3;
    pub const HARDWARE_ERROR: u8 = 0x4;
    pub const ILLEGAL_REQUEST: u8 = 0x5;
    pub const UNIT_ATTENTION: u8 = 0x6;
    pub const DATA_PROTECT: u8 = 0x7;
    pub const ABORTED_COMMAND: u8 = 0xB;
}

const FIXED_CURRENT: u8 = 0x70;
const FIXED_DEFERRED: u8 = 0x71;
const DESCRIPTOR_CURRENT: u8 = 0x72;
const DESCRIPTOR_DEFERRED: u8 = 0x73;

const FIXED_MIN_LEN: usize = 14;
const DESCRIPTOR_MIN_LEN: usize = 8;
const INFORMATION_DESCRIPTOR: u8 = 0x00;

/// A (sense key, ASC, ASCQ) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SenseTriple(pub u8, pub u8, pub u8);

impl SenseTriple {
    pub const NO_SENSE: Self = Self(key::NO_SENSE, 0x00, 0x00);
    pub const ATA_PASS_THROUGH_INFORMATION: Self = Self(key::RECOVERED_ERROR, 0x00, 0x1D);
    pub const BECOMING_READY: Self = Self(key::NOT_READY, 0x04, 0x01);
    pub const MEDIUM_NOT_PRESENT: Self = Self(key::NOT_READY, 0x3A, 0x00);
    pub const UNRECOVERED_READ_ERROR: Self = Self(key::MEDIUM_ERROR, 0x11, 0x00);
    pub const INVALID_OPCODE: Self = Self(key::ILLEGAL_REQUEST, 0x20, 0x00);
    pub const INVALID_FIELD_IN_CDB: Self = Self(key::ILLEGAL_REQUEST, 0x24, 0x00);
    pub const LBA_OUT_OF_RANGE: Self = Self(key::ILLEGAL_REQUEST, 0x21, 0x00);
    pub const ILLEGAL_MODE_FOR_TRACK: Self = Self(key::ILLEGAL_REQUEST, 0x64, 0x00);
    pub const MEDIUM_CHANGED: Self = Self(key::UNIT_ATTENTION, 0x28, 0x00);
    pub const ABORTED_COMMAND: Self = Self(key::ABORTED_COMMAND, 0x00, 0x00);

    #[inline]
    pub fn key(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn asc(&self) -> u8 {
        self.1
    }

    #[inline]
    pub fn ascq(&self) -> u8 {
        self.2
    }

    /// Current-error fixed-format sense, 18 bytes.
    pub fn to_fixed_sense(self) -> Vec<u8> {
        let mut buf = vec![0u8; 18];
        buf[0] = FIXED_CURRENT;
        buf[2] = self.0 & 0x0F;
        buf[7] = 10;
        buf[12] = self.1;
        buf[13] = self.2;
        buf
    }

    /// Current-error descriptor-format sense with the given descriptors
    /// appended.
    pub fn to_descriptor_sense(self, descriptors: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DESCRIPTOR_MIN_LEN + descriptors.len());
        buf.extend_from_slice(&[DESCRIPTOR_CURRENT, self.0 & 0x0F, self.1, self.2, 0, 0, 0]);
        buf.push(descriptors.len().min(usize::from(u8::MAX)) as u8);
        buf.extend_from_slice(descriptors);
        buf
    }
}

impl fmt::Display for SenseTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sense key {:#x}, ASC {:#04x}, ASCQ {:#04x}",
            self.0, self.1, self.2
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SenseFormat {
    Fixed,
    Descriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenseData {
    pub response_code: u8,
    pub format: SenseFormat,
    pub deferred: bool,
    pub triple: SenseTriple,
    pub information: Option<u64>,
    /// The full sense buffer as returned, needed for format-specific
    /// lookups such as ATA status.
    #[serde(skip)]
    raw: Vec<u8>,
}

impl SenseData {
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let Some(&first) = raw.first() else {
            return Err(DecodeError::Truncated {
                what: "sense data",
                needed: 1,
                actual: 0,
            });
        };
        let response_code = first & 0x7F;
        match response_code {
            FIXED_CURRENT | FIXED_DEFERRED => Self::decode_fixed(raw, response_code),
            DESCRIPTOR_CURRENT | DESCRIPTOR_DEFERRED => Self::decode_descriptor(raw, response_code),
            other => Err(DecodeError::Malformed {
                what: "sense data",
                reason: format!("response code {other:#04x}"),
            }),
        }
    }

    fn decode_fixed(raw: &[u8], response_code: u8) -> Result<Self, DecodeError> {
        if raw.len() < FIXED_MIN_LEN {
            return Err(DecodeError::Truncated {
                what: "fixed-format sense",
                needed: FIXED_MIN_LEN,
                actual: raw.len(),
            });
        }
        let valid = raw[0] & 0x80 != 0;
        Ok(Self {
            response_code,
            format: SenseFormat::Fixed,
            deferred: response_code == FIXED_DEFERRED,
            triple: SenseTriple(raw[2] & 0x0F, raw[12], raw[13]),
            information: valid.then(|| be_uint(&raw[3..7])),
            raw: raw.to_vec(),
        })
    }

    fn decode_descriptor(raw: &[u8], response_code: u8) -> Result<Self, DecodeError> {
        if raw.len() < DESCRIPTOR_MIN_LEN {
            return Err(DecodeError::Truncated {
                what: "descriptor-format sense",
                needed: DESCRIPTOR_MIN_LEN,
                actual: raw.len(),
            });
        }
        let mut sense = Self {
            response_code,
            format: SenseFormat::Descriptor,
            deferred: response_code == DESCRIPTOR_DEFERRED,
            triple: SenseTriple(raw[1] & 0x0F, raw[2], raw[3]),
            information: None,
            raw: raw.to_vec(),
        };
        // Information descriptor: code, length 0x0A, VALID, reserved, 8-byte field.
        sense.information = sense
            .descriptor(INFORMATION_DESCRIPTOR)
            .filter(|d| d.len() >= 12 && d[2] & 0x80 != 0)
            .map(|d| be_uint(&d[4..12]));
        Ok(sense)
    }

    #[inline]
    pub fn key(&self) -> u8 {
        self.triple.0
    }

    #[inline]
    pub fn asc(&self) -> u8 {
        self.triple.1
    }

    #[inline]
    pub fn ascq(&self) -> u8 {
        self.triple.2
    }

    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn descriptors(&self) -> Descriptors<'_> {
        let body = match self.format {
            SenseFormat::Descriptor => {
                let declared = usize::from(self.raw[7]);
                let end = (DESCRIPTOR_MIN_LEN + declared).min(self.raw.len());
                &self.raw[DESCRIPTOR_MIN_LEN..end]
            }
            SenseFormat::Fixed => &[],
        };
        Descriptors { rest: body }
    }

    /// First sense descriptor of type `code`, starting at the code byte.
    pub fn descriptor(&self, code: u8) -> Option<&[u8]> {
        self.descriptors().find(|d| d[0] == code)
    }
}

/// Iterator over the sense descriptors of descriptor-format sense. A
/// descriptor whose declared length runs past the buffer ends iteration.
pub struct Descriptors<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < 2 {
            return None;
        }
        let len = 2 + usize::from(self.rest[1]);
        if len > self.rest.len() {
            self.rest = &[];
            return None;
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Some(head)
    }
}

/// Outcome of a SCSI command that made it through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiResult {
    pub status: u8,
    pub sense_present: bool,
    pub sense: Option<SenseData>,
    /// Set when sense was signaled but could not be decoded.
    pub sense_error: Option<DecodeError>,
    pub data: Vec<u8>,
    pub elapsed: Duration,
}

impl ScsiResult {
    /// Builds the result from the status byte and whatever sense bytes the
    /// transport wrote back. Sense is considered present on CHECK CONDITION
    /// or whenever sense bytes were returned.
    pub fn decode(status: u8, sense: &[u8], data: Vec<u8>, elapsed: Duration) -> Self {
        let sense_present = status == status::CHECK_CONDITION || !sense.is_empty();
        let (sense, sense_error) = if sense_present {
            match SenseData::decode(sense) {
                Ok(s) => (Some(s), None),
                Err(e) => (None, Some(e)),
            }
        } else {
            (None, None)
        };
        Self {
            status,
            sense_present,
            sense,
            sense_error,
            data,
            elapsed,
        }
    }

    #[inline]
    pub fn is_good(&self) -> bool {
        self.status == status::GOOD && !self.sense_present
    }

    pub fn triple(&self) -> Option<SenseTriple> {
        self.sense.as_ref().map(|s| s.triple)
    }
}
