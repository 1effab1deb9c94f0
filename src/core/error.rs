use std::io;
use thiserror::Error;

use crate::classify::RetryReason;
use crate::codec::DataDirection;
use crate::scan::ScanState;

/// A command request that can never be put on the wire as given.
///
/// These are contract violations on the caller's side; a correctly
/// functioning scan never produces one at runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("CDB of {len} bytes exceeds the transport maximum of {max}")]
    CdbTooLong { len: usize, max: usize },

    #[error("CDB is empty")]
    EmptyCdb,

    #[error("data-{direction} transfer requested with a zero-length buffer")]
    EmptyTransfer { direction: DataDirection },

    #[error("{field} value {value:#x} exceeds the maximum of {max:#x}")]
    FieldOutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{what} truncated: needed {needed} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("malformed {what}: {reason}")]
    Malformed {
        what: &'static str,
        reason: String,
    },
}

/// Failure to get a command through the operating system's raw-device
/// interface. No result bytes exist when one of these is returned.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("device handle is not valid")]
    InvalidHandle,

    #[error("operating system rejected the command (error {code})")]
    Rejected { code: i32 },

    #[error("host adapter status {host:#06x}, driver status {driver:#06x}")]
    Adapter { host: u16, driver: u16 },

    #[error("declined by platform policy: {reason}")]
    DeclinedByPolicy { reason: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

// EBADF, ENXIO, ENODEV, ENOTTY and ERROR_INVALID_HANDLE / ERROR_DEV_NOT_EXIST.
#[cfg(not(windows))]
const SESSION_FATAL_CODES: &[i32] = &[9, 6, 19, 25];
#[cfg(windows)]
const SESSION_FATAL_CODES: &[i32] = &[6, 55];

impl TransportError {
    /// Builds a [`TransportError`] from the calling thread's last OS error.
    pub fn last_os_error() -> Self {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) => Self::Rejected { code },
            None => Self::Io(err),
        }
    }

    /// Whether the device connection itself is gone, as opposed to a single
    /// command having failed.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::InvalidHandle => true,
            Self::Rejected { code } => SESSION_FATAL_CODES.contains(code),
            Self::Io(err) => err
                .raw_os_error()
                .is_some_and(|code| SESSION_FATAL_CODES.contains(&code)),
            Self::Adapter { .. } | Self::DeclinedByPolicy { .. } | Self::Encoding(_) => false,
        }
    }

    /// Whether the command was refused before reaching the device, so
    /// retrying it in any form cannot help.
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::DeclinedByPolicy { .. } | Self::Encoding(_))
    }
}

/// Phase-level failure of a scan. No partial results accompany these.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("no medium present")]
    NoMedium,

    #[error("unit not ready after {attempts} attempts ({reason})")]
    NotReady { attempts: u32, reason: RetryReason },

    #[error("device reports zero blocks")]
    ZeroBlocks,

    #[error("unable to determine transfer size")]
    TransferSizeUnknown,

    #[error("{command} failed: {detail}")]
    CommandFailed {
        command: &'static str,
        detail: String,
    },

    #[error("declined by platform policy: {reason}")]
    Declined { reason: &'static str },

    #[error("transport failure during {phase}: {source}")]
    Transport {
        phase: ScanState,
        #[source]
        source: TransportError,
    },

    #[error("could not decode device response during {phase}: {source}")]
    Decode {
        phase: ScanState,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl ScanError {
    pub(crate) fn decoding(phase: ScanState) -> impl FnOnce(DecodeError) -> Self {
        move |source| Self::Decode { phase, source }
    }

    pub(crate) fn transport(phase: ScanState, source: TransportError) -> Self {
        match source {
            TransportError::DeclinedByPolicy { reason } => Self::Declined { reason },
            TransportError::Encoding(err) => Self::Encoding(err),
            source => Self::Transport { phase, source },
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_fatal_codes() {
        assert!(TransportError::InvalidHandle.is_session_fatal());
        #[cfg(not(windows))]
        assert!(TransportError::Rejected { code: 19 }.is_session_fatal());
        assert!(!TransportError::Rejected { code: 22 }.is_session_fatal());
        assert!(!TransportError::Adapter { host: 3, driver: 0 }.is_session_fatal());
    }

    #[test]
    fn test_policy_decline_maps_to_scan_decline() {
        let err = ScanError::transport(
            ScanState::SizeProbe,
            TransportError::DeclinedByPolicy { reason: "48-bit ATA" },
        );
        assert!(matches!(err, ScanError::Declined { reason: "48-bit ATA" }));
    }
}
