//! Turns command results into retry decisions.

use std::fmt;

use serde::Serialize;

use crate::codec::sense::status;
use crate::codec::{ScsiResult, SenseTriple};
use crate::transport::AtaResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RetryReason {
    /// ASC 0x3A
    MediumNotPresent,
    /// ASC 0x04 / ASCQ 0x01
    BecomingReady,
    /// ASC 0x28
    MediumChanged,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MediumNotPresent => "medium not present",
            Self::BecomingReady => "logical unit becoming ready",
            Self::MediumChanged => "medium may have changed",
        })
    }
}

/// Sense combinations that are skipped rather than counted. Both show up
/// on optical media at track-type transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IgnoreReason {
    /// ASC 0x21 / ASCQ 0x00
    LbaOutOfRange,
    /// ASC 0x64 / ASCQ 0x00
    IllegalModeForTrack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FatalReason {
    Sense(SenseTriple),
    Ata { status: u8, error: u8 },
    /// Sense was signaled but could not be decoded.
    UnparseableSense(String),
    /// Non-GOOD status without sense.
    Status(u8),
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sense(triple) => write!(f, "{triple}"),
            Self::Ata { status, error } => {
                write!(f, "ATA status {status:#04x}, error {error:#04x}")
            }
            Self::UnparseableSense(detail) => write!(f, "unparseable sense: {detail}"),
            Self::Status(s) => write!(f, "SCSI status {s:#04x}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Classification {
    Ok,
    Ignorable(IgnoreReason),
    Retryable(RetryReason),
    /// Failed for this command; the scan goes on.
    Fatal(FatalReason),
}

impl Classification {
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn sense(&self) -> Option<SenseTriple> {
        match self {
            Self::Fatal(FatalReason::Sense(t)) => Some(*t),
            _ => None,
        }
    }
}

pub fn classify_triple(triple: SenseTriple) -> Classification {
    match (triple.asc(), triple.ascq()) {
        (0x00, 0x00) if triple.key() == 0 => Classification::Ok,
        (0x3A, _) => Classification::Retryable(RetryReason::MediumNotPresent),
        (0x04, 0x01) => Classification::Retryable(RetryReason::BecomingReady),
        (0x28, _) => Classification::Retryable(RetryReason::MediumChanged),
        (0x21, 0x00) => Classification::Ignorable(IgnoreReason::LbaOutOfRange),
        (0x64, 0x00) => Classification::Ignorable(IgnoreReason::IllegalModeForTrack),
        _ => Classification::Fatal(FatalReason::Sense(triple)),
    }
}

pub fn classify_scsi(result: &ScsiResult) -> Classification {
    if result.sense_present {
        return match (&result.sense, &result.sense_error) {
            (Some(sense), _) => classify_triple(sense.triple),
            (None, Some(err)) => {
                Classification::Fatal(FatalReason::UnparseableSense(err.to_string()))
            }
            (None, None) => {
                Classification::Fatal(FatalReason::UnparseableSense("no sense data".to_string()))
            }
        };
    }
    match result.status {
        status::GOOD | status::CONDITION_MET => Classification::Ok,
        other => Classification::Fatal(FatalReason::Status(other)),
    }
}

/// ATA commands fail on a non-zero error register or any
/// [`ERROR_MASK`](crate::codec::ata::status::ERROR_MASK) status bit. When
/// no ATA status came back the SCSI layer's own sense decides, so a
/// translation layer refusing the pass-through is reported as such.
pub fn classify_ata(result: &AtaResult) -> Classification {
    match &result.registers {
        Ok(regs) if regs.is_error() => Classification::Fatal(FatalReason::Ata {
            status: regs.status(),
            error: regs.error(),
        }),
        Ok(_) => Classification::Ok,
        Err(err) => match result.scsi.triple() {
            Some(triple) if triple != SenseTriple::ATA_PASS_THROUGH_INFORMATION => {
                match classify_scsi(&result.scsi) {
                    Classification::Ok => {
                        Classification::Fatal(FatalReason::UnparseableSense(err.to_string()))
                    }
                    other => other,
                }
            }
            _ => Classification::Fatal(FatalReason::UnparseableSense(err.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryable_sense() {
        assert_eq!(
            classify_triple(SenseTriple::MEDIUM_NOT_PRESENT),
            Classification::Retryable(RetryReason::MediumNotPresent)
        );
        assert_eq!(
            classify_triple(SenseTriple::BECOMING_READY),
            Classification::Retryable(RetryReason::BecomingReady)
        );
        assert_eq!(
            classify_triple(SenseTriple::MEDIUM_CHANGED),
            Classification::Retryable(RetryReason::MediumChanged)
        );
    }

    #[test]
    fn test_other_not_ready_is_fatal() {
        let manual_intervention = SenseTriple(0x2, 0x04, 0x03);
        assert_eq!(
            classify_triple(manual_intervention),
            Classification::Fatal(FatalReason::Sense(manual_intervention))
        );
    }

    #[test]
    fn test_good_status_is_ok() {
        let result = ScsiResult::decode(status::GOOD, &[], Vec::new(), Duration::ZERO);
        assert!(classify_scsi(&result).is_ok());
        let busy = ScsiResult::decode(status::BUSY, &[], Vec::new(), Duration::ZERO);
        assert_eq!(classify_scsi(&busy), Classification::Fatal(FatalReason::Status(status::BUSY)));
    }

    #[test]
    fn test_garbled_sense_is_unparseable() {
        let result = ScsiResult::decode(
            status::CHECK_CONDITION,
            &[0x70, 0, 3],
            Vec::new(),
            Duration::ZERO,
        );
        assert!(matches!(
            classify_scsi(&result),
            Classification::Fatal(FatalReason::UnparseableSense(_))
        ));
    }
}
