//! Linux SCSI generic (`SG_IO`) backend.
//!
//! Works on `/dev/sg*` and on block nodes (`/dev/sd*`, `/dev/sr*`) whose
//! driver accepts `SG_IO`. ATA devices are reached through the kernel's
//! SAT layer (libata) with ATA PASS-THROUGH (16).

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Instant;

use tracing::debug;

use crate::codec::{DataDirection, EncodedCommand};
use crate::core::TransportError;
use crate::transport::{DeviceTransport, RawResult, ScratchBuffer};

const SG_IO: libc::c_ulong = 0x2285;
const SG_INTERFACE_ID: libc::c_int = b'S' as libc::c_int;

const SG_DXFER_NONE: libc::c_int = -1;
const SG_DXFER_TO_DEV: libc::c_int = -2;
const SG_DXFER_FROM_DEV: libc::c_int = -3;

/// Driver status bit meaning "sense buffer valid"; not an error.
const DRIVER_SENSE: u16 = 0x08;

/// The kernel accepts CDBs up to 255 bytes through `cmdp`.
pub const SG_MAX_CDB: usize = 255;
const SENSE_BUFFER_LEN: usize = 64;

/// `struct sg_io_hdr` from `<scsi/sg.h>`.
#[repr(C)]
#[derive(Debug)]
struct SgIoHdr {
    interface_id: libc::c_int,
    dxfer_direction: libc::c_int,
    cmd_len: libc::c_uchar,
    mx_sb_len: libc::c_uchar,
    iovec_count: libc::c_ushort,
    dxfer_len: libc::c_uint,
    dxferp: *mut libc::c_void,
    cmdp: *mut libc::c_uchar,
    sbp: *mut libc::c_uchar,
    timeout: libc::c_uint,
    flags: libc::c_uint,
    pack_id: libc::c_int,
    usr_ptr: *mut libc::c_void,
    status: libc::c_uchar,
    masked_status: libc::c_uchar,
    msg_status: libc::c_uchar,
    sb_len_wr: libc::c_uchar,
    host_status: libc::c_ushort,
    driver_status: libc::c_ushort,
    resid: libc::c_int,
    duration: libc::c_uint,
    info: libc::c_uint,
}

pub struct SgIoTransport<F: AsFd> {
    fd: F,
}

impl SgIoTransport<File> {
    /// Opens a device node read-write, non-blocking so that drives without
    /// a medium can still be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path.as_ref())?;
        Ok(Self::new(file))
    }
}

impl<F: AsFd> SgIoTransport<F> {
    /// Wraps an already-open device handle. The transport never closes a
    /// handle it was given; dropping `fd` is the owner's business.
    pub fn new(fd: F) -> Self {
        Self { fd }
    }

    pub fn into_inner(self) -> F {
        self.fd
    }
}

impl<F: AsFd> DeviceTransport for SgIoTransport<F> {
    fn submit(&mut self, command: &EncodedCommand<'_>) -> Result<RawResult, TransportError> {
        let dxfer_len = libc::c_uint::try_from(command.transfer_length)
            .map_err(|_| TransportError::Rejected { code: libc::EINVAL })?;

        let mut data = match command.direction {
            DataDirection::Out => ScratchBuffer::from_payload(command.payload)?,
            _ => ScratchBuffer::with_default_alignment(command.transfer_length)?,
        };
        let mut sense = [0u8; SENSE_BUFFER_LEN];
        let mut cdb = command.cdb.to_vec();

        let mut hdr = SgIoHdr {
            interface_id: SG_INTERFACE_ID,
            dxfer_direction: match command.direction {
                DataDirection::None => SG_DXFER_NONE,
                DataDirection::In => SG_DXFER_FROM_DEV,
                DataDirection::Out => SG_DXFER_TO_DEV,
            },
            cmd_len: cdb.len() as libc::c_uchar,
            mx_sb_len: SENSE_BUFFER_LEN as libc::c_uchar,
            iovec_count: 0,
            dxfer_len,
            dxferp: data.as_mut_ptr().cast(),
            cmdp: cdb.as_mut_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: command.timeout.as_millis().min(u128::from(u32::MAX)) as libc::c_uint,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };

        let fd = self.fd.as_fd().as_raw_fd();
        let start = Instant::now();
        // SAFETY: every pointer in hdr refers to a live buffer of the length
        // stated next to it, all of which outlive the call.
        let rc = unsafe { libc::ioctl(fd, SG_IO as _, &mut hdr as *mut SgIoHdr) };
        let elapsed = start.elapsed();

        if rc < 0 {
            return Err(TransportError::last_os_error());
        }
        if hdr.host_status != 0 || hdr.driver_status & !DRIVER_SENSE != 0 {
            debug!(
                host = hdr.host_status,
                driver = hdr.driver_status,
                "SG_IO adapter failure"
            );
            return Err(TransportError::Adapter {
                host: hdr.host_status,
                driver: hdr.driver_status,
            });
        }

        let transferred = match command.direction {
            DataDirection::In => command.transfer_length.saturating_sub(hdr.resid.max(0) as usize),
            _ => 0,
        };
        let sense_len = usize::from(hdr.sb_len_wr).min(SENSE_BUFFER_LEN);

        Ok(RawResult {
            status: hdr.status,
            sense: sense[..sense_len].to_vec(),
            data: data.to_vec(transferred),
            elapsed,
            ata_registers: None,
        })
    }

    fn max_cdb_length(&self) -> usize {
        SG_MAX_CDB
    }

    fn supports_extended_addressing(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_sg_io_hdr_layout() {
        assert_eq!(std::mem::size_of::<SgIoHdr>(), 88);
        assert_eq!(std::mem::offset_of!(SgIoHdr, dxferp), 16);
        assert_eq!(std::mem::offset_of!(SgIoHdr, status), 64);
        assert_eq!(std::mem::offset_of!(SgIoHdr, resid), 72);
    }

    #[test]
    fn test_regular_file_is_rejected_by_os() {
        let file = tempfile::tempfile().unwrap();
        let mut transport = SgIoTransport::new(file);
        let cmd = crate::codec::CommandDescriptor::scsi(crate::codec::Cdb::test_unit_ready());
        let err = transport.execute(&cmd).unwrap_err();
        assert!(matches!(err, TransportError::Rejected { .. }));
    }
}
