//! Windows pass-through backend.
//!
//! SCSI commands go through `IOCTL_SCSI_PASS_THROUGH_DIRECT`; ATA commands
//! use `IOCTL_ATA_PASS_THROUGH_DIRECT`, which returns the task file as the
//! device left it.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::mem::{offset_of, size_of};
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::{AsHandle, AsRawHandle};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, warn};
use windows_sys::Win32::Storage::FileSystem::{FILE_SHARE_READ, FILE_SHARE_WRITE};
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::SystemInformation::{GetVersionExW, OSVERSIONINFOW};

use crate::codec::sense::status;
use crate::codec::{AtaTaskFile, DataDirection, EncodedCommand, MAX_INLINE_CDB};
use crate::core::TransportError;
use crate::transport::policy::{self, OsVersion};
use crate::transport::{DeviceTransport, RawResult, ScratchBuffer};

const IOCTL_SCSI_PASS_THROUGH_DIRECT: u32 = 0x0004_D014;
const IOCTL_ATA_PASS_THROUGH_DIRECT: u32 = 0x0004_D030;

const SCSI_IOCTL_DATA_OUT: u8 = 0;
const SCSI_IOCTL_DATA_IN: u8 = 1;
const SCSI_IOCTL_DATA_UNSPECIFIED: u8 = 2;

const ATA_FLAGS_DRDY_REQUIRED: u16 = 0x01;
const ATA_FLAGS_DATA_IN: u16 = 0x02;
const ATA_FLAGS_DATA_OUT: u16 = 0x04;
const ATA_FLAGS_48BIT_COMMAND: u16 = 0x08;
const ATA_FLAGS_USE_DMA: u16 = 0x10;

const SENSE_BUFFER_LEN: usize = 32;

#[repr(C)]
struct ScsiPassThroughDirect {
    length: u16,
    scsi_status: u8,
    path_id: u8,
    target_id: u8,
    lun: u8,
    cdb_length: u8,
    sense_info_length: u8,
    data_in: u8,
    data_transfer_length: u32,
    timeout_value: u32,
    data_buffer: *mut c_void,
    sense_info_offset: u32,
    cdb: [u8; 16],
}

/// SPTD followed by its sense buffer in one allocation, as the IOCTL
/// addresses sense by offset from the start of the input buffer.
#[repr(C)]
struct ScsiPassThroughDirectWithSense {
    sptd: ScsiPassThroughDirect,
    filler: u32,
    sense: [u8; SENSE_BUFFER_LEN],
}

#[repr(C)]
struct AtaPassThroughDirect {
    length: u16,
    ata_flags: u16,
    path_id: u8,
    target_id: u8,
    lun: u8,
    reserved_as_uchar: u8,
    data_transfer_length: u32,
    timeout_value: u32,
    reserved_as_ulong: u32,
    data_buffer: *mut c_void,
    previous_task_file: [u8; 8],
    current_task_file: [u8; 8],
}

/// Current OS version, or `None` if it cannot be queried.
pub fn os_version() -> Option<OsVersion> {
    // SAFETY: OSVERSIONINFOW is plain data; zeroed is a valid value.
    let mut info: OSVERSIONINFOW = unsafe { std::mem::zeroed() };
    info.dwOSVersionInfoSize = size_of::<OSVERSIONINFOW>() as u32;
    // SAFETY: info is a valid, correctly sized OSVERSIONINFOW.
    let ok = unsafe { GetVersionExW(&mut info) };
    (ok != 0).then(|| OsVersion::new(info.dwMajorVersion, info.dwMinorVersion, info.dwBuildNumber))
}

pub struct SptdTransport<H: AsHandle> {
    handle: H,
    extended_ata: bool,
}

impl SptdTransport<File> {
    /// Opens `\\.\PhysicalDriveN`, `\\.\CdRomN` or a drive-letter volume.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
            .open(path.as_ref())?;
        Ok(Self::new(file))
    }
}

impl<H: AsHandle> SptdTransport<H> {
    /// Wraps an open handle and applies the OS-version policy. An unknown
    /// version is treated as unsafe for 48-bit ATA.
    pub fn new(handle: H) -> Self {
        let extended_ata = match os_version() {
            Some(version) => {
                let permitted = policy::extended_ata_permitted(version);
                if !permitted {
                    warn!(%version, "48-bit ATA pass-through disabled on this Windows release");
                }
                permitted
            }
            None => false,
        };
        Self {
            handle,
            extended_ata,
        }
    }

    fn raw_handle(&self) -> *mut c_void {
        self.handle.as_handle().as_raw_handle()
    }

    fn ioctl<T>(&self, code: u32, request: &mut T) -> Result<(), TransportError> {
        let size = size_of::<T>() as u32;
        let mut returned = 0u32;
        let request: *mut T = request;
        // SAFETY: request points to a live, properly laid-out IOCTL struct
        // used as both input and output buffer.
        let ok = unsafe {
            DeviceIoControl(
                self.raw_handle(),
                code,
                request.cast(),
                size,
                request.cast(),
                size,
                &mut returned,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(TransportError::last_os_error());
        }
        Ok(())
    }

    fn submit_scsi(&mut self, command: &EncodedCommand<'_>) -> Result<RawResult, TransportError> {
        let mut data = match command.direction {
            DataDirection::Out => ScratchBuffer::from_payload(command.payload)?,
            _ => ScratchBuffer::with_default_alignment(command.transfer_length)?,
        };

        let mut cdb = [0u8; 16];
        cdb[..command.cdb.len()].copy_from_slice(&command.cdb);

        let mut request = ScsiPassThroughDirectWithSense {
            sptd: ScsiPassThroughDirect {
                length: size_of::<ScsiPassThroughDirect>() as u16,
                scsi_status: 0,
                path_id: 0,
                target_id: 0,
                lun: 0,
                cdb_length: command.cdb.len() as u8,
                sense_info_length: SENSE_BUFFER_LEN as u8,
                data_in: match command.direction {
                    DataDirection::None => SCSI_IOCTL_DATA_UNSPECIFIED,
                    DataDirection::In => SCSI_IOCTL_DATA_IN,
                    DataDirection::Out => SCSI_IOCTL_DATA_OUT,
                },
                data_transfer_length: transfer_length(command)?,
                timeout_value: timeout_secs(command),
                data_buffer: data.as_mut_ptr().cast(),
                sense_info_offset: offset_of!(ScsiPassThroughDirectWithSense, sense) as u32,
                cdb,
            },
            filler: 0,
            sense: [0; SENSE_BUFFER_LEN],
        };

        let start = Instant::now();
        self.ioctl(IOCTL_SCSI_PASS_THROUGH_DIRECT, &mut request)?;
        let elapsed = start.elapsed();

        let status = request.sptd.scsi_status;
        let sense = if status == status::CHECK_CONDITION {
            let len = usize::from(request.sptd.sense_info_length).min(SENSE_BUFFER_LEN);
            request.sense[..len].to_vec()
        } else {
            Vec::new()
        };
        let transferred = match command.direction {
            DataDirection::In => request.sptd.data_transfer_length as usize,
            _ => 0,
        };

        Ok(RawResult {
            status,
            sense,
            data: data.to_vec(transferred),
            elapsed,
            ata_registers: None,
        })
    }

    fn submit_ata(
        &mut self,
        command: &EncodedCommand<'_>,
        task_file: &AtaTaskFile,
    ) -> Result<RawResult, TransportError> {
        let mut data = ScratchBuffer::with_default_alignment(command.transfer_length)?;

        let mut flags = ATA_FLAGS_DRDY_REQUIRED;
        match command.direction {
            DataDirection::In => flags |= ATA_FLAGS_DATA_IN,
            DataDirection::Out => flags |= ATA_FLAGS_DATA_OUT,
            DataDirection::None => {}
        }
        if task_file.extended {
            flags |= ATA_FLAGS_48BIT_COMMAND;
        }
        if is_dma_command(task_file) {
            flags |= ATA_FLAGS_USE_DMA;
        }

        let mut request = AtaPassThroughDirect {
            length: size_of::<AtaPassThroughDirect>() as u16,
            ata_flags: flags,
            path_id: 0,
            target_id: 0,
            lun: 0,
            reserved_as_uchar: 0,
            data_transfer_length: transfer_length(command)?,
            timeout_value: timeout_secs(command),
            reserved_as_ulong: 0,
            data_buffer: data.as_mut_ptr().cast(),
            previous_task_file: task_file.previous,
            current_task_file: task_file.current,
        };

        let start = Instant::now();
        self.ioctl(IOCTL_ATA_PASS_THROUGH_DIRECT, &mut request)?;
        let elapsed = start.elapsed();

        let echo = AtaTaskFile {
            current: request.current_task_file,
            previous: request.previous_task_file,
            extended: task_file.extended,
        };
        debug!(status = echo.current[6], error = echo.current[0], "ATA pass-through returned");

        Ok(RawResult {
            status: status::GOOD,
            sense: Vec::new(),
            data: data.to_vec(request.data_transfer_length as usize),
            elapsed,
            ata_registers: Some(echo),
        })
    }
}

fn is_dma_command(task_file: &AtaTaskFile) -> bool {
    use crate::codec::ata::command::{READ_DMA, READ_DMA_EXT};
    matches!(task_file.current[6], READ_DMA | READ_DMA_EXT)
}

fn transfer_length(command: &EncodedCommand<'_>) -> Result<u32, TransportError> {
    u32::try_from(command.transfer_length).map_err(|_| TransportError::Rejected {
        // ERROR_INVALID_PARAMETER
        code: 87,
    })
}

fn timeout_secs(command: &EncodedCommand<'_>) -> u32 {
    command.timeout.as_secs().clamp(1, u64::from(u32::MAX)) as u32
}

impl<H: AsHandle> DeviceTransport for SptdTransport<H> {
    fn submit(&mut self, command: &EncodedCommand<'_>) -> Result<RawResult, TransportError> {
        match &command.ata {
            Some(task_file) => self.submit_ata(command, task_file),
            None => self.submit_scsi(command),
        }
    }

    fn max_cdb_length(&self) -> usize {
        MAX_INLINE_CDB
    }

    fn supports_extended_addressing(&self) -> bool {
        self.extended_ata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_struct_layouts() {
        assert_eq!(size_of::<ScsiPassThroughDirect>(), 56);
        assert_eq!(offset_of!(ScsiPassThroughDirect, cdb), 36);
        assert_eq!(size_of::<AtaPassThroughDirect>(), 48);
        assert_eq!(offset_of!(AtaPassThroughDirect, current_task_file), 40);
    }
}
