pub mod classify;
pub mod codec;
pub mod core;
pub mod device;
pub mod reader;
pub mod scan;
pub mod transport;

pub use crate::classify::{Classification, classify_ata, classify_scsi};
pub use crate::codec::{CommandDescriptor, DataDirection, ScsiResult, SenseData, SenseTriple};
pub use crate::core::{DecodeError, EncodingError, ScanError, TransportError};
pub use crate::device::{DeviceClass, DeviceInfo, InterfacePreference};
pub use crate::reader::{BlockReader, ReadPath};
pub use crate::scan::{AbortFlag, ScanEngine, ScanOptions, ScanResults, ScanState, Termination};
pub use crate::transport::{DeviceTransport, EmulatedDevice};
