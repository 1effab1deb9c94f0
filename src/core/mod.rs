pub mod error;

pub use error::{DecodeError, EncodingError, Result, ScanError, TransportError};
