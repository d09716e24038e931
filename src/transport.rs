use crate::commands::{ControlCode, ControlValue};

/// Errors a transport backend can report. `NoDevice` is special: the
/// acquisition loop treats it as fatal and terminates, everything else is
/// logged and retried on the next tick.
#[derive(Debug)]
pub enum TransportError {
    NoDevice,
    Io(std::io::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NoDevice => write!(f, "device disappeared"),
            Self::Io(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(ref error) => Some(error),
            _ => None
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io(error)
    }
}

pub type TransportResult<T> =
    core::result::Result<T, TransportError>;

/// The raw USB pipe to one attached oscilloscope. The engine borrows this
/// capability; discovery, enumeration and teardown belong to the caller.
///
/// All I/O methods return the transferred byte count on success.
pub trait Transport {
    /// Send one bulk command frame, retrying up to `attempts` times.
    fn bulk_command(&mut self, data: &[u8], attempts: u32) -> TransportResult<usize>;

    /// Read a single bulk IN transfer into `data`.
    fn bulk_read(&mut self, data: &mut [u8]) -> TransportResult<usize>;

    /// Read a large payload in packet-sized chunks until `data` is filled
    /// or the device stops sending.
    fn bulk_read_multi(&mut self, data: &mut [u8]) -> TransportResult<usize>;

    /// Control IN transfer for the given request code and value word.
    fn control_read(&mut self, code: ControlCode, data: &mut [u8], value: ControlValue)
        -> TransportResult<usize>;

    /// Control OUT transfer for the given request code.
    fn control_write(&mut self, code: ControlCode, data: &[u8]) -> TransportResult<usize>;

    /// The unique model id reported by the device descriptor.
    fn model_id(&self) -> u32;

    /// USB bulk packet size for the data endpoint.
    fn packet_size(&self) -> usize;

    fn is_connected(&self) -> bool;

    fn disconnect(&mut self);
}
