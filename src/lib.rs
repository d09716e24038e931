mod transport;
mod commands;
mod spec;
mod settings;
mod samplerate;
mod capture;
mod device;

/// Number of physical channels on every supported model.
pub const CHANNELS: usize = 2;

/// Number of special (non-channel) trigger sources: EXT and EXT/10.
pub const SPECIAL_CHANNELS: usize = 2;

#[derive(Debug)]
pub enum Error {
    /// Caller passed an out-of-range channel, mode or index.
    Parameter,
    /// The model does not implement the requested operation.
    Unsupported,
    /// The transport is not connected.
    Connection,
    /// The device vanished from the bus; the acquisition loop terminates.
    NoDevice,
    /// The transport reported an id the specification table doesn't know.
    UnknownModel(u32),
    /// Any other transport failure.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Parameter =>
                write!(f, "parameter out of range"),
            Self::Unsupported =>
                write!(f, "operation not supported by this model"),
            Self::Connection =>
                write!(f, "device not connected"),
            Self::NoDevice =>
                write!(f, "device disappeared"),
            Self::UnknownModel(id) =>
                write!(f, "unknown model id {}", id),
            Self::Io(error) =>
                write!(f, "transport error: {}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(ref error) => Some(error),
            _ => None
        }
    }
}

impl From<transport::TransportError> for Error {
    fn from(error: transport::TransportError) -> Self {
        match error {
            transport::TransportError::NoDevice => Error::NoDevice,
            transport::TransportError::Io(error) => Error::Io(error),
        }
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use transport::{
    Transport,
    TransportError,
    TransportResult,
};

pub use commands::{
    BulkCode,
    ControlCode,
    ControlValue,
    CaptureState,
};

pub use spec::{
    Model,
    ModelSpec,
    BulkBinding,
    ControlBinding,
    CommandBinding,
    SamplerateLimits,
    SamplerateSpec,
    OffsetLimits,
    ROLL_RECORD_LENGTH,
};

pub use settings::{
    Coupling,
    TriggerMode,
    Slope,
    RateMode,
    SamplerateTarget,
    SamplerateSettings,
    TriggerSettings,
    ChannelSettings,
    Settings,
};

pub use capture::SampleBuffer;

pub use device::{
    Device,
    Event,
};
