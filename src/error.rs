use std::fmt::Display;

/// Logtally errors.
///
/// Anything that reaches the caller through this type is terminal for the
/// current operation; the engine does not retry internally.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid persistent data, typically decoding errors, corruption, or a
    /// record version newer than this build understands.
    InvalidData(String),
    /// Invalid caller input, such as an out-of-range day or hour index.
    InvalidInput(String),
    /// The database on disk is incompatible with the current process
    /// (byte order, type sizes, time settings, or a refused truncation).
    Incompatible(String),
    /// A required dependent row is missing, e.g. an active visit whose host
    /// points at it, or the last URL of a restored visit.
    MissingNode(String),
    /// An IO error, including anything surfaced by the embedded store.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Incompatible(msg) => write!(f, "incompatible database: {msg}"),
            Error::MissingNode(msg) => write!(f, "missing node: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)) };
}

/// A logtally Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidData(err.to_string())
    }
}
