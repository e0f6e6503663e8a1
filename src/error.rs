use std::error;
use std::fmt::{self, Debug, Display};
use std::io;

/// The error type used by this library.
///
/// This covers chip-database and hex-file parse failures, constraint
/// violations caught before anything is sent to the programmer, and
/// protocol-level failures on the wire.
pub enum Error {
    /// The chip-info database is malformed.
    Format(String),

    /// Unknown fuse name or setting, or a raw fuse pattern that matches no
    /// declared setting.
    Fuse(String),

    /// An improperly formatted Intel-HEX record.
    InvalidRecord(String),

    /// An Intel-HEX record failed its checksum test.
    InvalidChecksum(String),

    /// A caller-supplied value violates the chip's constraints.
    InvalidValue(String),

    /// The programmer returned something other than the expected response.
    ///
    /// This can happen when the wrong chip is in the socket, the programmer
    /// lost power mid-command, or the serial line dropped bytes. The driver
    /// flushes its input and leaves the programmer with Vpp off whenever
    /// this is raised.
    InvalidResponse(String),

    /// Commands were issued in an order the protocol does not allow.
    InvalidCommandSequence(String),

    /// The serial port could not be opened.
    Connection(String),

    /// An I/O error from the serial port or the filesystem.
    Io(io::Error),
}

impl Error {
    pub(crate) fn response(message: impl Into<String>) -> Self {
        Error::InvalidResponse(message.into())
    }

    pub fn value(message: impl Into<String>) -> Self {
        Error::InvalidValue(message.into())
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Format(msg) => write!(f, "Error::Format({:?})", msg),
            Error::Fuse(msg) => write!(f, "Error::Fuse({:?})", msg),
            Error::InvalidRecord(msg) => write!(f, "Error::InvalidRecord({:?})", msg),
            Error::InvalidChecksum(msg) => write!(f, "Error::InvalidChecksum({:?})", msg),
            Error::InvalidValue(msg) => write!(f, "Error::InvalidValue({:?})", msg),
            Error::InvalidResponse(msg) => write!(f, "Error::InvalidResponse({:?})", msg),
            Error::InvalidCommandSequence(msg) => {
                write!(f, "Error::InvalidCommandSequence({:?})", msg)
            }
            Error::Connection(msg) => write!(f, "Error::Connection({:?})", msg),
            Error::Io(err) => write!(f, "Error::Io({:?})", err),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Format(msg) => write!(f, "chip database format error: {}", msg),
            Error::Fuse(msg) => write!(f, "fuse error: {}", msg),
            Error::InvalidRecord(msg) => write!(f, "invalid hex record: {}", msg),
            Error::InvalidChecksum(msg) => write!(f, "hex record checksum mismatch: {}", msg),
            Error::InvalidValue(msg) => write!(f, "invalid value: {}", msg),
            Error::InvalidResponse(msg) => write!(f, "invalid response: {}", msg),
            Error::InvalidCommandSequence(msg) => write!(f, "invalid command sequence: {}", msg),
            Error::Connection(msg) => write!(f, "connection error: {}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
