use std::io;

#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// Not enough data available yet, or the operation would block.
    Wait,
    BadPreamble,
    VersionMismatch,
    FrameTooLarge,
    DocumentTooLarge,
    AuthFailed,
    Crypto,
    Serialization,
    NoPrivateKey,
    NotFound,
    Backpressure,
    PoolExhausted,
    StoreFull,
    BadTransport,
    Protocol,
    Timeout,
    Resolve,
    Io(io::ErrorKind),
}

impl From<io::Error> for Error {
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error.kind())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(_: Box<bincode::ErrorKind>) -> Self {
        Error::Serialization
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
