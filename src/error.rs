use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Tephra errors. Variants mirror the observable failure classes of the
/// storage engine: bad requests, bad configuration, unrecoverable startup
/// state, filesystem failures split by direction, corruption, and read
/// deadline expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid user input: schema mismatches, oversized values, malformed
    /// commands. No state is mutated when this is returned.
    InvalidRequest(String),
    /// Invalid or inconsistent configuration, e.g. a zero compaction
    /// threshold.
    Config(String),
    /// The engine cannot start, typically because an on-disk transaction
    /// log names files that are missing or mismatched.
    StartupFailure(String),
    /// A filesystem read failed.
    FsRead(String),
    /// A filesystem write failed.
    FsWrite(String),
    /// Checksum mismatch or structurally invalid on-disk data.
    Corrupt(String),
    /// A read exceeded its deadline.
    Timeout(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::StartupFailure(msg) => write!(f, "startup failure: {msg}"),
            Error::FsRead(msg) => write!(f, "filesystem read error: {msg}"),
            Error::FsWrite(msg) => write!(f, "filesystem write error: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::Timeout(msg) => write!(f, "timed out: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidRequest from a format string.
#[macro_export]
macro_rules! errreq {
    ($($args:tt)*) => { $crate::error::Error::InvalidRequest(format!($($args)*)).into() };
}

/// Constructs an Error::Corrupt from a format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)).into() };
}

/// A tephra Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        // io::Error carries no direction; default to the read side and let
        // write paths wrap explicitly via `write_err`.
        Error::FsRead(err.to_string())
    }
}

/// Wraps an io::Error raised on a write path.
pub fn write_err(err: std::io::Error) -> Error {
    Error::FsWrite(err.to_string())
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupt(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::FsRead(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::FsRead(err.to_string())
    }
}
