use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Ashback errors.
///
/// Handler-visible kinds map one-to-one onto RPC status codes; see
/// `rpc::Status`. Errors never take the server down: handlers translate
/// them into the response status and keep serving.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Malformed request: bad header, out-of-range offset, or a missing
    /// prerequisite such as getRecoveryData before startReadingData.
    BadRequest(String),
    /// Invalid persisted or in-flight data: truncated entry frames,
    /// length overruns, checksum mismatches.
    BadData(String),
    /// The operation requires an OPEN segment.
    SegmentNotOpen,
    /// The segment has already been closed and is immutable.
    SegmentAlreadyClosed,
    /// The segment was freed; only removal remains valid.
    SegmentFreed,
    /// The requested (master, segment) key is not in the registry.
    SegmentUnavailable,
    /// No free aligned buffer to stage another segment.
    PoolExhausted,
    /// The storage backend has no free extent.
    StorageOutOfSpace,
    /// A storage read or write completion failed.
    StorageIo(String),
    /// A load is still in flight and the caller asked not to block.
    LoadInProgress,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Error::BadData(msg) => write!(f, "bad data: {msg}"),
            Error::SegmentNotOpen => write!(f, "segment is not open"),
            Error::SegmentAlreadyClosed => write!(f, "segment is already closed"),
            Error::SegmentFreed => write!(f, "segment has been freed"),
            Error::SegmentUnavailable => write!(f, "segment unavailable"),
            Error::PoolExhausted => write!(f, "segment pool exhausted"),
            Error::StorageOutOfSpace => write!(f, "storage out of space"),
            Error::StorageIo(msg) => write!(f, "storage io error: {msg}"),
            Error::LoadInProgress => write!(f, "segment load still in progress"),
        }
    }
}

/// Constructs an Error::BadRequest for the given format string.
#[macro_export]
macro_rules! errreq {
    ($($args:tt)*) => { $crate::error::Error::BadRequest(format!($($args)*)).into() };
}

/// Constructs an Error::BadData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::BadData(format!($($args)*)).into() };
}

/// An ashback Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::BadData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageIo(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::StorageIo(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::StorageIo(err.to_string())
    }
}
