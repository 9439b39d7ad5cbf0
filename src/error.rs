//! Crate-wide result/error kinds, mirroring the fixed set of status codes every
//! fallible operation in this crate can return.

use std::fmt;

/// The result of a fallible core operation.
///
/// `Busy` and `AtEnd` are not failures in the conventional sense — they are
/// conditions callers are expected to branch on — but they are still
/// communicated as `Err` so the type system forces that branch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Null/missing required argument, out-of-range index, unsupported format or
    /// channel count.
    InvalidArgs,
    /// Contract violation: format mismatch on reinit, seek on a detached stream, etc.
    InvalidOperation,
    /// Allocation failure, or slot exhaustion in a fixed-capacity structure.
    OutOfMemory,
    /// The requested data will become available later.
    Busy,
    /// No more data is available; not a failure for consumers that handle it.
    AtEnd,
    /// The resource has begun teardown; further operations are forbidden.
    Unavailable,
    /// The requested resampler backend could not be constructed.
    NoBackend,
    /// Non-blocking job queue was empty.
    NoDataAvailable,
    /// A `Quit` job was observed.
    Cancelled,
    /// A size computation would overflow the platform word.
    TooBig,
    /// The capability was not implemented by this collaborator.
    NotImplemented,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArgs => "invalid argument",
            Error::InvalidOperation => "invalid operation",
            Error::OutOfMemory => "out of memory",
            Error::Busy => "busy",
            Error::AtEnd => "at end",
            Error::Unavailable => "unavailable",
            Error::NoBackend => "no backend",
            Error::NoDataAvailable => "no data available",
            Error::Cancelled => "cancelled",
            Error::TooBig => "too big",
            Error::NotImplemented => "not implemented",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

/// Shorthand for the result type every core operation returns.
pub type Result<T> = std::result::Result<T, Error>;
