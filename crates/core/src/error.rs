//! Error types for skiff-core
//!
//! Provides a unified error type whose variants collapse onto the abstract
//! [`Status`] taxonomy surfaced to callers. Transport failures and non-2xx
//! replies share the `NotFound` status, but the variant keeps the finer
//! cause so it can still be inspected.

use std::fmt;

use thiserror::Error;

/// Result type alias for skiff operations
pub type Result<T> = std::result::Result<T, Error>;

/// Abstract status codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    Failure = 1,
    NotFound = 2,
    NotSupported = 3,
    InvalidArgument = 4,
    OutOfMemory = 5,
    NameTooLong = 6,
    NotDirectory = 7,
    NotEmpty = 8,
    AlreadyExists = 9,
}

impl Status {
    /// Convert to the raw integer code
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Create from a raw integer code
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::Failure),
            2 => Some(Self::NotFound),
            3 => Some(Self::NotSupported),
            4 => Some(Self::InvalidArgument),
            5 => Some(Self::OutOfMemory),
            6 => Some(Self::NameTooLong),
            7 => Some(Self::NotDirectory),
            8 => Some(Self::NotEmpty),
            9 => Some(Self::AlreadyExists),
            _ => None,
        }
    }

    /// Get a human-readable description
    pub const fn description(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::NotFound => "not found",
            Self::NotSupported => "not supported",
            Self::InvalidArgument => "invalid argument",
            Self::OutOfMemory => "out of memory",
            Self::NameTooLong => "name too long",
            Self::NotDirectory => "not a directory",
            Self::NotEmpty => "directory not empty",
            Self::AlreadyExists => "already exists",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Why a peer could not be reached or an exchange broke down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// The socket could not be established
    Dial,
    /// A write batch or read call exceeded its deadline
    Timeout,
    /// The peer reset the connection or a socket call failed
    Io,
    /// The peer closed the stream before the reply was complete
    Closed,
    /// The reply could not be parsed as HTTP/1.x
    Protocol,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cause::Dial => "dial failed",
            Cause::Timeout => "timed out",
            Cause::Io => "i/o error",
            Cause::Closed => "connection closed by peer",
            Cause::Protocol => "malformed reply",
        };
        f.write_str(s)
    }
}

/// Error types for skiff operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Object, entry, or profile not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The peer could not be reached or the exchange failed midway
    #[error("Unreachable ({cause}): {detail}")]
    Unreachable { cause: Cause, detail: String },

    /// The peer answered with a non-2xx status
    #[error("HTTP status {code}")]
    HttpStatus { code: u16 },

    /// Backend has no implementation for this operation
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A buffer could not be allocated
    #[error("Out of memory")]
    OutOfMemory,

    /// A path, key, or name exceeds its bound
    #[error("Name too long: {0}")]
    NameTooLong(String),

    /// A non-final path component is not a directory
    #[error("Not a directory: {0}")]
    NotDirectory(String),

    /// Directory still has entries
    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Object or directory already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Request framing exceeded the header budget
    #[error("Framing error: {0}")]
    Framing(String),

    /// Content digest did not match the expected value
    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// Encryption envelope could not be produced or opened
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// General error
    #[error("{0}")]
    General(String),
}

impl Error {
    /// Build a transport failure
    pub fn unreachable(cause: Cause, detail: impl Into<String>) -> Self {
        Error::Unreachable {
            cause,
            detail: detail.into(),
        }
    }

    /// Map this error onto the abstract status taxonomy
    pub const fn status(&self) -> Status {
        match self {
            Error::NotFound(_) | Error::Unreachable { .. } | Error::HttpStatus { .. } => {
                Status::NotFound
            }
            Error::NotSupported(_) => Status::NotSupported,
            Error::InvalidArgument(_) | Error::Config(_) | Error::InvalidUrl(_) => {
                Status::InvalidArgument
            }
            Error::OutOfMemory => Status::OutOfMemory,
            Error::NameTooLong(_) => Status::NameTooLong,
            Error::NotDirectory(_) => Status::NotDirectory,
            Error::NotEmpty(_) => Status::NotEmpty,
            Error::AlreadyExists(_) => Status::AlreadyExists,
            _ => Status::Failure,
        }
    }

    /// HTTP status code carried by the error, if the peer answered
    pub const fn http_code(&self) -> Option<u16> {
        match self {
            Error::HttpStatus { code } => Some(*code),
            _ => None,
        }
    }

    /// Whether the failure happened on the wire rather than at the peer
    pub const fn transport_cause(&self) -> Option<Cause> {
        match self {
            Error::Unreachable { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::NotFound("k".into()).status(), Status::NotFound);
        assert_eq!(
            Error::unreachable(Cause::Dial, "refused").status(),
            Status::NotFound
        );
        assert_eq!(Error::HttpStatus { code: 503 }.status(), Status::NotFound);
        assert_eq!(Error::NotSupported("post").status(), Status::NotSupported);
        assert_eq!(
            Error::InvalidArgument("range".into()).status(),
            Status::InvalidArgument
        );
        assert_eq!(Error::NotEmpty("d/".into()).status(), Status::NotEmpty);
        assert_eq!(Error::Framing("full".into()).status(), Status::Failure);
        assert_eq!(
            Error::Integrity {
                expected: "a".into(),
                actual: "b".into()
            }
            .status(),
            Status::Failure
        );
    }

    #[test]
    fn test_diagnostic_channel() {
        let err = Error::unreachable(Cause::Timeout, "write");
        assert_eq!(err.transport_cause(), Some(Cause::Timeout));
        assert_eq!(err.http_code(), None);

        let err = Error::HttpStatus { code: 404 };
        assert_eq!(err.http_code(), Some(404));
        assert_eq!(err.transport_cause(), None);
    }

    #[test]
    fn test_status_roundtrip() {
        for code in 0..10 {
            let status = Status::from_i32(code).unwrap();
            assert_eq!(status.as_i32(), code);
        }
        assert_eq!(Status::from_i32(42), None);
    }

    #[test]
    fn test_error_display() {
        let err = Error::NotDirectory("a/b".into());
        assert_eq!(err.to_string(), "Not a directory: a/b");
        assert_eq!(Status::NotEmpty.to_string(), "directory not empty");
    }
}
