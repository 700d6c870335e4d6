//! Error types for Lanbeam.
//!
//! This module provides a unified error type for all Lanbeam operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Lanbeam operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Lanbeam.
#[derive(Error, Debug)]
pub enum Error {
    /// A request parameter or body was missing or malformed
    #[error("invalid request: {0}")]
    InvalidBody(String),

    /// The receiver requires a PIN and none was supplied
    #[error("PIN required")]
    PinRequired,

    /// The supplied PIN did not match
    #[error("PIN invalid")]
    InvalidPin,

    /// The user (or a timeout) declined the transfer
    #[error("transfer rejected by receiver")]
    Rejected,

    /// Another session currently holds the receiver
    #[error("blocked by another session")]
    BlockedByOther,

    /// The peer is throttling requests
    #[error("too many requests")]
    TooManyRequests,

    /// The referenced session does not exist or has expired
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The file token did not match the session's issued token
    #[error("invalid token for file '{0}'")]
    InvalidToken(String),

    /// A received path escaped the upload root
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    /// The operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Written bytes did not match the declared size
    #[error("size mismatch for '{file}': declared {declared}, wrote {written}")]
    SizeMismatch {
        /// File name as declared by the sender
        file: String,
        /// Declared size in bytes
        declared: u64,
        /// Bytes actually written
        written: u64,
    },

    /// Streamed SHA-256 did not match the declared digest
    #[error("checksum mismatch for '{0}'")]
    ChecksumMismatch(String),

    /// The remote peer answered with an unexpected status or body
    #[error("peer error: {0}")]
    PeerError(String),

    /// A notification payload exceeded the serialised size bound
    #[error("notification payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Peer not present in the discovery cache
    #[error("peer '{0}' not found")]
    PeerNotFound(String),

    /// No usable network interface was found
    #[error("no usable network interface")]
    NoInterface,

    /// TLS identity generation or loading failed
    #[error("TLS identity error: {0}")]
    Tls(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure (connect, read, write, timeout)
    #[error("transport error: {0}")]
    Transport(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),
}

impl Error {
    /// HTTP status to surface to a remote peer for this error.
    ///
    /// Follows the v2 protocol mapping: PIN failures are 401, rejection
    /// 403, contention 409, throttling 429, everything else that reaches
    /// the peer boundary 400 or 500.
    #[must_use]
    pub const fn peer_status(&self) -> u16 {
        match self {
            Self::PinRequired | Self::InvalidPin => 401,
            Self::Rejected | Self::InvalidToken(_) => 403,
            Self::BlockedByOther => 409,
            Self::TooManyRequests => 429,
            Self::InvalidBody(_) | Self::UnknownSession(_) | Self::InvalidPath(_) => 400,
            _ => 500,
        }
    }

    /// The short `error` string carried in peer-facing JSON bodies.
    #[must_use]
    pub const fn wire_code(&self) -> &'static str {
        match self {
            Self::PinRequired => "PIN required",
            Self::InvalidPin => "PIN invalid",
            Self::Rejected => "rejected",
            Self::BlockedByOther => "blocked by another session",
            Self::TooManyRequests => "too many requests",
            Self::InvalidBody(_) => "invalid body",
            Self::UnknownSession(_) => "unknown session",
            Self::InvalidToken(_) => "invalid token",
            Self::Cancelled => "cancelled",
            _ => "internal error",
        }
    }

    /// Returns whether this error is the distinct cancellation kind.
    ///
    /// Cancellation is never conflated with transport failures; callers
    /// that abort an in-flight request check the session context first
    /// and report this instead of the underlying I/O error.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error should be swallowed (logged only) on scan paths.
    #[must_use]
    pub const fn is_scan_silent(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_) | Self::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(0)
        } else {
            Self::Transport(err.to_string())
        }
    }
}
