use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grant::GrantId;
use crate::types::SessionId;

// MARK: - ErrorKind

/// Category of a failed session, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidRequest,
    GrantRedemptionFailed,
    SecurityDenied,
    SourceUnavailable,
    UnexpectedStop,
    EncodeFailed,
    InternalError,
    Timeout,
    /// Every attempt was suspect and the session runs with
    /// [`ExhaustionPolicy::Fail`](crate::ExhaustionPolicy::Fail).
    Exhausted,
}

impl ErrorKind {
    /// Wire code, e.g. `SECURITY_DENIED`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest        => "INVALID_REQUEST",
            Self::GrantRedemptionFailed => "GRANT_REDEMPTION_FAILED",
            Self::SecurityDenied        => "SECURITY_DENIED",
            Self::SourceUnavailable     => "SOURCE_UNAVAILABLE",
            Self::UnexpectedStop        => "UNEXPECTED_STOP",
            Self::EncodeFailed          => "ENCODE_FAILED",
            Self::InternalError         => "INTERNAL_ERROR",
            Self::Timeout               => "TIMEOUT",
            Self::Exhausted             => "EXHAUSTED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// MARK: - Request-time errors

/// Synchronous rejection of a start request. No resource is allocated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Target geometry must be positive on both axes, got {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("Capture grant {0} was already consumed")]
    GrantConsumed(GrantId),

    #[error("Capture grant {0} has expired")]
    GrantExpired(GrantId),

    #[error("Capture session {0} is still active")]
    SessionActive(SessionId),
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidRequest
    }
}

// MARK: - Grant redemption

/// Failure to turn a grant into a live frame source. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("Grant rejected by platform: {reason}")]
    Rejected { reason: String },

    #[error("Security denial: {reason}")]
    SecurityDenied { reason: String },

    #[error("Frame source unavailable: {reason}")]
    Unavailable { reason: String },
}

impl AcquireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected { .. }       => ErrorKind::GrantRedemptionFailed,
            Self::SecurityDenied { .. } => ErrorKind::SecurityDenied,
            Self::Unavailable { .. }    => ErrorKind::SourceUnavailable,
        }
    }
}

// MARK: - Subscription

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Frame source already has a live subscription")]
    AlreadySubscribed,

    #[error("Frame source was released")]
    Released,

    #[error("Frame source failed: {reason}")]
    Platform { reason: String },
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SourceUnavailable
    }
}

// MARK: - Frame layout

/// A raw buffer whose declared layout does not fit its bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame has empty dimensions {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },

    #[error("Pixel stride {0} is too small for a colour pixel")]
    PixelStrideTooSmall(u32),

    #[error("Row stride {row_stride} is shorter than a packed row ({min} bytes)")]
    RowStrideTooSmall { row_stride: u32, min: u64 },

    #[error("Frame buffer holds {len} bytes, layout needs {required}")]
    BufferTooShort { len: usize, required: u64 },
}

impl FrameError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InternalError
    }
}

// MARK: - Encoding

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Frame layout: {0}")]
    Layout(#[from] FrameError),

    #[error("Image encoding failed: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::EncodeFailed
    }
}

// MARK: - Configuration

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration invalid: {reason}")]
    Invalid { reason: String },

    #[error("Configuration unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration malformed: {0}")]
    Parse(#[from] serde_json::Error),
}
