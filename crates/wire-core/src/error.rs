//! Error types for the lancall wire formats

use thiserror::Error;

/// Result type for wire encoding/decoding
pub type Result<T> = std::result::Result<T, WireError>;

/// Errors raised while decoding datagrams
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Media datagram shorter than the fixed header
    #[error("Media packet too short: {len} bytes (need at least {min})")]
    MediaTooShort { len: usize, min: usize },

    /// Signaling text that is not one of the known request/response lines
    #[error("Unrecognized signaling message: {first_line}")]
    UnknownSignaling { first_line: String },

    /// Discovery announcement that does not follow `DISCOVER:<port>|<name>|<role>`
    #[error("Malformed discovery announcement: {reason}")]
    MalformedAnnouncement { reason: String },

    /// Datagram bytes that are not valid UTF-8 text
    #[error("Datagram is not valid UTF-8")]
    NotText,
}

impl WireError {
    /// Create a malformed announcement error
    pub fn announcement(reason: impl Into<String>) -> Self {
        Self::MalformedAnnouncement {
            reason: reason.into(),
        }
    }
}
