//! Error types for frame encoding and payload parsing

use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload does not fit the one-byte length field
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Payload shorter than its fixed layout
    #[error("Truncated {message_type} payload: need {need} bytes, got {got}")]
    Truncated {
        /// Message type name
        message_type: &'static str,
        /// Minimum length
        need: usize,
        /// Received length
        got: usize,
    },

    /// VERSION frame without the SG1 magic
    #[error("Bad version magic: {0:02x?}")]
    BadMagic(Vec<u8>),

    /// RF profile that is neither a profile number nor a known data rate
    #[error("Invalid RF profile: {0}")]
    InvalidRfProfile(u32),

    /// Type id outside the message table
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
