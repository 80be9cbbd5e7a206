//! Error types for gateway and device operations
//!
//! Transport errors are recovered by the gateway itself (reconnect with
//! backoff). Configuration errors are returned to the caller immediately.

use sg1_core::Sg1CoreError;
use sg1_protocol::ProtocolError;
use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    // ===== Serial/Interface Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Auto-selection found nothing usable
    #[error("No serial port available")]
    NoPortAvailable,

    /// Serial read error
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// Serial write error
    #[error("Serial write error: {0}")]
    WriteError(String),

    /// Link lost
    #[error("Radio link disconnected")]
    Disconnected,

    /// No VERSION frame arrived in time
    #[error("Sync timeout after {duration_ms}ms")]
    SyncTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Operation needs a connected link
    #[error("Gateway {0} is not connected")]
    NotConnected(String),

    // ===== Protocol Errors =====
    /// Framing or payload error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    // ===== Configuration Errors =====
    /// Key, power range or encoding error
    #[error(transparent)]
    Core(#[from] Sg1CoreError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Name already taken in a registry
    #[error("Duplicate name: {0}")]
    Duplicate(String),

    // ===== General Errors =====
    /// Command queue stayed full past the send timeout
    #[error("Gateway command queue full")]
    QueueFull,

    /// Gateway task has stopped
    #[error("Channel closed")]
    ChannelClosed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GatewayError::PortNotFound(_)
                | GatewayError::PortOpenFailed { .. }
                | GatewayError::NoPortAvailable
                | GatewayError::ReadError(_)
                | GatewayError::WriteError(_)
                | GatewayError::Disconnected
                | GatewayError::SyncTimeout { .. }
                | GatewayError::NotConnected(_)
                | GatewayError::QueueFull
        )
    }

    /// Check if this is a protocol error (bad data from the hardware)
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, GatewayError::Protocol(_))
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::PortNotFound(_) => "PORT_NOT_FOUND",
            GatewayError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            GatewayError::NoPortAvailable => "NO_PORT_AVAILABLE",
            GatewayError::ReadError(_) => "READ_ERROR",
            GatewayError::WriteError(_) => "WRITE_ERROR",
            GatewayError::Disconnected => "DISCONNECTED",
            GatewayError::SyncTimeout { .. } => "SYNC_TIMEOUT",
            GatewayError::NotConnected(_) => "NOT_CONNECTED",
            GatewayError::Protocol(_) => "PROTOCOL_ERROR",
            GatewayError::Core(_) => "CONFIG_ERROR",
            GatewayError::InvalidConfig(_) => "INVALID_CONFIG",
            GatewayError::Duplicate(_) => "DUPLICATE",
            GatewayError::QueueFull => "QUEUE_FULL",
            GatewayError::ChannelClosed => "CHANNEL_CLOSED",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for GatewayError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => GatewayError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                GatewayError::Io(std::io::Error::new(kind, err.description))
            }
            _ => GatewayError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GatewayError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = GatewayError::PortNotFound("/dev/ttyUSB0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert_eq!(
            GatewayError::SyncTimeout { duration_ms: 3000 }.error_code(),
            "SYNC_TIMEOUT"
        );
    }

    #[test]
    fn test_is_retriable() {
        assert!(GatewayError::Disconnected.is_retriable());
        assert!(GatewayError::SyncTimeout { duration_ms: 3000 }.is_retriable());
        assert!(!GatewayError::Core(Sg1CoreError::InvalidKeyLength(3)).is_retriable());
    }

    #[test]
    fn test_protocol_errors_convert() {
        let err: GatewayError = ProtocolError::UnknownMessageType(17).into();
        assert!(err.is_protocol_error());
        assert!(err.to_string().contains("17"));
        assert!(!GatewayError::Disconnected.is_protocol_error());
    }
}
