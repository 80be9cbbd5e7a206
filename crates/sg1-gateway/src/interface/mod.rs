//! Byte-stream interfaces to gateway hardware
//!
//! - [`SerialInterface`] - USB serial link (requires `serial` feature)
//! - [`crate::test_utils::MockInterface`] - scripted link for tests
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialInterface;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Raw byte link to one piece of gateway hardware
///
/// Framing is done above this layer. `read_chunk` must be cancel-safe: the
/// gateway polls it inside `tokio::select!` alongside its command queue.
#[async_trait]
pub trait RadioInterface: Send + Sync {
    /// Open the link
    async fn connect(&mut self) -> Result<()>;

    /// Close the link. Closing a closed link is not an error.
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently open
    fn is_connected(&self) -> bool;

    /// Read whatever bytes are available
    ///
    /// Returns `None` on a read timeout with no data.
    /// Returns `Err` when the link is lost.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Write and flush
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Interface name (for logging)
    fn name(&self) -> &str;

    /// The link opened but the hardware never synced on it
    fn mark_unhealthy(&mut self) {}

    /// The hardware synced on this link
    fn mark_healthy(&mut self) {}
}

/// Gateway link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, waiting for the next attempt
    Disconnected,
    /// Opening the port
    Connecting,
    /// Port open, waiting for the hardware to announce itself
    Syncing,
    /// Ready for traffic
    Connected,
}

impl ConnectionState {
    /// Port is open and should be read
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Syncing | ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Syncing => write!(f, "syncing"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}
