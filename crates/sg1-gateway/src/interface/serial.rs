//! Serial port interface for SG1 gateway hardware
//!
//! Async serial I/O via tokio-serial. Bytes are handed up unframed; the
//! gateway runs them through the nanoframe parser because the hardware
//! interleaves frames with debug text.

use crate::config::{GatewayConfig, PortSelection};
use crate::error::{GatewayError, Result};
use crate::interface::RadioInterface;
use crate::reconnect::{candidate_ports, PortSelector};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Serial link to gateway hardware
pub struct SerialInterface {
    /// Fixed path or auto-selection
    selection: PortSelection,

    /// Port chosen for the current or last connection
    port_path: Option<PathBuf>,

    /// Auto-selection exclusions
    selector: PortSelector,

    /// Baud rate
    baud_rate: u32,

    /// Read timeout
    timeout: Duration,

    /// Serial stream (when connected)
    stream: Option<SerialStream>,

    /// Interface name for logging
    name: String,
}

impl SerialInterface {
    /// Interface for a fixed port
    pub fn new(port: impl AsRef<Path>) -> Self {
        let path = port.as_ref().to_path_buf();
        let mut iface = Self::with_selection(PortSelection::Fixed(path.clone()));
        iface.port_path = Some(path);
        iface
    }

    /// Interface that scans for a port on every connect
    pub fn auto() -> Self {
        Self::with_selection(PortSelection::Auto)
    }

    /// Build from gateway configuration
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut iface = match &config.port {
            PortSelection::Fixed(path) => Self::new(path),
            PortSelection::Auto => Self::auto(),
        };
        iface.baud_rate = config.baud_rate;
        iface.timeout = config.read_timeout;
        iface.selector = PortSelector::new(config.port_exclusion);
        iface
    }

    fn with_selection(selection: PortSelection) -> Self {
        let name = match &selection {
            PortSelection::Fixed(path) => format!("serial:{}", path.display()),
            PortSelection::Auto => "serial:auto".to_string(),
        };
        Self {
            selection,
            port_path: None,
            selector: PortSelector::new(Duration::from_secs(20 * 60)),
            baud_rate: crate::config::DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(crate::config::DEFAULT_READ_TIMEOUT_MS),
            stream: None,
            name,
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Create with custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Port in use, if one has been chosen
    pub fn port_path(&self) -> Option<&Path> {
        self.port_path.as_deref()
    }

    fn choose_port(&mut self) -> Result<PathBuf> {
        match &self.selection {
            PortSelection::Fixed(path) => Ok(path.clone()),
            PortSelection::Auto => self
                .selector
                .select(&candidate_ports(), Instant::now())
                .ok_or(GatewayError::NoPortAvailable),
        }
    }

    fn open_failed(&mut self, port: &Path, err: GatewayError) -> GatewayError {
        if self.selection == PortSelection::Auto {
            self.selector.record_failure(port, Instant::now());
        }
        err
    }

    fn link_lost(&mut self, err: GatewayError) -> GatewayError {
        self.stream = None;
        if let (PortSelection::Auto, Some(port)) = (&self.selection, self.port_path.clone()) {
            self.selector.record_failure(&port, Instant::now());
        }
        err
    }
}

#[async_trait]
impl RadioInterface for SerialInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let port = self.choose_port()?;
        info!(port = %port.display(), baud = self.baud_rate, "Opening serial port");

        if !port.exists() {
            let err = GatewayError::PortNotFound(port.display().to_string());
            return Err(self.open_failed(&port, err));
        }

        let opened = tokio_serial::new(port.to_string_lossy(), self.baud_rate)
            .timeout(self.timeout)
            .open_native_async();
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                let err = GatewayError::PortOpenFailed {
                    port: port.display().to_string(),
                    reason: e.to_string(),
                };
                return Err(self.open_failed(&port, err));
            }
        };

        self.name = format!("serial:{}", port.display());
        self.port_path = Some(port);
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            info!(interface = %self.name, "Closed serial port");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let stream = self.stream.as_mut().ok_or(GatewayError::Disconnected)?;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        match stream.read(&mut buf).await {
            Ok(0) => Err(self.link_lost(GatewayError::Disconnected)),
            Ok(n) => {
                trace!(bytes = n, "Read from serial port");
                Ok(Some(Bytes::copy_from_slice(&buf[..n])))
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                error!(error = %e, "Serial read error");
                Err(self.link_lost(GatewayError::ReadError(e.to_string())))
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(GatewayError::Disconnected)?;
        debug!(size = data.len(), "Writing to serial port");

        let written = match stream.write_all(data).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| {
            error!(error = %e, "Serial write error");
            self.link_lost(GatewayError::WriteError(e.to_string()))
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mark_unhealthy(&mut self) {
        if let (PortSelection::Auto, Some(port)) = (&self.selection, self.port_path.clone()) {
            self.selector.record_failure(&port, Instant::now());
        }
    }

    fn mark_healthy(&mut self) {
        if let Some(port) = &self.port_path {
            self.selector.record_success(port);
        }
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("selection", &self.selection)
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}
