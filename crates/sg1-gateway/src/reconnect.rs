//! Reconnect pacing and serial port auto-selection

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Glob patterns scanned when the OS port listing finds nothing
pub const FALLBACK_PORT_PATTERNS: &[&str] = &[
    // Linux
    "/dev/serial/by-id/*",
    "/dev/ttyUSB*",
    "/dev/ttyACM*",
    // macOS
    "/dev/cu.usbserial-*",
    "/dev/cu.usbmodem*",
];

/// Enforces a minimum spacing between open attempts
#[derive(Debug, Clone)]
pub struct ConnectThrottle {
    min_interval: Duration,
    last_attempt: Option<Instant>,
}

impl ConnectThrottle {
    /// Throttle with the given spacing
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_attempt: None,
        }
    }

    /// Claim an attempt slot. Returns `false` if the last attempt was too recent.
    pub fn try_begin(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_attempt = Some(now);
        true
    }

    /// Time until the next attempt is allowed
    pub fn retry_in(&self, now: Instant) -> Duration {
        match self.last_attempt {
            Some(last) => self
                .min_interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

/// Consecutive failures before an auto-selected port is skipped
pub const PORT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct PortFailures {
    count: u32,
    last: Instant,
}

/// Picks a serial port, skipping ports that keep failing
///
/// A port is excluded once it has failed [`PORT_FAILURE_THRESHOLD`] times in a
/// row, for `exclusion` after the last failure. A quiet spell of `exclusion`
/// also forgets the count.
#[derive(Debug, Clone)]
pub struct PortSelector {
    exclusion: Duration,
    threshold: u32,
    failures: HashMap<PathBuf, PortFailures>,
}

impl PortSelector {
    /// Selector that skips failing ports for `exclusion`
    pub fn new(exclusion: Duration) -> Self {
        Self {
            exclusion,
            threshold: PORT_FAILURE_THRESHOLD,
            failures: HashMap::new(),
        }
    }

    /// Override the consecutive failure count that triggers exclusion
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    /// First candidate not currently excluded
    pub fn select(&mut self, candidates: &[PathBuf], now: Instant) -> Option<PathBuf> {
        let exclusion = self.exclusion;
        self.failures
            .retain(|_, f| now.saturating_duration_since(f.last) < exclusion);
        let chosen = candidates
            .iter()
            .find(|p| !self.is_excluded(p, now))
            .cloned();
        match &chosen {
            Some(path) => debug!(port = %path.display(), "Selected serial port"),
            None => debug!(
                candidates = candidates.len(),
                tracked = self.failures.len(),
                "No usable serial port"
            ),
        }
        chosen
    }

    /// Count a failure to open, read or sync on `port`
    pub fn record_failure(&mut self, port: &Path, now: Instant) {
        let exclusion = self.exclusion;
        let entry = self
            .failures
            .entry(port.to_path_buf())
            .or_insert(PortFailures { count: 0, last: now });
        if now.saturating_duration_since(entry.last) >= exclusion {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last = now;

        if entry.count >= self.threshold {
            info!(
                port = %port.display(),
                failures = entry.count,
                exclusion = ?self.exclusion,
                "Excluding serial port"
            );
        } else {
            debug!(port = %port.display(), failures = entry.count, "Serial port failed");
        }
    }

    /// Forget a port's failures after it synced
    pub fn record_success(&mut self, port: &Path) {
        self.failures.remove(port);
    }

    /// Consecutive failures currently held against `port`
    pub fn failure_count(&self, port: &Path) -> u32 {
        self.failures.get(port).map_or(0, |f| f.count)
    }

    /// Whether `port` is currently excluded
    pub fn is_excluded(&self, port: &Path, now: Instant) -> bool {
        self.failures.get(port).is_some_and(|f| {
            f.count >= self.threshold && now.saturating_duration_since(f.last) < self.exclusion
        })
    }
}

/// Serial ports that might carry gateway hardware, USB ports first
pub fn candidate_ports() -> Vec<PathBuf> {
    let mut ports: Vec<PathBuf> = Vec::new();

    #[cfg(feature = "serial")]
    {
        if let Ok(listed) = serialport::available_ports() {
            let (usb, other): (Vec<_>, Vec<_>) = listed.into_iter().partition(|p| {
                matches!(p.port_type, serialport::SerialPortType::UsbPort(_))
            });
            ports.extend(usb.into_iter().map(|p| PathBuf::from(p.port_name)));
            ports.extend(other.into_iter().map(|p| PathBuf::from(p.port_name)));
        }
    }

    if ports.is_empty() {
        for pattern in FALLBACK_PORT_PATTERNS {
            if let Ok(entries) = glob::glob(pattern) {
                for entry in entries.flatten() {
                    if !ports.contains(&entry) {
                        ports.push(entry);
                    }
                }
            }
        }
    }

    ports
}
