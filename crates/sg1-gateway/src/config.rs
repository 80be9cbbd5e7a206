//! Configuration types for gateways and devices
//!
//! Durations are written in humantime form (`"5s"`, `"20m"`). Keys are
//! written as base64 text.

use serde::{Deserialize, Serialize};
use sg1_core::{ChannelKey, PowerRange};
use sg1_protocol::RfProfile;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Default baud rate for SG1 gateway hardware
pub const DEFAULT_BAUD_RATE: u32 = 250_000;

/// Default RF channel
pub const DEFAULT_RF_CHANNEL: u16 = 3;

/// Default serial read timeout
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Which serial port a gateway opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PortSelection {
    /// Always this path
    Fixed(PathBuf),
    /// Scan for a port, skipping ones that recently failed
    Auto,
}

impl From<String> for PortSelection {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("auto") || value.is_empty() {
            PortSelection::Auto
        } else {
            PortSelection::Fixed(PathBuf::from(value))
        }
    }
}

impl From<PortSelection> for String {
    fn from(value: PortSelection) -> Self {
        match value {
            PortSelection::Fixed(path) => path.display().to_string(),
            PortSelection::Auto => "auto".to_string(),
        }
    }
}

impl Default for PortSelection {
    fn default() -> Self {
        PortSelection::Auto
    }
}

/// Radio profile and channel pushed after every sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfConfig {
    /// Modulation profile; data rate or profile number in config files
    #[serde(default)]
    pub profile: RfProfile,
    /// Channel number
    #[serde(default = "default_rf_channel")]
    pub channel: u16,
}

fn default_rf_channel() -> u16 {
    DEFAULT_RF_CHANNEL
}

impl Default for RfConfig {
    fn default() -> Self {
        Self {
            profile: RfProfile::default(),
            channel: DEFAULT_RF_CHANNEL,
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway name, used in bus topics
    pub id: String,

    /// Serial port selection
    #[serde(default)]
    pub port: PortSelection,

    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Serial read timeout
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// How long to wait for VERSION after opening the port
    #[serde(with = "humantime_serde", default = "default_sync_timeout")]
    pub sync_timeout: Duration,

    /// Minimum spacing between open attempts
    #[serde(with = "humantime_serde", default = "default_reconnect_interval")]
    pub reconnect_interval: Duration,

    /// How long an auto-selected port is skipped after failing
    #[serde(with = "humantime_serde", default = "default_port_exclusion")]
    pub port_exclusion: Duration,

    /// Housekeeping period
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,

    /// How often to poll devices for registrations
    #[serde(with = "humantime_serde", default = "default_discovery_interval")]
    pub discovery_interval: Duration,

    /// Registrations older than this are forgotten
    #[serde(with = "humantime_serde", default = "default_registration_ttl")]
    pub registration_ttl: Duration,

    /// Radio settings
    #[serde(default)]
    pub rf: RfConfig,

    /// Valid transmit power range
    #[serde(default)]
    pub power: PowerRange,

    /// Bounded command queue depth
    #[serde(default = "default_command_queue_size")]
    pub command_queue_size: usize,

    /// How long a realtime send may wait for queue space before it is dropped
    #[serde(with = "humantime_serde", default = "default_realtime_send_timeout")]
    pub realtime_send_timeout: Duration,

    /// How long a reliable send may wait for queue space
    #[serde(with = "humantime_serde", default = "default_reliable_send_timeout")]
    pub reliable_send_timeout: Duration,

    /// Reply timeout for hardware queries
    #[serde(with = "humantime_serde", default = "default_waiter_timeout")]
    pub waiter_timeout: Duration,

    /// Keys decoded regardless of registration (base64)
    #[serde(default)]
    pub static_keys: Vec<String>,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(DEFAULT_READ_TIMEOUT_MS)
}

fn default_sync_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_port_exclusion() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_registration_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_command_queue_size() -> usize {
    256
}

fn default_realtime_send_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_reliable_send_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_waiter_timeout() -> Duration {
    Duration::from_secs(1)
}

impl GatewayConfig {
    /// Defaults for a named gateway
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            port: PortSelection::Auto,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: default_read_timeout(),
            sync_timeout: default_sync_timeout(),
            reconnect_interval: default_reconnect_interval(),
            port_exclusion: default_port_exclusion(),
            tick_interval: default_tick_interval(),
            discovery_interval: default_discovery_interval(),
            registration_ttl: default_registration_ttl(),
            rf: RfConfig::default(),
            power: PowerRange::default(),
            command_queue_size: default_command_queue_size(),
            realtime_send_timeout: default_realtime_send_timeout(),
            reliable_send_timeout: default_reliable_send_timeout(),
            waiter_timeout: default_waiter_timeout(),
            static_keys: Vec::new(),
        }
    }

    /// Parse `static_keys`
    pub fn static_channel_keys(&self) -> Result<Vec<ChannelKey>> {
        self.static_keys
            .iter()
            .map(|k| ChannelKey::from_b64(k).map_err(Into::into))
            .collect()
    }
}

/// Replay window sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Entries kept before old ones are collected
    #[serde(default = "default_replay_capacity")]
    pub capacity: usize,
    /// Age after which an entry may be collected
    #[serde(with = "humantime_serde", default = "default_replay_max_age")]
    pub max_age: Duration,
}

fn default_replay_capacity() -> usize {
    2000
}

fn default_replay_max_age() -> Duration {
    Duration::from_secs(16)
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: default_replay_capacity(),
            max_age: default_replay_max_age(),
        }
    }
}

/// Device endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Channel secret
    #[serde(with = "key_b64")]
    pub key: ChannelKey,

    /// Node id used when pairing
    #[serde(default)]
    pub node_id: u8,

    /// Transmit power range for requests from this device
    #[serde(default)]
    pub power: PowerRange,

    /// Gateway sightings older than this are not used for routing
    #[serde(with = "humantime_serde", default = "default_observation_ttl")]
    pub observation_ttl: Duration,

    /// Lifetime of a wake request
    #[serde(with = "humantime_serde", default = "default_wake_duration")]
    pub wake_duration: Duration,

    /// Replay window sizing
    #[serde(default)]
    pub replay: ReplayConfig,
}

fn default_observation_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_wake_duration() -> Duration {
    Duration::from_secs(30)
}

impl DeviceConfig {
    /// Defaults for a key
    pub fn new(key: ChannelKey) -> Self {
        Self {
            key,
            node_id: 0,
            power: PowerRange::default(),
            observation_ttl: default_observation_ttl(),
            wake_duration: default_wake_duration(),
            replay: ReplayConfig::default(),
        }
    }
}

/// Builder for GatewayConfig
#[derive(Debug)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Start from defaults
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            config: GatewayConfig::new(id),
        }
    }

    /// Use a fixed serial port
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.port = PortSelection::Fixed(port.into());
        self
    }

    /// Scan for a serial port
    pub fn auto_port(mut self) -> Self {
        self.config.port = PortSelection::Auto;
        self
    }

    /// Set baud rate
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.baud_rate = baud_rate;
        self
    }

    /// Set radio profile and channel
    pub fn rf(mut self, profile: RfProfile, channel: u16) -> Self {
        self.config.rf = RfConfig { profile, channel };
        self
    }

    /// Set transmit power range
    pub fn power(mut self, power: PowerRange) -> Self {
        self.config.power = power;
        self
    }

    /// Set sync timeout
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout = timeout;
        self
    }

    /// Set minimum reconnect spacing
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    /// Set housekeeping period
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Set discovery period
    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.config.discovery_interval = interval;
        self
    }

    /// Set command queue depth (at least 1)
    pub fn command_queue_size(mut self, size: usize) -> Self {
        self.config.command_queue_size = size.max(1);
        self
    }

    /// Set query reply timeout
    pub fn waiter_timeout(mut self, timeout: Duration) -> Self {
        self.config.waiter_timeout = timeout;
        self
    }

    /// Decode for this key without waiting for a registration
    pub fn static_key(mut self, key: &ChannelKey) -> Self {
        self.config.static_keys.push(key.to_b64());
        self
    }

    /// Build the configuration
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
pub(crate) mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// Keys in config files are base64 text rather than byte arrays
mod key_b64 {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use sg1_core::ChannelKey;

    pub fn serialize<S>(key: &ChannelKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&key.to_b64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ChannelKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChannelKey::from_b64(&s).map_err(serde::de::Error::custom)
    }
}
