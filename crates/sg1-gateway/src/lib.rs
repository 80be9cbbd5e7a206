//! SG1 radio gateway bridge
//!
//! This crate connects SG1 gateway hardware to a publish/subscribe message
//! bus, and provides the bus-side endpoint that applications use to talk to
//! their devices through whichever gateway hears them.
//!
//! # Architecture
//!
//! 1. **Radio interface** - byte stream to the hardware (USB serial)
//! 2. **Gateway** - framing, hint matching, decode orchestration, reconnects
//! 3. **Message bus** - CBOR payloads on well-known topics (see [`sg1_core::topics`])
//! 4. **Device** - per-key endpoint: registration, replay rejection, routing
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `serial` feature to use SerialInterface
//! use sg1_core::{ChannelKey, DeliveryClass, LocalBus};
//! use sg1_gateway::{DeviceConfig, GatewayConfigBuilder, Registry, SerialInterface};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = Registry::new(Arc::new(LocalBus::new()));
//!
//!     let config = GatewayConfigBuilder::new("gw-1")
//!         .serial_port("/dev/ttyUSB0")
//!         .build();
//!     registry.add_gateway(SerialInterface::from_config(&config), &config)?;
//!
//!     let key = ChannelKey::generate();
//!     let mut events = registry.add_device("sensor", DeviceConfig::new(key))?;
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port interface (requires `libudev-dev` on Linux)
//!
//! # Message Flow
//!
//! ## Radio → bus
//!
//! 1. Hardware buffers a packet and reports its two hints in `NEWDATA`
//! 2. [`HintIndex`] maps the hints to candidate keys
//! 3. The gateway issues `SET_KEY` + `DECODE` for each candidate in turn
//! 4. `DECODED`/`DECODEDRT`/`DECODEDBEACON` is published on the key's topic
//! 5. Each [`Device`] drops copies from other gateways via its [`ReplayWindow`]
//!
//! ## Bus → radio
//!
//! 1. [`Device::send_message`] picks the best recently observed gateway
//! 2. The gateway chooses transmit power from the last path loss
//! 3. `SET_KEY` + `SEND`/`SENDRT` are written to the hardware

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Link layer
pub mod config;
pub mod error;
pub mod interface;
pub mod reconnect;

// Gateway internals
pub mod hint_index;
pub mod waiters;

// Gateway and endpoints
pub mod device;
pub mod gateway;
pub mod registry;
pub mod replay;

// Testing utilities
pub mod test_utils;

pub use config::{
    DeviceConfig, GatewayConfig, GatewayConfigBuilder, PortSelection, ReplayConfig, RfConfig,
    DEFAULT_BAUD_RATE, DEFAULT_RF_CHANNEL,
};
pub use error::{GatewayError, Result};
pub use interface::{ConnectionState, RadioInterface};

#[cfg(feature = "serial")]
pub use interface::SerialInterface;

pub use device::{Device, DeviceEvent, GatewayObservation};
pub use gateway::{
    Gateway, GatewayCommand, GatewayHandle, GatewayStats, NoiseCallback,
};
pub use hint_index::HintIndex;
pub use reconnect::{ConnectThrottle, PortSelector};
pub use registry::Registry;
pub use replay::{ReplayStats, ReplayWindow};
pub use test_utils::{MockInterface, TestFixture};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
