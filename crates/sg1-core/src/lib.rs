//! SG1 Core - Foundational types for the SG1 radio bridge
//!
//! This crate provides the pieces shared by gateways and devices:
//!
//! - [`key`] - 32-byte channel keys and their opaque encodings
//! - [`hint`] - rotating 20-bit routing hints derived with ChaCha20-Poly1305
//! - [`power`] - transmit power selection from observed path loss
//! - [`message`] - CBOR bus payloads
//! - [`topics`] - bus topic names
//! - [`bus`] - the publish/subscribe boundary and an in-process broker
//! - [`error`] - error types
//!
//! # Example
//!
//! ```rust
//! use sg1_core::{derive_hints, unix_micros_now, ChannelKey};
//!
//! let key = ChannelKey::generate();
//! let hints = derive_hints(&key, unix_micros_now());
//! println!("{} is on the air as {}", key, hints.hint);
//! ```

pub mod bus;
pub mod error;
pub mod hint;
pub mod key;
pub mod message;
pub mod power;
pub mod topics;

pub use bus::{BusHandler, LocalBus, MessageBus, MessageBusExt, Subscription};
pub use error::{Result, Sg1CoreError};
pub use hint::{
    derive_hint, derive_hints, fixed_hint, unix_micros_now, Hint, HintSet, TimeBucket, HINT_MASK,
    TIME_BUCKET_SHIFT,
};
pub use key::{ChannelKey, CHANNEL_KEY_LEN};
pub use message::{DeliveryClass, PairRequest, RxKind, RxMessage, SendRequest, WakeRequest};
pub use power::PowerRange;
pub use topics::{GatewayTarget, ALL_GATEWAYS};
