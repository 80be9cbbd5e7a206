//! Channel keys
//!
//! A [`ChannelKey`] is the 32-byte secret that identifies one logical
//! endpoint. It never leaves the process in clear text except in hardware
//! commands: bus topics carry its URL-safe base64 form and log output only
//! ever shows a fingerprint derived from the key's fixed hint, which is
//! already public on the air.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::hint::fixed_hint;
use crate::{Result, Sg1CoreError};

/// Length of a channel key in bytes
pub const CHANNEL_KEY_LEN: usize = 32;

/// A 32-byte channel secret
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey([u8; CHANNEL_KEY_LEN]);

impl ChannelKey {
    /// Wrap raw key bytes
    pub const fn new(bytes: [u8; CHANNEL_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; CHANNEL_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build a key from a slice, rejecting anything but 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; CHANNEL_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Sg1CoreError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(array))
    }

    /// Parse base64 text. Accepts URL-safe and standard alphabets, with or
    /// without padding.
    pub fn from_b64(text: &str) -> Result<Self> {
        let trimmed = text.trim().trim_end_matches('=');
        let bytes = URL_SAFE_NO_PAD
            .decode(trimmed)
            .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
            .map_err(|e| Sg1CoreError::InvalidKeyEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Opaque form used in bus topics
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Raw key bytes, for hardware commands only
    pub fn as_bytes(&self) -> &[u8; CHANNEL_KEY_LEN] {
        &self.0
    }

    /// Short non-secret identifier for logs
    pub fn fingerprint(&self) -> String {
        format!("{:05x}", fixed_hint(self).value())
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelKey").field(&self.fingerprint()).finish()
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{}", self.fingerprint())
    }
}

impl Serialize for ChannelKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for ChannelKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_bytes(ChannelKeyVisitor)
    }
}

struct ChannelKeyVisitor;

impl<'de> Visitor<'de> for ChannelKeyVisitor {
    type Value = ChannelKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("32 key bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<ChannelKey, E> {
        ChannelKey::from_slice(v).map_err(E::custom)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<ChannelKey, A::Error> {
        let mut bytes = Vec::with_capacity(CHANNEL_KEY_LEN);
        while let Some(b) = seq.next_element::<u8>()? {
            bytes.push(b);
        }
        ChannelKey::from_slice(&bytes).map_err(de::Error::custom)
    }
}
