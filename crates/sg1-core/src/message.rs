//! Bus payload types
//!
//! Everything published by gateways and devices is CBOR-encoded with
//! `serde_cbor`. Channel keys inside payloads are byte strings; only topic
//! names carry the base64 form.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::key::ChannelKey;
use crate::{Result, Sg1CoreError};

/// How a message travels over the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryClass {
    /// Acknowledged delivery, worth waiting for
    Reliable,
    /// Fire-and-forget, stale data is worthless
    Realtime,
}

/// Which decoded frame produced an [`RxMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RxKind {
    /// `DECODED`
    Reliable,
    /// `DECODEDRT`
    Realtime,
    /// `DECODEDBEACON`
    Beacon,
}

/// A decoded radio packet as republished on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RxMessage {
    /// Frame class
    pub kind: RxKind,
    /// Application payload (empty for beacons)
    pub data: Bytes,
    /// Received signal strength, dBm
    pub rssi: i8,
    /// Estimated path loss, dB
    pub path_loss: i8,
    /// Sender's monotonic timestamp in microseconds
    pub timestamp: u64,
    /// Gateway that decoded the packet
    pub gateway: String,
    /// Sender node id
    pub node_id: u8,
    /// Raw receive header byte, reliable frames only
    pub rx_header: Option<u8>,
}

/// Ask a gateway to transmit on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Channel to encrypt with
    pub key: ChannelKey,
    /// Payload
    pub data: Bytes,
    /// Realtime or reliable framing
    pub class: DeliveryClass,
    /// Transmit power; the gateway picks one when absent
    pub power: Option<u8>,
}

/// Ask a gateway to keep a device's link open for a while
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeRequest {
    /// Channel to keep awake
    pub key: ChannelKey,
    /// How long the request stays valid, milliseconds
    pub valid_for_ms: u64,
}

/// Ask a gateway to pair a new node on a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRequest {
    /// Channel to pair on
    pub key: ChannelKey,
    /// Node id to assign
    pub node_id: u8,
}

/// Encode a bus payload
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_cbor::to_vec(value).map_err(|e| Sg1CoreError::Serialization(e.to_string()))
}

/// Decode a bus payload
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_cbor::from_slice(bytes).map_err(|e| Sg1CoreError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_roundtrip() {
        let req = SendRequest {
            key: ChannelKey::new([5; 32]),
            data: Bytes::from_static(b"lamp on"),
            class: DeliveryClass::Realtime,
            power: None,
        };
        let back: SendRequest = decode(&encode(&req).unwrap()).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let err = decode::<WakeRequest>(&[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, Sg1CoreError::Deserialization(_)));
    }
}
