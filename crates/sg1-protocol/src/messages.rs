//! Message type table and payload layouts
//!
//! All multi-byte fields are little-endian.
//!
//! | type | layout |
//! |------|--------|
//! | `NEWDATA` | `rssi:i8, hint:3, hint:3` |
//! | `SET_KEY` | `key:32` |
//! | `DECODE` | `mode:u8` (1 = normal, 2 = keep link open for a wake request) |
//! | `DECODED` | `path_loss:i8, rssi:i8, rx_iv:8, rx_header:u8, reserved:3, key:32, data` |
//! | `DECODEDRT` | `path_loss:i8, rssi:i8, rx_iv:8, key:32, data` |
//! | `DECODEDBEACON` | `path_loss:i8, rssi:i8, reserved:4, key:32` |
//! | `SEND`/`SENDRT` | `power:u8, reserved:3, data` |
//! | `CFG` | `profile:u8, channel:u16` |
//! | `TIME` | `unix_micros:i64` (empty payload asks the hardware for its clock) |
//! | `PAIR` | `node_id:u8` |
//! | `VERSION` | `"SG1", version:u8` |
//! | `BGNOISE` | `noise:i8` |
//!
//! The 8-byte `rx_iv` holds the sender's 56-bit monotonic timestamp in its
//! low seven bytes and the sender node id in the last byte.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sg1_core::{ChannelKey, DeliveryClass, Hint};
use std::fmt;

use crate::codec::{encode_frame, Nanoframe, MAX_FRAME_PAYLOAD};
use crate::error::{ProtocolError, Result};

/// Magic at the start of a VERSION payload
pub const VERSION_MAGIC: &[u8; 3] = b"SG1";

/// Header bytes in front of SEND/SENDRT data
pub const SEND_HEADER_LEN: usize = 4;

/// Largest SEND/SENDRT payload
pub const MAX_SEND_DATA: usize = MAX_FRAME_PAYLOAD - SEND_HEADER_LEN;

/// DECODE mode byte for an ordinary decode
pub const DECODE_NORMAL: u8 = 0x01;

/// DECODE mode byte when a wake request is outstanding for the key
pub const DECODE_WAKE: u8 = 0x02;

/// Message type ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Packet buffered, here are its hints
    NewData = 1,
    /// Select the active channel key
    SetKey = 2,
    /// Try to decode the buffered packet with the active key
    Decode = 3,
    /// Reliable packet decoded
    Decoded = 4,
    /// Operation failed
    Fail = 5,
    /// Transmit reliable
    Send = 6,
    /// Discard buffer and listen
    Rx = 7,
    /// Transmission finished
    Sent = 8,
    /// Hardware random bytes
    Rng = 9,
    /// RF profile and channel
    Cfg = 10,
    /// Wall clock
    Time = 11,
    /// Transmit power
    RfPower = 12,
    /// Realtime packet decoded
    DecodedRt = 13,
    /// Transmit realtime
    SendRt = 14,
    /// Pair a node
    Pair = 15,
    /// Firmware version announcement
    Version = 16,
    /// Beacon decoded
    DecodedBeacon = 18,
    /// Liveness probe
    Ping = 19,
    /// Background noise sample
    BgNoise = 20,
}

impl MessageType {
    /// Wire id
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Upper-case protocol name
    pub const fn name(self) -> &'static str {
        match self {
            MessageType::NewData => "NEWDATA",
            MessageType::SetKey => "SET_KEY",
            MessageType::Decode => "DECODE",
            MessageType::Decoded => "DECODED",
            MessageType::Fail => "FAIL",
            MessageType::Send => "SEND",
            MessageType::Rx => "RX",
            MessageType::Sent => "SENT",
            MessageType::Rng => "RNG",
            MessageType::Cfg => "CFG",
            MessageType::Time => "TIME",
            MessageType::RfPower => "RFPOWER",
            MessageType::DecodedRt => "DECODEDRT",
            MessageType::SendRt => "SENDRT",
            MessageType::Pair => "PAIR",
            MessageType::Version => "VERSION",
            MessageType::DecodedBeacon => "DECODEDBEACON",
            MessageType::Ping => "PING",
            MessageType::BgNoise => "BGNOISE",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(id: u8) -> Result<Self> {
        Ok(match id {
            1 => MessageType::NewData,
            2 => MessageType::SetKey,
            3 => MessageType::Decode,
            4 => MessageType::Decoded,
            5 => MessageType::Fail,
            6 => MessageType::Send,
            7 => MessageType::Rx,
            8 => MessageType::Sent,
            9 => MessageType::Rng,
            10 => MessageType::Cfg,
            11 => MessageType::Time,
            12 => MessageType::RfPower,
            13 => MessageType::DecodedRt,
            14 => MessageType::SendRt,
            15 => MessageType::Pair,
            16 => MessageType::Version,
            18 => MessageType::DecodedBeacon,
            19 => MessageType::Ping,
            20 => MessageType::BgNoise,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// GFSK radio profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum RfProfile {
    /// 600 baud
    Gfsk600 = 1,
    /// 1200 baud
    Gfsk1200 = 2,
    /// 4800 baud
    Gfsk4800 = 3,
    /// 10 kbaud
    Gfsk10k = 4,
    /// 38.4 kbaud
    Gfsk38k = 5,
    /// 100 kbaud
    Gfsk100k = 6,
    /// 250 kbaud
    Gfsk250k = 7,
}

impl RfProfile {
    const TABLE: [(RfProfile, u32); 7] = [
        (RfProfile::Gfsk600, 600),
        (RfProfile::Gfsk1200, 1200),
        (RfProfile::Gfsk4800, 4800),
        (RfProfile::Gfsk10k, 10_000),
        (RfProfile::Gfsk38k, 38_400),
        (RfProfile::Gfsk100k, 100_000),
        (RfProfile::Gfsk250k, 250_000),
    ];

    /// Accept either a profile number (1-7) or a data rate in baud
    pub fn parse(value: u32) -> Result<Self> {
        Self::TABLE
            .iter()
            .find(|(p, rate)| *p as u32 == value || *rate == value)
            .map(|(p, _)| *p)
            .ok_or(ProtocolError::InvalidRfProfile(value))
    }

    /// Wire id
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Nominal data rate in baud
    pub fn data_rate(self) -> u32 {
        Self::TABLE[self as usize - 1].1
    }
}

impl fmt::Display for RfProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GFSK {} baud", self.data_rate())
    }
}

impl Default for RfProfile {
    fn default() -> Self {
        RfProfile::Gfsk38k
    }
}

impl TryFrom<u32> for RfProfile {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<RfProfile> for u32 {
    fn from(profile: RfProfile) -> u32 {
        profile.data_rate()
    }
}

/// Sender timestamp and node id carried with every decoded packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxIv {
    /// 56-bit monotonic microseconds
    pub timestamp: u64,
    /// Sender node id
    pub node_id: u8,
}

impl RxIv {
    /// Split the 8 wire bytes
    pub fn from_wire(bytes: [u8; 8]) -> Self {
        let mut ts = bytes;
        ts[7] = 0;
        Self {
            timestamp: u64::from_le_bytes(ts),
            node_id: bytes[7],
        }
    }

    /// Wire form
    pub fn to_wire(self) -> [u8; 8] {
        let mut bytes = (self.timestamp & 0x00FF_FFFF_FFFF_FFFF).to_le_bytes();
        bytes[7] = self.node_id;
        bytes
    }
}

/// NEWDATA contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewData {
    /// Signal strength of the buffered packet
    pub rssi: i8,
    /// Hint slots, in wire order
    pub hints: [Hint; 2],
}

/// DECODED / DECODEDRT contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    /// Estimated path loss, dB
    pub path_loss: i8,
    /// Signal strength, dBm
    pub rssi: i8,
    /// Sender timestamp and node
    pub rx_iv: RxIv,
    /// Receive header, reliable packets only
    pub rx_header: Option<u8>,
    /// Key that decoded the packet
    pub key: ChannelKey,
    /// Plaintext
    pub data: Bytes,
}

/// DECODEDBEACON contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    /// Estimated path loss, dB
    pub path_loss: i8,
    /// Signal strength, dBm
    pub rssi: i8,
    /// Key that decoded the beacon
    pub key: ChannelKey,
}

/// Firmware identification from VERSION
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Firmware protocol version
    pub version: u8,
}

/// A parsed frame from the hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Packet waiting for a key
    NewData(NewData),
    /// Reliable packet decoded
    Decoded(DecodedPacket),
    /// Realtime packet decoded
    DecodedRt(DecodedPacket),
    /// Beacon decoded
    DecodedBeacon(Beacon),
    /// Firmware is up
    Version(VersionInfo),
    /// Noise floor sample
    BackgroundNoise(i8),
    /// Random bytes
    Rng(Bytes),
    /// Hardware clock, unix microseconds
    Time(i64),
    /// Failure report
    Fail(Bytes),
    /// Transmit done
    Sent(Bytes),
    /// Ping reply
    Ping(Bytes),
    /// A host-to-hardware type echoed back, kept for waiters
    Echo {
        /// Echoed type
        message_type: MessageType,
        /// Raw payload
        payload: Bytes,
    },
}

fn need(message_type: MessageType, payload: &[u8], len: usize) -> Result<()> {
    if payload.len() < len {
        return Err(ProtocolError::Truncated {
            message_type: message_type.name(),
            need: len,
            got: payload.len(),
        });
    }
    Ok(())
}

fn key_at(payload: &[u8], offset: usize) -> ChannelKey {
    let mut key = [0u8; 32];
    key.copy_from_slice(&payload[offset..offset + 32]);
    ChannelKey::new(key)
}

fn iv_at(payload: &[u8], offset: usize) -> RxIv {
    let mut iv = [0u8; 8];
    iv.copy_from_slice(&payload[offset..offset + 8]);
    RxIv::from_wire(iv)
}

impl InboundFrame {
    /// Interpret a raw frame
    pub fn parse(frame: &Nanoframe) -> Result<Self> {
        let message_type = MessageType::try_from(frame.frame_type)?;
        let p = &frame.payload;
        Ok(match message_type {
            MessageType::NewData => {
                need(message_type, p, 7)?;
                InboundFrame::NewData(NewData {
                    rssi: p[0] as i8,
                    hints: [
                        Hint::from_wire([p[1], p[2], p[3]]),
                        Hint::from_wire([p[4], p[5], p[6]]),
                    ],
                })
            }
            MessageType::Decoded => {
                need(message_type, p, 46)?;
                InboundFrame::Decoded(DecodedPacket {
                    path_loss: p[0] as i8,
                    rssi: p[1] as i8,
                    rx_iv: iv_at(p, 2),
                    rx_header: Some(p[10]),
                    key: key_at(p, 14),
                    data: frame.payload.slice(46..),
                })
            }
            MessageType::DecodedRt => {
                need(message_type, p, 42)?;
                InboundFrame::DecodedRt(DecodedPacket {
                    path_loss: p[0] as i8,
                    rssi: p[1] as i8,
                    rx_iv: iv_at(p, 2),
                    rx_header: None,
                    key: key_at(p, 10),
                    data: frame.payload.slice(42..),
                })
            }
            MessageType::DecodedBeacon => {
                need(message_type, p, 38)?;
                InboundFrame::DecodedBeacon(Beacon {
                    path_loss: p[0] as i8,
                    rssi: p[1] as i8,
                    key: key_at(p, 6),
                })
            }
            MessageType::Version => {
                need(message_type, p, 4)?;
                if &p[..3] != VERSION_MAGIC {
                    return Err(ProtocolError::BadMagic(p[..3].to_vec()));
                }
                InboundFrame::Version(VersionInfo { version: p[3] })
            }
            MessageType::BgNoise => {
                need(message_type, p, 1)?;
                InboundFrame::BackgroundNoise(p[0] as i8)
            }
            MessageType::Time => {
                need(message_type, p, 8)?;
                let mut micros = [0u8; 8];
                micros.copy_from_slice(&p[..8]);
                InboundFrame::Time(i64::from_le_bytes(micros))
            }
            MessageType::Rng => InboundFrame::Rng(frame.payload.clone()),
            MessageType::Fail => InboundFrame::Fail(frame.payload.clone()),
            MessageType::Sent => InboundFrame::Sent(frame.payload.clone()),
            MessageType::Ping => InboundFrame::Ping(frame.payload.clone()),
            MessageType::SetKey
            | MessageType::Decode
            | MessageType::Send
            | MessageType::Rx
            | MessageType::Cfg
            | MessageType::RfPower
            | MessageType::SendRt
            | MessageType::Pair => InboundFrame::Echo {
                message_type,
                payload: frame.payload.clone(),
            },
        })
    }
}

/// A command for the hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Make `key` the active key
    SetKey(ChannelKey),
    /// Decode the buffered packet with the active key
    Decode {
        /// Keep the link open for a pending wake request
        wake: bool,
    },
    /// Discard the buffer and listen
    Rx,
    /// Push the wall clock
    SetTime(i64),
    /// Ask for the hardware clock
    QueryTime,
    /// Configure the radio
    Configure {
        /// Modulation profile
        profile: RfProfile,
        /// Channel number
        channel: u16,
    },
    /// Transmit with the active key
    Send {
        /// Realtime or reliable framing
        class: DeliveryClass,
        /// Transmit power
        power: u8,
        /// Payload
        data: Bytes,
    },
    /// Pair a node on the active key
    Pair {
        /// Node id to assign
        node_id: u8,
    },
    /// Request random bytes
    Rng,
    /// Liveness probe
    Ping,
}

impl Command {
    /// Type id this command is sent with
    pub fn message_type(&self) -> MessageType {
        match self {
            Command::SetKey(_) => MessageType::SetKey,
            Command::Decode { .. } => MessageType::Decode,
            Command::Rx => MessageType::Rx,
            Command::SetTime(_) | Command::QueryTime => MessageType::Time,
            Command::Configure { .. } => MessageType::Cfg,
            Command::Send {
                class: DeliveryClass::Reliable,
                ..
            } => MessageType::Send,
            Command::Send {
                class: DeliveryClass::Realtime,
                ..
            } => MessageType::SendRt,
            Command::Pair { .. } => MessageType::Pair,
            Command::Rng => MessageType::Rng,
            Command::Ping => MessageType::Ping,
        }
    }

    /// Payload bytes, without framing
    pub fn payload(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Command::SetKey(key) => key.as_bytes().to_vec(),
            Command::Decode { wake } => vec![if *wake { DECODE_WAKE } else { DECODE_NORMAL }],
            Command::Rx | Command::QueryTime | Command::Rng | Command::Ping => Vec::new(),
            Command::SetTime(micros) => micros.to_le_bytes().to_vec(),
            Command::Configure { profile, channel } => {
                let mut p = vec![profile.id()];
                p.extend_from_slice(&channel.to_le_bytes());
                p
            }
            Command::Send { power, data, .. } => {
                if data.len() > MAX_SEND_DATA {
                    return Err(ProtocolError::PayloadTooLarge {
                        size: data.len(),
                        max: MAX_SEND_DATA,
                    });
                }
                let mut p = Vec::with_capacity(SEND_HEADER_LEN + data.len());
                p.extend_from_slice(&[*power, 0, 0, 0]);
                p.extend_from_slice(data);
                p
            }
            Command::Pair { node_id } => vec![*node_id],
        })
    }

    /// Framed bytes ready for the serial line
    pub fn encode(&self) -> Result<Bytes> {
        encode_frame(self.message_type().id(), &self.payload()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(t: MessageType, payload: Vec<u8>) -> Nanoframe {
        Nanoframe {
            frame_type: t.id(),
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn test_type_ids() {
        assert_eq!(MessageType::NewData.id(), 1);
        assert_eq!(MessageType::Version.id(), 16);
        assert_eq!(MessageType::DecodedBeacon.id(), 18);
        assert_eq!(MessageType::BgNoise.id(), 20);
        assert!(MessageType::try_from(17).is_err());
        for id in [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 18, 19, 20] {
            assert_eq!(MessageType::try_from(id).unwrap().id(), id);
        }
    }

    #[test]
    fn test_parse_newdata() {
        let f = frame(MessageType::NewData, vec![0xb0, 1, 2, 3, 0xff, 0xff, 0x0f]);
        match InboundFrame::parse(&f).unwrap() {
            InboundFrame::NewData(nd) => {
                assert_eq!(nd.rssi, -80);
                assert_eq!(nd.hints[0], Hint::new(0x030201));
                assert_eq!(nd.hints[1], Hint::new(0x0fffff));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_decoded_layout() {
        let key = ChannelKey::new([0xaa; 32]);
        let iv = RxIv {
            timestamp: 0x0011_2233_4455_66,
            node_id: 7,
        };
        let mut p = vec![100u8, (-60i8) as u8];
        p.extend_from_slice(&iv.to_wire());
        p.extend_from_slice(&[0x5c, 0, 0, 0]);
        p.extend_from_slice(key.as_bytes());
        p.extend_from_slice(b"hello");

        match InboundFrame::parse(&frame(MessageType::Decoded, p)).unwrap() {
            InboundFrame::Decoded(d) => {
                assert_eq!(d.path_loss, 100);
                assert_eq!(d.rssi, -60);
                assert_eq!(d.rx_iv, iv);
                assert_eq!(d.rx_header, Some(0x5c));
                assert_eq!(d.key, key);
                assert_eq!(d.data.as_ref(), b"hello");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_decoded_rt_has_no_header() {
        let key = ChannelKey::new([0x11; 32]);
        let mut p = vec![90u8, (-70i8) as u8];
        p.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 3]);
        p.extend_from_slice(key.as_bytes());
        p.extend_from_slice(b"rt");
        match InboundFrame::parse(&frame(MessageType::DecodedRt, p)).unwrap() {
            InboundFrame::DecodedRt(d) => {
                assert_eq!(d.rx_header, None);
                assert_eq!(d.rx_iv.timestamp, 1);
                assert_eq!(d.rx_iv.node_id, 3);
                assert_eq!(d.key, key);
                assert_eq!(d.data.as_ref(), b"rt");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_beacon() {
        let key = ChannelKey::new([0x22; 32]);
        let mut p = vec![80u8, (-50i8) as u8, 0, 0, 0, 0];
        p.extend_from_slice(key.as_bytes());
        match InboundFrame::parse(&frame(MessageType::DecodedBeacon, p)).unwrap() {
            InboundFrame::DecodedBeacon(b) => {
                assert_eq!(b.path_loss, 80);
                assert_eq!(b.key, key);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_payload() {
        let err = InboundFrame::parse(&frame(MessageType::Decoded, vec![0; 20])).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                message_type: "DECODED",
                need: 46,
                got: 20
            }
        );
    }

    #[test]
    fn test_version_magic() {
        let ok = frame(MessageType::Version, b"SG1\x03".to_vec());
        assert_eq!(
            InboundFrame::parse(&ok).unwrap(),
            InboundFrame::Version(VersionInfo { version: 3 })
        );
        let bad = frame(MessageType::Version, b"XG1\x03".to_vec());
        assert!(matches!(
            InboundFrame::parse(&bad),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn test_command_layouts() {
        let cfg = Command::Configure {
            profile: RfProfile::Gfsk38k,
            channel: 0x0103,
        };
        assert_eq!(cfg.payload().unwrap(), vec![5, 0x03, 0x01]);

        let time = Command::SetTime(-2);
        assert_eq!(time.payload().unwrap(), (-2i64).to_le_bytes().to_vec());

        let send = Command::Send {
            class: DeliveryClass::Realtime,
            power: 12,
            data: Bytes::from_static(b"go"),
        };
        assert_eq!(send.message_type(), MessageType::SendRt);
        assert_eq!(send.payload().unwrap(), vec![12, 0, 0, 0, b'g', b'o']);

        assert_eq!(
            Command::Decode { wake: true }.payload().unwrap(),
            vec![DECODE_WAKE]
        );
    }

    #[test]
    fn test_send_too_large() {
        let send = Command::Send {
            class: DeliveryClass::Reliable,
            power: 1,
            data: Bytes::from(vec![0u8; MAX_SEND_DATA + 1]),
        };
        assert!(send.encode().is_err());
    }

    #[test]
    fn test_rf_profile_parse() {
        assert_eq!(RfProfile::parse(38_400).unwrap(), RfProfile::Gfsk38k);
        assert_eq!(RfProfile::parse(7).unwrap(), RfProfile::Gfsk250k);
        assert_eq!(RfProfile::Gfsk600.data_rate(), 600);
        assert_eq!(
            RfProfile::parse(9600).unwrap_err(),
            ProtocolError::InvalidRfProfile(9600)
        );
    }
}
