//! SG1 Protocol - host/hardware link format
//!
//! The gateway hardware talks over a byte stream using small sentinel-framed
//! messages ("nanoframes"), interleaved with free-form debug text.
//!
//! - [`codec`] - incremental frame parser and encoder
//! - [`messages`] - the message type table and typed payloads
//!
//! # Example
//!
//! ```rust
//! use sg1_protocol::{CodecEvent, Command, InboundFrame, NanoframeParser};
//!
//! let wire = Command::Ping.encode().unwrap();
//! let mut parser = NanoframeParser::new();
//! for event in parser.feed(&wire) {
//!     if let CodecEvent::Frame(frame) = event {
//!         assert!(matches!(InboundFrame::parse(&frame), Ok(InboundFrame::Ping(_))));
//!     }
//! }
//! ```

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{
    encode_frame, CodecEvent, CodecStats, Nanoframe, NanoframeParser, FRAME_END, FRAME_START,
    MAX_FRAME_PAYLOAD,
};
pub use error::{ProtocolError, Result};
pub use messages::{
    Beacon, Command, DecodedPacket, InboundFrame, MessageType, NewData, RfProfile, RxIv,
    VersionInfo, MAX_SEND_DATA, VERSION_MAGIC,
};
