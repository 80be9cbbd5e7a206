//! Nanoframe codec
//!
//! Frames on the serial line look like:
//!
//! ```text
//! 0x2A  LEN  TYPE  PAYLOAD[LEN-1]  0x2B
//! ```
//!
//! The firmware also prints human-readable debug text on the same line.
//! Printable ASCII outside a frame is collected into lines and surfaced as
//! [`CodecEvent::DebugLine`]. A missing end sentinel drops the partial frame
//! and the parser resynchronizes on the next start sentinel.
//!
//! The parser keeps unconsumed input internally, so it can be fed arbitrary
//! chunks and drained lazily with [`NanoframeParser::next_event`].

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{ProtocolError, Result};

/// Frame start sentinel
pub const FRAME_START: u8 = 0x2A;

/// Frame end sentinel
pub const FRAME_END: u8 = 0x2B;

/// Largest payload the one-byte length field can describe (LEN counts the type byte)
pub const MAX_FRAME_PAYLOAD: usize = u8::MAX as usize - 1;

/// Debug lines longer than this are flushed early
pub const MAX_DEBUG_LINE: usize = 512;

/// One frame off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nanoframe {
    /// Message type id
    pub frame_type: u8,
    /// Payload after the type byte
    pub payload: Bytes,
}

/// Output of the parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecEvent {
    /// A complete, sentinel-terminated frame
    Frame(Nanoframe),
    /// A line of firmware debug text, without the newline
    DebugLine(String),
}

/// Parser counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    /// Frames emitted
    pub frames: u64,
    /// Partial frames dropped for a bad length or end sentinel
    pub desyncs: u64,
    /// Non-printable bytes seen outside a frame
    pub discarded_bytes: u64,
    /// Debug lines emitted
    pub debug_lines: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitStart,
    ReadLen,
    ReadPayload { len: usize },
    AwaitEnd,
}

/// Incremental nanoframe parser
#[derive(Debug)]
pub struct NanoframeParser {
    state: State,
    input: BytesMut,
    frame: BytesMut,
    debug_line: Vec<u8>,
    stats: CodecStats,
}

impl Default for NanoframeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NanoframeParser {
    /// Parser waiting for a start sentinel
    pub fn new() -> Self {
        Self {
            state: State::AwaitStart,
            input: BytesMut::with_capacity(512),
            frame: BytesMut::with_capacity(MAX_FRAME_PAYLOAD + 1),
            debug_line: Vec::new(),
            stats: CodecStats::default(),
        }
    }

    /// Queue raw bytes from the serial line
    pub fn push(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
    }

    /// Queue bytes and drain every event they complete
    pub fn feed(&mut self, data: &[u8]) -> Events<'_> {
        self.push(data);
        Events { parser: self }
    }

    /// Consume queued input until the next event
    pub fn next_event(&mut self) -> Option<CodecEvent> {
        while self.input.has_remaining() {
            let byte = self.input.get_u8();
            if let Some(event) = self.step(byte) {
                return Some(event);
            }
        }
        None
    }

    /// Drop any partial frame or debug line and wait for a start sentinel.
    /// Queued input is kept.
    pub fn reset(&mut self) {
        self.state = State::AwaitStart;
        self.frame.clear();
        self.debug_line.clear();
    }

    /// Reset and also discard queued input, for a fresh connection
    pub fn clear(&mut self) {
        self.reset();
        self.input.clear();
    }

    /// Bytes queued but not yet examined
    pub fn pending(&self) -> usize {
        self.input.len()
    }

    /// Counters since creation
    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    fn step(&mut self, byte: u8) -> Option<CodecEvent> {
        match self.state {
            State::AwaitStart => self.await_start(byte),
            State::ReadLen => {
                if byte == 0 {
                    // LEN always covers the type byte.
                    debug!("Zero-length frame, resynchronizing");
                    self.stats.desyncs += 1;
                    self.state = State::AwaitStart;
                } else {
                    self.frame.clear();
                    self.state = State::ReadPayload {
                        len: usize::from(byte),
                    };
                }
                None
            }
            State::ReadPayload { len } => {
                self.frame.extend_from_slice(&[byte]);
                if self.frame.len() == len {
                    self.state = State::AwaitEnd;
                }
                None
            }
            State::AwaitEnd => {
                if byte == FRAME_END {
                    self.state = State::AwaitStart;
                    let mut body = self.frame.split().freeze();
                    let frame_type = body.get_u8();
                    self.stats.frames += 1;
                    trace!(frame_type, len = body.len(), "Frame");
                    Some(CodecEvent::Frame(Nanoframe {
                        frame_type,
                        payload: body,
                    }))
                } else {
                    debug!(got = byte, "Missing end sentinel, dropping partial frame");
                    self.stats.desyncs += 1;
                    self.frame.clear();
                    self.state = State::AwaitStart;
                    self.await_start(byte)
                }
            }
        }
    }

    fn await_start(&mut self, byte: u8) -> Option<CodecEvent> {
        match byte {
            FRAME_START => {
                self.state = State::ReadLen;
                None
            }
            b'\n' => self.flush_debug_line(),
            b'\r' | b'\t' | 0x20..=0x7e => {
                self.debug_line.push(byte);
                if self.debug_line.len() >= MAX_DEBUG_LINE {
                    self.flush_debug_line()
                } else {
                    None
                }
            }
            _ => {
                self.stats.discarded_bytes += 1;
                None
            }
        }
    }

    fn flush_debug_line(&mut self) -> Option<CodecEvent> {
        let line = String::from_utf8_lossy(&self.debug_line)
            .trim_end_matches('\r')
            .to_string();
        self.debug_line.clear();
        self.stats.debug_lines += 1;
        Some(CodecEvent::DebugLine(line))
    }
}

/// Iterator over events completed by queued input
pub struct Events<'a> {
    parser: &'a mut NanoframeParser,
}

impl Iterator for Events<'_> {
    type Item = CodecEvent;

    fn next(&mut self) -> Option<CodecEvent> {
        self.parser.next_event()
    }
}

/// Frame a payload for the wire
pub fn encode_frame(frame_type: u8, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }
    let mut out = BytesMut::with_capacity(payload.len() + 4);
    out.extend_from_slice(&[FRAME_START, payload.len() as u8 + 1, frame_type]);
    out.extend_from_slice(payload);
    out.extend_from_slice(&[FRAME_END]);
    Ok(out.freeze())
}
