//! Test utilities for driving a gateway without hardware
//!
//! [`MockInterface`] stands in for the serial link. It is cheaply cloneable so
//! a test can keep one copy to script incoming bytes and inspect what the
//! gateway wrote while the gateway owns the other. The frame builders produce
//! the hardware side of the conversation.
//!
//! # Example
//!
//! ```rust,ignore
//! use sg1_gateway::test_utils::{wait_for_state, TestFixture};
//! use sg1_gateway::ConnectionState;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_gateway_syncs() {
//!     let fixture = TestFixture::new("gw-1");
//!     let (handle, _task) = fixture.spawn().unwrap();
//!     assert!(wait_for_state(&handle, ConnectionState::Connected).await);
//! }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sg1_core::{ChannelKey, Hint, LocalBus};
use sg1_protocol::{
    CodecEvent, MessageType, Nanoframe, NanoframeParser, RxIv, FRAME_END, FRAME_START,
    MAX_FRAME_PAYLOAD, VERSION_MAGIC,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::{Gateway, GatewayHandle};
use crate::interface::{ConnectionState, RadioInterface};

#[derive(Default)]
struct MockState {
    connected: bool,
    incoming: VecDeque<Bytes>,
    on_connect: Vec<Bytes>,
    responders: HashMap<u8, Bytes>,
    written: Vec<u8>,
    written_frames: Vec<Nanoframe>,
    write_parser: NanoframeParser,
    open_attempts: usize,
    failing_opens: usize,
    fail_all_opens: bool,
    unhealthy_marks: usize,
    healthy_marks: usize,
}

/// Mock radio link for testing
#[derive(Clone, Default)]
pub struct MockInterface {
    state: Arc<Mutex<MockState>>,
    notify: Arc<Notify>,
}

impl MockInterface {
    /// Create a new mock interface
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every successful connect with a VERSION frame
    pub fn with_version_on_connect(self) -> Self {
        self.reply_on_connect(version_frame(1));
        self
    }

    /// Queue `bytes` as incoming data each time a connect succeeds
    pub fn reply_on_connect(&self, bytes: Bytes) {
        self.state.lock().on_connect.push(bytes);
    }

    /// Queue `reply` whenever a frame of `written_type` is written
    pub fn respond_to(&self, written_type: MessageType, reply: Bytes) {
        self.state.lock().responders.insert(written_type.id(), reply);
    }

    /// Queue incoming bytes
    pub fn push_incoming(&self, bytes: Bytes) {
        self.state.lock().incoming.push_back(bytes);
        self.notify.notify_one();
    }

    /// Fail the next `count` connects
    pub fn fail_opens(&self, count: usize) {
        self.state.lock().failing_opens = count;
    }

    /// Fail every connect
    pub fn fail_all_opens(&self) {
        self.state.lock().fail_all_opens = true;
    }

    /// Let connects succeed again
    pub fn allow_opens(&self) {
        let mut state = self.state.lock();
        state.fail_all_opens = false;
        state.failing_opens = 0;
    }

    /// Simulate the cable being pulled
    pub fn drop_link(&self) {
        self.state.lock().connected = false;
        self.notify.notify_one();
    }

    /// Connect calls so far, failed or not
    pub fn open_attempts(&self) -> usize {
        self.state.lock().open_attempts
    }

    /// Times the gateway gave up on syncing this link
    pub fn unhealthy_marks(&self) -> usize {
        self.state.lock().unhealthy_marks
    }

    /// Times the gateway completed a sync on this link
    pub fn healthy_marks(&self) -> usize {
        self.state.lock().healthy_marks
    }

    /// Whether the link is open
    pub fn is_open(&self) -> bool {
        self.state.lock().connected
    }

    /// Every byte written so far
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Frames found in the written bytes
    pub fn written_frames(&self) -> Vec<Nanoframe> {
        self.state.lock().written_frames.clone()
    }

    /// Written frames of one type
    pub fn written_of(&self, message_type: MessageType) -> Vec<Nanoframe> {
        self.written_frames()
            .into_iter()
            .filter(|f| f.frame_type == message_type.id())
            .collect()
    }

    /// Forget what has been written
    pub fn clear_written(&self) {
        let mut state = self.state.lock();
        state.written.clear();
        state.written_frames.clear();
    }
}

#[async_trait]
impl RadioInterface for MockInterface {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.open_attempts += 1;
        if state.fail_all_opens || state.failing_opens > 0 {
            state.failing_opens = state.failing_opens.saturating_sub(1);
            return Err(GatewayError::PortOpenFailed {
                port: "mock".to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        state.connected = true;
        let replies = state.on_connect.clone();
        state.incoming.extend(replies);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.connected = false;
        state.incoming.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.connected {
                    return Err(GatewayError::Disconnected);
                }
                if let Some(chunk) = state.incoming.pop_front() {
                    return Ok(Some(chunk));
                }
            }
            self.notify.notified().await;
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(GatewayError::Disconnected);
        }
        state.written.extend_from_slice(data);

        let mut replies = Vec::new();
        state.write_parser.push(data);
        while let Some(event) = state.write_parser.next_event() {
            if let CodecEvent::Frame(frame) = event {
                if let Some(reply) = state.responders.get(&frame.frame_type) {
                    replies.push(reply.clone());
                }
                state.written_frames.push(frame);
            }
        }
        let replied = !replies.is_empty();
        state.incoming.extend(replies);
        drop(state);

        if replied {
            self.notify.notify_one();
        }
        trace!(bytes = data.len(), "Mock write");
        Ok(())
    }

    fn name(&self) -> &str {
        "MockInterface"
    }

    fn mark_unhealthy(&mut self) {
        self.state.lock().unhealthy_marks += 1;
    }

    fn mark_healthy(&mut self) {
        self.state.lock().healthy_marks += 1;
    }
}

/// Test fixture: a bus, a mock link and a config to run a gateway with
pub struct TestFixture {
    /// In-process bus
    pub bus: Arc<LocalBus>,
    /// Mock link (answers connects with VERSION)
    pub interface: MockInterface,
    /// Gateway configuration
    pub config: GatewayConfig,
}

impl TestFixture {
    /// Fixture for a gateway named `id`
    pub fn new(id: &str) -> Self {
        Self {
            bus: Arc::new(LocalBus::new()),
            interface: MockInterface::new().with_version_on_connect(),
            config: GatewayConfig::new(id),
        }
    }

    /// Second gateway on the same bus
    pub fn sibling(&self, id: &str) -> Self {
        Self {
            bus: self.bus.clone(),
            interface: MockInterface::new().with_version_on_connect(),
            config: GatewayConfig::new(id),
        }
    }

    /// Spawn the gateway on the current runtime
    pub fn spawn(&self) -> Result<(GatewayHandle, JoinHandle<Result<()>>)> {
        let (gateway, handle) = Gateway::new(self.interface.clone(), &self.config, self.bus.clone())?;
        Ok((handle, tokio::spawn(gateway.run())))
    }
}

/// Poll until the gateway reports `state`. `false` after ~5 s or if it stopped.
pub async fn wait_for_state(handle: &GatewayHandle, state: ConnectionState) -> bool {
    for _ in 0..500 {
        match handle.state().await {
            Ok(current) if current == state => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Frame `payload` the way the hardware does (truncated to the frame limit)
pub fn frame(message_type: MessageType, payload: &[u8]) -> Bytes {
    let payload = &payload[..payload.len().min(MAX_FRAME_PAYLOAD)];
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(FRAME_START);
    out.push((payload.len() + 1) as u8);
    out.push(message_type.id());
    out.extend_from_slice(payload);
    out.push(FRAME_END);
    Bytes::from(out)
}

/// VERSION announcement
pub fn version_frame(version: u8) -> Bytes {
    let mut payload = VERSION_MAGIC.to_vec();
    payload.push(version);
    frame(MessageType::Version, &payload)
}

/// NEWDATA with two hint slots
pub fn newdata_frame(rssi: i8, hints: [Hint; 2]) -> Bytes {
    let mut payload = vec![rssi as u8];
    payload.extend_from_slice(&hints[0].to_wire());
    payload.extend_from_slice(&hints[1].to_wire());
    frame(MessageType::NewData, &payload)
}

/// Reliable DECODED packet
pub fn decoded_frame(key: &ChannelKey, rx_iv: RxIv, path_loss: i8, rssi: i8, data: &[u8]) -> Bytes {
    let mut payload = vec![path_loss as u8, rssi as u8];
    payload.extend_from_slice(&rx_iv.to_wire());
    payload.extend_from_slice(&[0; 4]);
    payload.extend_from_slice(key.as_bytes());
    payload.extend_from_slice(data);
    frame(MessageType::Decoded, &payload)
}

/// Realtime DECODEDRT packet
pub fn decoded_rt_frame(
    key: &ChannelKey,
    rx_iv: RxIv,
    path_loss: i8,
    rssi: i8,
    data: &[u8],
) -> Bytes {
    let mut payload = vec![path_loss as u8, rssi as u8];
    payload.extend_from_slice(&rx_iv.to_wire());
    payload.extend_from_slice(key.as_bytes());
    payload.extend_from_slice(data);
    frame(MessageType::DecodedRt, &payload)
}

/// DECODEDBEACON
pub fn beacon_frame(key: &ChannelKey, path_loss: i8, rssi: i8) -> Bytes {
    let mut payload = vec![path_loss as u8, rssi as u8, 0, 0, 0, 0];
    payload.extend_from_slice(key.as_bytes());
    frame(MessageType::DecodedBeacon, &payload)
}

/// BGNOISE sample
pub fn noise_frame(dbm: i8) -> Bytes {
    frame(MessageType::BgNoise, &[dbm as u8])
}

/// TIME reply
pub fn time_frame(unix_micros: i64) -> Bytes {
    frame(MessageType::Time, &unix_micros.to_le_bytes())
}
