//! Gateway - one radio link bridged onto the message bus
//!
//! The gateway owns a [`RadioInterface`] and runs a single event loop that
//! serializes everything touching the hardware: inbound frames, commands from
//! its [`GatewayHandle`], requests arriving from the bus and periodic
//! housekeeping. Only one command sequence is ever in flight on the wire.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Gateway                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌─────────────┐   ┌──────────────────┐   ┌──────────────────┐   │
//! │  │  Hardware   │◄─►│   event loop     │◄─►│   MessageBus     │   │
//! │  │  (serial)   │   │                  │   │  send/wake/pair  │   │
//! │  └─────────────┘   │ NanoframeParser  │   │  register/in/..  │   │
//! │                    │ HintIndex        │   └──────────────────┘   │
//! │  ┌─────────────┐   │ WaiterTable      │                          │
//! │  │GatewayHandle│──►│ ConnectThrottle  │                          │
//! │  └─────────────┘   └──────────────────┘                          │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Link lifecycle
//!
//! `Disconnected → Connecting → Syncing → Connected`. Opening the port is
//! followed by a burst of end sentinels and the wall clock; the link only
//! counts as connected once the hardware answers with `VERSION`. Any I/O
//! failure drops back to `Disconnected` and the next tick retries, spaced by
//! the reconnect interval.
//!
//! # Example
//!
//! ```rust,ignore
//! use sg1_core::LocalBus;
//! use sg1_gateway::{Gateway, GatewayConfig, SerialInterface};
//!
//! let config = GatewayConfig::new("gw-1");
//! let bus = Arc::new(LocalBus::new());
//! let (gateway, handle) = Gateway::new(SerialInterface::from_config(&config), &config, bus)?;
//! tokio::spawn(gateway.run());
//! ```

use bytes::Bytes;
use serde::Serialize;
use sg1_core::message::decode;
use sg1_core::{
    topics, unix_micros_now, ChannelKey, DeliveryClass, GatewayTarget, MessageBus,
    MessageBusExt, PairRequest, RxKind, RxMessage, SendRequest, Subscription, WakeRequest,
};
use sg1_protocol::{
    Beacon, CodecEvent, Command, DecodedPacket, InboundFrame, MessageType, Nanoframe,
    NanoframeParser, NewData, ProtocolError, RfProfile, VersionInfo, FRAME_END,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::{GatewayConfig, RfConfig};
use crate::error::{GatewayError, Result};
use crate::hint_index::HintIndex;
use crate::interface::{ConnectionState, RadioInterface};
use crate::reconnect::ConnectThrottle;
use crate::waiters::{ReplySender, WaiterTable};

/// End sentinels written after opening the port, flushing any half-received
/// frame out of the hardware's parser
const END_BURST: usize = 16;

/// Spacing between consecutive decode attempts for one NEWDATA
const DECODE_SPACING: Duration = Duration::from_millis(3);

/// Wake requests are garbage-collected once the table grows past this
const WAKE_GC_THRESHOLD: usize = 80;

/// How long an observed path loss is used for power selection
const PATH_LOSS_TTL: Duration = Duration::from_secs(60);

/// Callback for background noise samples: `(gateway id, dBm)`
pub type NoiseCallback = Arc<dyn Fn(&str, i8) + Send + Sync>;

/// Commands that can be sent to the gateway
#[derive(Debug)]
pub enum GatewayCommand {
    /// Transmit a payload
    Send(SendRequest),
    /// Keep a channel's link open
    Wake {
        /// Channel
        key: ChannelKey,
        /// How long the request stays valid
        valid_for: Duration,
    },
    /// A device announced its key
    Register(ChannelKey),
    /// Pair a node
    Pair(PairRequest),
    /// Write a command and wait for a reply frame of type `expect`
    Query {
        /// Command to write
        command: Command,
        /// Reply type
        expect: MessageType,
        /// Receives the reply payload, or `NotConnected`
        reply: ReplySender,
    },
    /// Change the radio profile
    SetRf(RfConfig),
    /// Replace the static key list
    SetKeyList(Vec<ChannelKey>),
    /// Get gateway statistics
    GetStats(oneshot::Sender<GatewayStats>),
    /// Get the link state
    GetState(oneshot::Sender<ConnectionState>),
    /// Shutdown the gateway
    Shutdown,
}

/// Gateway statistics
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    /// Frames received
    pub frames: u64,
    /// Debug lines received
    pub debug_lines: u64,
    /// Partial frames dropped by the parser
    pub desyncs: u64,
    /// DECODE commands issued
    pub decode_attempts: u64,
    /// NEWDATA with no candidate key
    pub unmatched: u64,
    /// Messages published to the bus
    pub published: u64,
    /// Payloads written for transmission
    pub sends: u64,
    /// Sends and bus requests dropped (queue full or link down)
    pub dropped_sends: u64,
    /// Successful syncs
    pub connects: u64,
    /// Failed port opens
    pub connect_failures: u64,
    /// Links lost after opening
    pub link_failures: u64,
}

#[derive(Debug, Clone, Copy)]
struct QueueTimeouts {
    realtime: Duration,
    reliable: Duration,
    waiter: Duration,
}

impl QueueTimeouts {
    fn for_class(&self, class: DeliveryClass) -> Duration {
        match class {
            DeliveryClass::Realtime => self.realtime,
            DeliveryClass::Reliable => self.reliable,
        }
    }
}

/// Handle for controlling a running [`Gateway`]
#[derive(Clone)]
pub struct GatewayHandle {
    id: Arc<str>,
    command_tx: mpsc::Sender<GatewayCommand>,
    timeouts: QueueTimeouts,
    dropped: Arc<AtomicU64>,
}

impl GatewayHandle {
    /// Gateway id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a command, waiting at most the class timeout for space
    async fn enqueue(&self, command: GatewayCommand, class: DeliveryClass) -> Result<()> {
        let wait = self.timeouts.for_class(class);
        match tokio::time::timeout(wait, self.command_tx.send(command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::ChannelClosed),
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match class {
                    DeliveryClass::Reliable => {
                        warn!(gateway = %self.id, waited = ?wait, "Command queue full, dropping reliable request")
                    }
                    DeliveryClass::Realtime => {
                        trace!(gateway = %self.id, "Command queue full, dropping realtime request")
                    }
                }
                Err(GatewayError::QueueFull)
            }
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> GatewayCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| GatewayError::ChannelClosed)?;
        rx.await.map_err(|_| GatewayError::ChannelClosed)
    }

    /// Transmit a payload. Fails with [`GatewayError::QueueFull`] if the
    /// queue stays full for the class timeout.
    pub async fn send(&self, request: SendRequest) -> Result<()> {
        let class = request.class;
        self.enqueue(GatewayCommand::Send(request), class).await
    }

    /// Keep `key`'s link open for `valid_for`
    pub async fn wake(&self, key: ChannelKey, valid_for: Duration) -> Result<()> {
        self.enqueue(GatewayCommand::Wake { key, valid_for }, DeliveryClass::Reliable)
            .await
    }

    /// Register a device key directly, bypassing the bus
    pub async fn register_key(&self, key: ChannelKey) -> Result<()> {
        self.enqueue(GatewayCommand::Register(key), DeliveryClass::Reliable)
            .await
    }

    /// Pair `node_id` on `key`
    pub async fn pair(&self, key: ChannelKey, node_id: u8) -> Result<()> {
        self.enqueue(
            GatewayCommand::Pair(PairRequest { key, node_id }),
            DeliveryClass::Reliable,
        )
        .await
    }

    /// Write `command` and wait for the next `expect` frame
    ///
    /// Fails with [`GatewayError::NotConnected`] if the link is not synced.
    /// Returns `None` if nothing arrives in time or the link drops while
    /// waiting.
    pub async fn query(&self, command: Command, expect: MessageType) -> Result<Option<Bytes>> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(
            GatewayCommand::Query {
                command,
                expect,
                reply,
            },
            DeliveryClass::Reliable,
        )
        .await?;
        match tokio::time::timeout(self.timeouts.waiter, rx).await {
            Ok(Ok(Ok(payload))) => Ok(Some(payload)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) | Err(_) => Ok(None),
        }
    }

    /// Random bytes from the hardware RNG
    pub async fn read_rng(&self) -> Result<Option<Bytes>> {
        self.query(Command::Rng, MessageType::Rng).await
    }

    /// Hardware clock in unix microseconds
    pub async fn hardware_time(&self) -> Result<Option<i64>> {
        let reply = self.query(Command::QueryTime, MessageType::Time).await?;
        Ok(reply.and_then(|payload| {
            let bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
            Some(i64::from_le_bytes(bytes))
        }))
    }

    /// Liveness probe. `true` if the hardware answered.
    pub async fn ping(&self) -> Result<bool> {
        Ok(self.query(Command::Ping, MessageType::Ping).await?.is_some())
    }

    /// Change the radio profile
    ///
    /// `profile` is a profile number (1-7) or a data rate in bits/s. An
    /// unknown value is rejected here, before anything is queued.
    pub async fn set_rf(&self, profile: u32, channel: u16) -> Result<()> {
        let profile = RfProfile::parse(profile)?;
        self.enqueue(
            GatewayCommand::SetRf(RfConfig { profile, channel }),
            DeliveryClass::Reliable,
        )
        .await
    }

    /// Replace the keys decoded regardless of registration
    pub async fn set_key_list(&self, keys: Vec<ChannelKey>) -> Result<()> {
        self.enqueue(GatewayCommand::SetKeyList(keys), DeliveryClass::Reliable)
            .await
    }

    /// Get gateway statistics
    pub async fn stats(&self) -> Result<GatewayStats> {
        self.request(GatewayCommand::GetStats).await
    }

    /// Current link state
    pub async fn state(&self) -> Result<ConnectionState> {
        self.request(GatewayCommand::GetState).await
    }

    /// Shutdown the gateway
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(GatewayCommand::Shutdown)
            .await
            .map_err(|_| GatewayError::ChannelClosed)
    }
}

impl std::fmt::Debug for GatewayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHandle").field("id", &self.id).finish()
    }
}

/// Turns bus deliveries into gateway commands
///
/// Bus handlers are synchronous. Realtime requests that find the command
/// queue full are dropped on the spot. Reliable requests go through one
/// bounded backlog drained by a single forwarder, which keeps them in order
/// and waits out the reliable timeout for each.
#[derive(Clone)]
struct BusRelay {
    handle: GatewayHandle,
    reliable_tx: mpsc::Sender<GatewayCommand>,
}

impl BusRelay {
    fn spawn(handle: GatewayHandle, runtime: &tokio::runtime::Handle, backlog: usize) -> Self {
        let (reliable_tx, mut reliable_rx) = mpsc::channel(backlog.max(1));
        let forward = handle.clone();
        runtime.spawn(async move {
            while let Some(command) = reliable_rx.recv().await {
                if let Err(GatewayError::ChannelClosed) =
                    forward.enqueue(command, DeliveryClass::Reliable).await
                {
                    break;
                }
            }
            trace!(gateway = %forward.id, "Bus forwarder stopped");
        });
        Self {
            handle,
            reliable_tx,
        }
    }

    fn on_send(&self, payload: &[u8]) {
        match decode::<SendRequest>(payload) {
            Ok(request) => {
                let class = request.class;
                self.dispatch(GatewayCommand::Send(request), class);
            }
            Err(e) => debug!(gateway = %self.handle.id, error = %e, "Ignoring malformed send request"),
        }
    }

    fn on_wake(&self, payload: &[u8]) {
        match decode::<WakeRequest>(payload) {
            Ok(request) => self.dispatch(
                GatewayCommand::Wake {
                    key: request.key,
                    valid_for: Duration::from_millis(request.valid_for_ms),
                },
                DeliveryClass::Reliable,
            ),
            Err(e) => debug!(gateway = %self.handle.id, error = %e, "Ignoring malformed wake request"),
        }
    }

    fn on_register(&self, payload: &[u8]) {
        match decode::<ChannelKey>(payload) {
            Ok(key) => self.dispatch(GatewayCommand::Register(key), DeliveryClass::Reliable),
            Err(e) => debug!(gateway = %self.handle.id, error = %e, "Ignoring malformed registration"),
        }
    }

    fn on_pair(&self, payload: &[u8]) {
        match decode::<PairRequest>(payload) {
            Ok(request) => self.dispatch(GatewayCommand::Pair(request), DeliveryClass::Reliable),
            Err(e) => debug!(gateway = %self.handle.id, error = %e, "Ignoring malformed pair request"),
        }
    }

    fn dispatch(&self, command: GatewayCommand, class: DeliveryClass) {
        let id = &self.handle.id;
        let sent = match class {
            DeliveryClass::Realtime => self.handle.command_tx.try_send(command),
            DeliveryClass::Reliable => self.reliable_tx.try_send(command),
        };
        match sent {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                trace!(gateway = %id, "Gateway stopped, dropping bus request")
            }
            Err(TrySendError::Full(_)) => {
                self.handle.dropped.fetch_add(1, Ordering::Relaxed);
                match class {
                    DeliveryClass::Realtime => {
                        trace!(gateway = %id, "Command queue full, dropping realtime bus request")
                    }
                    DeliveryClass::Reliable => {
                        warn!(gateway = %id, "Bus backlog full, dropping reliable request")
                    }
                }
            }
        }
    }
}

/// One radio link bridged onto the bus
pub struct Gateway<I: RadioInterface> {
    /// Gateway id
    id: String,
    /// Configuration
    config: GatewayConfig,
    /// Hardware link
    interface: I,
    /// Message bus
    bus: Arc<dyn MessageBus>,
    /// Handle cloned into bus subscriptions
    handle: GatewayHandle,
    /// Command receiver
    command_rx: mpsc::Receiver<GatewayCommand>,
    /// Nanoframe parser
    parser: NanoframeParser,
    /// Hint lookup
    index: HintIndex,
    /// Keys from configuration
    static_keys: BTreeSet<ChannelKey>,
    /// Announced keys and when they were last heard
    registrations: HashMap<ChannelKey, Instant>,
    /// Wake request expiry per key
    wake_requests: HashMap<ChannelKey, Instant>,
    /// Last observed path loss per key
    path_loss: HashMap<ChannelKey, (i8, Instant)>,
    /// Pending query replies
    waiters: WaiterTable,
    /// Link state
    state: ConnectionState,
    /// Give up on VERSION after this
    sync_deadline: Option<Instant>,
    /// Open attempt spacing
    throttle: ConnectThrottle,
    /// Radio profile applied on sync
    rf: RfConfig,
    /// Last discovery poll
    last_discovery: Option<Instant>,
    /// Background noise observer
    noise_callback: Option<NoiseCallback>,
    /// Statistics
    stats: GatewayStats,
    /// Sends dropped by handles
    dropped: Arc<AtomicU64>,
}

impl<I: RadioInterface> Gateway<I> {
    /// Create a gateway over `interface`
    ///
    /// Fails on an unusable id or a malformed static key.
    pub fn new(
        interface: I,
        config: &GatewayConfig,
        bus: Arc<dyn MessageBus>,
    ) -> Result<(Self, GatewayHandle)> {
        if config.id.is_empty() || config.id.contains('/') || config.id == topics::ALL_GATEWAYS {
            return Err(GatewayError::InvalidConfig(format!(
                "invalid gateway id {:?}",
                config.id
            )));
        }
        let static_keys: BTreeSet<ChannelKey> =
            config.static_channel_keys()?.into_iter().collect();

        let (command_tx, command_rx) = mpsc::channel(config.command_queue_size.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let handle = GatewayHandle {
            id: Arc::from(config.id.as_str()),
            command_tx,
            timeouts: QueueTimeouts {
                realtime: config.realtime_send_timeout,
                reliable: config.reliable_send_timeout,
                waiter: config.waiter_timeout,
            },
            dropped: dropped.clone(),
        };

        let mut index = HintIndex::new();
        index.replace(static_keys.iter().copied());

        let gateway = Self {
            id: config.id.clone(),
            config: config.clone(),
            interface,
            bus,
            handle: handle.clone(),
            command_rx,
            parser: NanoframeParser::new(),
            index,
            static_keys,
            registrations: HashMap::new(),
            wake_requests: HashMap::new(),
            path_loss: HashMap::new(),
            waiters: WaiterTable::new(),
            state: ConnectionState::Disconnected,
            sync_deadline: None,
            throttle: ConnectThrottle::new(config.reconnect_interval),
            rf: config.rf,
            last_discovery: None,
            noise_callback: None,
            stats: GatewayStats::default(),
            dropped,
        };

        Ok((gateway, handle))
    }

    /// Observe background noise samples
    pub fn with_noise_callback(mut self, callback: NoiseCallback) -> Self {
        self.noise_callback = Some(callback);
        self
    }

    /// Another handle to this gateway
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Run the gateway until [`GatewayHandle::shutdown`]
    ///
    /// Must be called inside a tokio runtime, which also carries the task
    /// forwarding reliable bus requests.
    pub async fn run(mut self) -> Result<()> {
        info!(gateway = %self.id, interface = self.interface.name(), "Starting gateway");
        let _subscriptions = self.subscribe_bus()?;

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reading = self.state.is_open();
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(GatewayCommand::Shutdown) | None => {
                        info!(gateway = %self.id, "Gateway shutdown requested");
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },

                chunk = self.interface.read_chunk(), if reading => {
                    self.handle_read(chunk).await;
                }

                _ = tick.tick() => self.on_tick().await,
            }
        }

        self.close().await;
        Ok(())
    }

    fn subscribe_bus(&self) -> Result<Vec<Subscription>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let relay = BusRelay::spawn(
            self.handle.clone(),
            &runtime,
            self.config.command_queue_size,
        );

        let mut subscriptions = Vec::new();
        for target in [GatewayTarget::Gateway(self.id.clone()), GatewayTarget::All] {
            let r = relay.clone();
            subscriptions.push(self.bus.subscribe(
                &topics::send(&target),
                Arc::new(move |_: &str, payload: &[u8]| r.on_send(payload)),
            )?);
            let r = relay.clone();
            subscriptions.push(self.bus.subscribe(
                &topics::wake(&target),
                Arc::new(move |_: &str, payload: &[u8]| r.on_wake(payload)),
            )?);
        }
        let r = relay.clone();
        subscriptions.push(self.bus.subscribe(
            topics::REGISTER_DEVICE,
            Arc::new(move |_: &str, payload: &[u8]| r.on_register(payload)),
        )?);
        subscriptions.push(self.bus.subscribe(
            &topics::pair(&self.id),
            Arc::new(move |_: &str, payload: &[u8]| relay.on_pair(payload)),
        )?);

        debug!(gateway = %self.id, count = subscriptions.len(), "Subscribed to bus");
        Ok(subscriptions)
    }

    // ===== Link management =====

    async fn try_connect(&mut self, now: Instant) {
        if !self.throttle.try_begin(now) {
            return;
        }

        self.state = ConnectionState::Connecting;
        if let Err(e) = self.interface.connect().await {
            self.stats.connect_failures += 1;
            warn!(
                gateway = %self.id,
                error = %e,
                code = e.error_code(),
                retry_in = ?self.config.reconnect_interval,
                "Failed to open radio link"
            );
            self.state = ConnectionState::Disconnected;
            return;
        }

        self.parser.clear();
        self.state = ConnectionState::Syncing;
        self.sync_deadline = Some(now + self.config.sync_timeout);

        let burst = [FRAME_END; END_BURST];
        if let Err(e) = self.interface.write_all(&burst).await {
            self.link_failed(e).await;
            return;
        }
        if self.write_command(&Command::SetTime(unix_micros_now())).await {
            debug!(gateway = %self.id, interface = self.interface.name(), "Link open, waiting for VERSION");
        }
    }

    async fn link_failed(&mut self, err: GatewayError) {
        let was_open = self.state.is_open();
        warn!(
            gateway = %self.id,
            error = %err,
            code = err.error_code(),
            state = %self.state,
            "Radio link failed"
        );
        self.stats.link_failures += 1;
        if let Err(e) = self.interface.disconnect().await {
            debug!(gateway = %self.id, error = %e, "Error closing radio link");
        }
        self.state = ConnectionState::Disconnected;
        self.sync_deadline = None;
        self.waiters.clear();
        if was_open {
            self.publish_cbor(topics::GATEWAY_DISCONNECTED, &self.id);
        }
    }

    async fn close(&mut self) {
        let was_open = self.state.is_open();
        if let Err(e) = self.interface.disconnect().await {
            warn!(gateway = %self.id, error = %e, "Error disconnecting radio link");
        }
        self.state = ConnectionState::Disconnected;
        self.waiters.clear();
        if was_open {
            self.publish_cbor(topics::GATEWAY_DISCONNECTED, &self.id);
        }
        info!(gateway = %self.id, "Gateway stopped");
    }

    /// Write pre-encoded bytes. On failure the link is torn down.
    async fn write_raw(&mut self, frame: &[u8]) -> bool {
        match self.interface.write_all(frame).await {
            Ok(()) => true,
            Err(e) => {
                self.link_failed(e).await;
                false
            }
        }
    }

    /// Encode and write. Encoding errors are logged and leave the link up.
    async fn write_command(&mut self, command: &Command) -> bool {
        match command.encode() {
            Ok(frame) => {
                trace!(gateway = %self.id, command = %command.message_type(), "Writing command");
                self.write_raw(&frame).await
            }
            Err(e) => {
                warn!(gateway = %self.id, command = %command.message_type(), error = %e, "Cannot encode command");
                false
            }
        }
    }

    // ===== Inbound =====

    async fn handle_read(&mut self, chunk: Result<Option<Bytes>>) {
        match chunk {
            Ok(Some(bytes)) => {
                self.parser.push(&bytes);
                while let Some(event) = self.parser.next_event() {
                    self.handle_event(event).await;
                    if !self.state.is_open() {
                        break;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => self.link_failed(e).await,
        }
    }

    async fn handle_event(&mut self, event: CodecEvent) {
        match event {
            CodecEvent::DebugLine(line) => {
                self.stats.debug_lines += 1;
                debug!(gateway = %self.id, "hw: {}", line);
                self.publish(&topics::hw_log(&self.id), line.as_bytes());
            }
            CodecEvent::Frame(frame) => self.handle_frame(frame).await,
        }
    }

    async fn handle_frame(&mut self, frame: Nanoframe) {
        self.stats.frames += 1;

        let taken = match MessageType::try_from(frame.frame_type) {
            Ok(frame_type) => {
                self.waiters
                    .deliver(frame_type, frame.payload.clone(), Instant::now())
            }
            Err(_) => false,
        };

        let inbound = match InboundFrame::parse(&frame) {
            Ok(inbound) => inbound,
            Err(ProtocolError::BadMagic(magic)) => {
                warn!(gateway = %self.id, magic = ?magic, "Hardware speaks a different protocol");
                if self.state == ConnectionState::Syncing {
                    self.interface.mark_unhealthy();
                    self.link_failed(ProtocolError::BadMagic(magic).into()).await;
                }
                return;
            }
            Err(e) => {
                debug!(gateway = %self.id, frame_type = frame.frame_type, error = %e, "Dropping malformed frame");
                return;
            }
        };

        if self.state == ConnectionState::Syncing && !matches!(inbound, InboundFrame::Version(_)) {
            trace!(gateway = %self.id, "Ignoring frame before VERSION");
            return;
        }

        match inbound {
            InboundFrame::Version(info) => self.on_version(info).await,
            InboundFrame::NewData(data) => self.on_new_data(data).await,
            InboundFrame::Decoded(packet) => self.publish_packet(RxKind::Reliable, packet),
            InboundFrame::DecodedRt(packet) => self.publish_packet(RxKind::Realtime, packet),
            InboundFrame::DecodedBeacon(beacon) => self.publish_beacon(beacon),
            InboundFrame::BackgroundNoise(dbm) => {
                trace!(gateway = %self.id, noise = dbm, "Background noise");
                if let Some(callback) = &self.noise_callback {
                    callback(&self.id, dbm);
                }
            }
            InboundFrame::Rng(bytes) => {
                if !taken {
                    self.publish(&topics::rng(&self.id), &bytes);
                }
            }
            InboundFrame::Time(micros) => {
                if !taken {
                    trace!(gateway = %self.id, hardware_time = micros, "Unsolicited TIME");
                }
            }
            InboundFrame::Fail(payload) => {
                debug!(gateway = %self.id, payload = ?payload.as_ref(), "Hardware reported failure")
            }
            InboundFrame::Sent(_) => trace!(gateway = %self.id, "Transmit complete"),
            InboundFrame::Ping(_) => trace!(gateway = %self.id, "Ping reply"),
            InboundFrame::Echo { message_type, .. } => {
                trace!(gateway = %self.id, frame = %message_type, "Echo")
            }
        }
    }

    async fn on_version(&mut self, info: VersionInfo) {
        let resync = self.state == ConnectionState::Connected;
        self.parser.reset();

        let configure = Command::Configure {
            profile: self.rf.profile,
            channel: self.rf.channel,
        };
        if !self.write_command(&Command::SetTime(unix_micros_now())).await
            || !self.write_command(&configure).await
        {
            return;
        }

        self.state = ConnectionState::Connected;
        self.sync_deadline = None;
        self.interface.mark_healthy();
        self.index.refresh(unix_micros_now());

        if resync {
            warn!(gateway = %self.id, version = info.version, "Hardware restarted, link re-synced");
        } else {
            self.stats.connects += 1;
            info!(
                gateway = %self.id,
                version = info.version,
                profile = %self.rf.profile,
                channel = self.rf.channel,
                "Gateway connected"
            );
        }
        self.publish_cbor(topics::GATEWAY_CONNECTED, &self.id);
    }

    async fn on_new_data(&mut self, data: NewData) {
        self.index.refresh(unix_micros_now());
        let candidates = self.index.candidates_for(&data.hints);
        trace!(
            gateway = %self.id,
            rssi = data.rssi,
            hint0 = %data.hints[0],
            hint1 = %data.hints[1],
            candidates = candidates.len(),
            "NEWDATA"
        );

        if candidates.is_empty() {
            self.stats.unmatched += 1;
            self.write_command(&Command::Rx).await;
            return;
        }

        let now = Instant::now();
        for (i, key) in candidates.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(DECODE_SPACING).await;
            }
            let wake = self.wake_pending(key, now);
            if !self.write_command(&Command::SetKey(*key)).await
                || !self.write_command(&Command::Decode { wake }).await
            {
                return;
            }
            self.stats.decode_attempts += 1;
        }
    }

    fn wake_pending(&self, key: &ChannelKey, now: Instant) -> bool {
        self.wake_requests.get(key).is_some_and(|until| *until > now)
    }

    fn publish_packet(&mut self, kind: RxKind, packet: DecodedPacket) {
        self.path_loss
            .insert(packet.key, (packet.path_loss, Instant::now()));

        let message = RxMessage {
            kind,
            data: packet.data,
            rssi: packet.rssi,
            path_loss: packet.path_loss,
            timestamp: packet.rx_iv.timestamp,
            gateway: self.id.clone(),
            node_id: packet.rx_iv.node_id,
            rx_header: packet.rx_header,
        };
        debug!(
            gateway = %self.id,
            key = %packet.key,
            kind = ?kind,
            bytes = message.data.len(),
            rssi = packet.rssi,
            path_loss = packet.path_loss,
            "Decoded packet"
        );
        if self.publish_cbor(&topics::inbound(kind, &packet.key), &message) {
            self.stats.published += 1;
        }
    }

    fn publish_beacon(&mut self, beacon: Beacon) {
        self.path_loss
            .insert(beacon.key, (beacon.path_loss, Instant::now()));

        let message = RxMessage {
            kind: RxKind::Beacon,
            data: Bytes::new(),
            rssi: beacon.rssi,
            path_loss: beacon.path_loss,
            timestamp: 0,
            gateway: self.id.clone(),
            node_id: 0,
            rx_header: None,
        };
        debug!(gateway = %self.id, key = %beacon.key, rssi = beacon.rssi, "Beacon");
        if self.publish_cbor(&topics::inbound(RxKind::Beacon, &beacon.key), &message) {
            self.stats.published += 1;
        }
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        match self.bus.publish(topic, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(gateway = %self.id, topic, error = %e, "Failed to publish");
                false
            }
        }
    }

    fn publish_cbor<T: Serialize>(&self, topic: &str, value: &T) -> bool {
        match self.bus.publish_cbor(topic, value) {
            Ok(()) => true,
            Err(e) => {
                warn!(gateway = %self.id, topic, error = %e, "Failed to publish");
                false
            }
        }
    }

    // ===== Housekeeping =====

    async fn on_tick(&mut self) {
        let now = Instant::now();

        let pruned = self.waiters.prune(now);
        if pruned > 0 {
            trace!(gateway = %self.id, pruned, "Expired reply waiters");
        }
        self.path_loss
            .retain(|_, (_, seen)| now.saturating_duration_since(*seen) < PATH_LOSS_TTL);
        self.run_discovery(now);

        match self.state {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.try_connect(now).await
            }
            ConnectionState::Syncing => {
                if self.sync_deadline.is_some_and(|deadline| now >= deadline) {
                    let duration_ms = self.config.sync_timeout.as_millis() as u64;
                    self.interface.mark_unhealthy();
                    self.link_failed(GatewayError::SyncTimeout { duration_ms })
                        .await;
                }
            }
            ConnectionState::Connected => {
                self.index.refresh(unix_micros_now());
                if self.write_command(&Command::SetTime(unix_micros_now())).await {
                    self.write_command(&Command::Rx).await;
                }
            }
        }
    }

    fn run_discovery(&mut self, now: Instant) {
        if self
            .last_discovery
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.discovery_interval)
        {
            return;
        }
        self.last_discovery = Some(now);

        let ttl = self.config.registration_ttl;
        let expired: Vec<ChannelKey> = self
            .registrations
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > ttl)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            self.registrations.remove(&key);
            if !self.static_keys.contains(&key) {
                self.index.remove(&key);
            }
            debug!(gateway = %self.id, key = %key, "Registration expired");
        }

        self.publish(topics::DISCOVER_DEVICES, &[]);
    }

    // ===== Commands =====

    async fn handle_command(&mut self, command: GatewayCommand) {
        match command {
            GatewayCommand::Send(request) => self.on_send(request).await,
            GatewayCommand::Wake { key, valid_for } => self.on_wake(key, valid_for),
            GatewayCommand::Register(key) => self.on_register(key),
            GatewayCommand::Pair(request) => self.on_pair(request).await,
            GatewayCommand::Query {
                command,
                expect,
                reply,
            } => self.on_query(command, expect, reply).await,
            GatewayCommand::SetRf(rf) => {
                info!(gateway = %self.id, profile = %rf.profile, channel = rf.channel, "Radio profile changed");
                self.rf = rf;
                if self.state == ConnectionState::Connected {
                    self.write_command(&Command::Configure {
                        profile: rf.profile,
                        channel: rf.channel,
                    })
                    .await;
                }
            }
            GatewayCommand::SetKeyList(keys) => {
                self.static_keys = keys.into_iter().collect();
                self.rebuild_index();
                info!(gateway = %self.id, keys = self.static_keys.len(), "Static key list replaced");
            }
            GatewayCommand::GetStats(tx) => {
                let _ = tx.send(self.snapshot_stats());
            }
            GatewayCommand::GetState(tx) => {
                let _ = tx.send(self.state);
            }
            GatewayCommand::Shutdown => {}
        }
    }

    async fn on_send(&mut self, request: SendRequest) {
        if self.state != ConnectionState::Connected {
            self.stats.dropped_sends += 1;
            debug!(gateway = %self.id, key = %request.key, "Dropping send while not connected");
            return;
        }

        let power = match request.power {
            Some(power) => self.config.power.clamp(i16::from(power)),
            None => self.power_for(&request.key, Instant::now()),
        };
        let bytes = request.data.len();
        let frame = match (Command::Send {
            class: request.class,
            power,
            data: request.data,
        })
        .encode()
        {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.dropped_sends += 1;
                warn!(gateway = %self.id, key = %request.key, error = %e, "Cannot send payload");
                return;
            }
        };

        if self.write_command(&Command::SetKey(request.key)).await && self.write_raw(&frame).await {
            self.stats.sends += 1;
            debug!(
                gateway = %self.id,
                key = %request.key,
                class = ?request.class,
                power,
                bytes,
                "Sent payload"
            );
        }
    }

    /// Power for `key` from recent path loss, or the conservative default
    fn power_for(&self, key: &ChannelKey, now: Instant) -> u8 {
        match self.path_loss.get(key) {
            Some((path_loss, seen)) if now.saturating_duration_since(*seen) < PATH_LOSS_TTL => {
                self.config.power.for_path_loss(*path_loss)
            }
            _ => self.config.power.conservative(),
        }
    }

    fn on_wake(&mut self, key: ChannelKey, valid_for: Duration) {
        let now = Instant::now();
        self.wake_requests.insert(key, now + valid_for);
        if self.wake_requests.len() > WAKE_GC_THRESHOLD {
            self.wake_requests.retain(|_, until| *until > now);
        }
        debug!(gateway = %self.id, key = %key, valid_for = ?valid_for, "Wake request");
    }

    fn on_register(&mut self, key: ChannelKey) {
        let known = self.registrations.insert(key, Instant::now()).is_some();
        if !known && !self.static_keys.contains(&key) {
            self.index.insert(key);
            self.index.refresh(unix_micros_now());
            debug!(gateway = %self.id, key = %key, "Device registered");
        }
    }

    async fn on_pair(&mut self, request: PairRequest) {
        if self.state != ConnectionState::Connected {
            debug!(gateway = %self.id, key = %request.key, "Dropping pair request while not connected");
            return;
        }
        if self.write_command(&Command::SetKey(request.key)).await
            && self
                .write_command(&Command::Pair {
                    node_id: request.node_id,
                })
                .await
        {
            info!(gateway = %self.id, key = %request.key, node_id = request.node_id, "Pairing");
        }
    }

    async fn on_query(&mut self, command: Command, expect: MessageType, reply: ReplySender) {
        if self.state != ConnectionState::Connected {
            trace!(gateway = %self.id, command = %command.message_type(), "Query while not connected");
            let _ = reply.send(Err(GatewayError::NotConnected(self.id.clone())));
            return;
        }
        let deadline = Instant::now() + self.config.waiter_timeout;
        self.waiters.register(expect, reply, deadline);
        self.write_command(&command).await;
    }

    fn rebuild_index(&mut self) {
        let keys: Vec<ChannelKey> = self
            .static_keys
            .iter()
            .chain(self.registrations.keys())
            .copied()
            .collect();
        self.index.replace(keys);
        self.index.refresh(unix_micros_now());
    }

    fn snapshot_stats(&self) -> GatewayStats {
        let mut stats = self.stats.clone();
        stats.desyncs = self.parser.stats().desyncs;
        stats.dropped_sends += self.dropped.load(Ordering::Relaxed);
        stats
    }
}
