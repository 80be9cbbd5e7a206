//! Device - the bus-side endpoint for one channel key
//!
//! A device never touches hardware. It announces its key so gateways start
//! decoding for it, listens for decoded traffic from every gateway, drops the
//! copies that several gateways republish, and remembers which gateway heard
//! it best so outbound requests go to that one.

use bytes::Bytes;
use parking_lot::Mutex;
use sg1_core::message::decode;
use sg1_core::{
    topics, ChannelKey, DeliveryClass, GatewayTarget, MessageBus, MessageBusExt, PairRequest,
    RxKind, RxMessage, SendRequest, Subscription, WakeRequest,
};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::DeviceConfig;
use crate::error::Result;
use crate::replay::{ReplayStats, ReplayWindow};

/// A sighting younger than this is only replaced by a stronger one
const OBSERVATION_REFRESH: Duration = Duration::from_secs(1);

/// Traffic delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Reliable packet
    Message(RxMessage),
    /// Realtime packet
    RealtimeMessage(RxMessage),
    /// Beacon
    Beacon(RxMessage),
}

impl DeviceEvent {
    /// The underlying message
    pub fn message(&self) -> &RxMessage {
        match self {
            DeviceEvent::Message(m) | DeviceEvent::RealtimeMessage(m) | DeviceEvent::Beacon(m) => m,
        }
    }
}

/// Best recent gateway for this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayObservation {
    /// Gateway id
    pub gateway: String,
    /// When the packet was heard
    pub seen_at: Instant,
    /// Signal strength, dBm
    pub rssi: i8,
    /// Path loss, dB
    pub path_loss: i8,
}

struct DeviceState {
    replay: ReplayWindow,
    observation: Option<GatewayObservation>,
}

struct DeviceInner {
    config: DeviceConfig,
    bus: Arc<dyn MessageBus>,
    state: Mutex<DeviceState>,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceInner {
    fn announce(&self) -> Result<()> {
        self.bus
            .publish_cbor(topics::REGISTER_DEVICE, &self.config.key)?;
        trace!(key = %self.config.key, "Announced device");
        Ok(())
    }

    fn on_inbound(&self, kind: RxKind, payload: &[u8]) {
        match decode::<RxMessage>(payload) {
            Ok(message) if message.kind == kind => {
                self.receive(message, Instant::now());
            }
            Ok(message) => {
                debug!(key = %self.config.key, expected = ?kind, got = ?message.kind, "Message kind does not match topic")
            }
            Err(e) => debug!(key = %self.config.key, error = %e, "Ignoring malformed message"),
        }
    }

    fn receive(&self, message: RxMessage, now: Instant) -> bool {
        {
            let mut state = self.state.lock();
            observe(&mut state.observation, &message, now);
            if message.kind != RxKind::Beacon && !state.replay.validate(message.timestamp, now) {
                trace!(
                    key = %self.config.key,
                    gateway = %message.gateway,
                    timestamp = message.timestamp,
                    "Dropping duplicate"
                );
                return false;
            }
        }

        let event = match message.kind {
            RxKind::Reliable => DeviceEvent::Message(message),
            RxKind::Realtime => DeviceEvent::RealtimeMessage(message),
            RxKind::Beacon => DeviceEvent::Beacon(message),
        };
        if self.events_tx.send(event).is_err() {
            trace!(key = %self.config.key, "Event receiver dropped");
        }
        true
    }
}

/// Keep the strongest recent sighting
fn observe(current: &mut Option<GatewayObservation>, message: &RxMessage, now: Instant) {
    let replace = match current {
        None => true,
        Some(seen) => {
            now.saturating_duration_since(seen.seen_at) > OBSERVATION_REFRESH
                || message.rssi > seen.rssi
        }
    };
    if replace {
        *current = Some(GatewayObservation {
            gateway: message.gateway.clone(),
            seen_at: now,
            rssi: message.rssi,
            path_loss: message.path_loss,
        });
    }
}

/// Bus endpoint for one channel key
pub struct Device {
    inner: Arc<DeviceInner>,
    _subscriptions: Vec<Subscription>,
}

impl Device {
    /// Subscribe to the key's traffic and announce it
    ///
    /// Events arrive on the returned receiver. Dropping the device stops
    /// delivery.
    pub fn new(
        config: DeviceConfig,
        bus: Arc<dyn MessageBus>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeviceEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(DeviceInner {
            state: Mutex::new(DeviceState {
                replay: ReplayWindow::from_config(&config.replay),
                observation: None,
            }),
            config,
            bus,
            events_tx,
        });

        let key = inner.config.key;
        let mut subscriptions = Vec::new();
        for kind in [RxKind::Reliable, RxKind::Realtime, RxKind::Beacon] {
            let weak: Weak<DeviceInner> = Arc::downgrade(&inner);
            subscriptions.push(inner.bus.subscribe(
                &topics::inbound(kind, &key),
                Arc::new(move |_: &str, payload: &[u8]| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_inbound(kind, payload);
                    }
                }),
            )?);
        }
        let weak = Arc::downgrade(&inner);
        subscriptions.push(inner.bus.subscribe(
            topics::DISCOVER_DEVICES,
            Arc::new(move |_: &str, _: &[u8]| {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = inner.announce() {
                        warn!(key = %inner.config.key, error = %e, "Failed to answer discovery");
                    }
                }
            }),
        )?);

        inner.announce()?;
        info!(key = %key, "Device online");

        Ok((
            Self {
                inner,
                _subscriptions: subscriptions,
            },
            events_rx,
        ))
    }

    /// Channel key
    pub fn key(&self) -> ChannelKey {
        self.inner.config.key
    }

    /// Configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Publish the key to every gateway
    pub fn announce(&self) -> Result<()> {
        self.inner.announce()
    }

    /// Feed a received message through observation and replay checks.
    /// Returns `true` if it was delivered.
    pub fn receive(&self, message: RxMessage, now: Instant) -> bool {
        self.inner.receive(message, now)
    }

    /// Best gateway seen recently
    pub fn observation(&self) -> Option<GatewayObservation> {
        self.inner.state.lock().observation.clone()
    }

    /// Replay window counters
    pub fn replay_stats(&self) -> ReplayStats {
        self.inner.state.lock().replay.stats()
    }

    /// Where to send and at what power
    ///
    /// With a fresh observation the request goes to that gateway at the
    /// power its path loss calls for; otherwise to every gateway at maximum
    /// power. An explicit `power` is only clamped.
    pub fn route(&self, power: Option<u8>, now: Instant) -> (GatewayTarget, u8) {
        let range = self.inner.config.power;
        let ttl = self.inner.config.observation_ttl;
        let fresh = self
            .observation()
            .filter(|o| now.saturating_duration_since(o.seen_at) < ttl);
        let power = |path_loss: Option<i8>| match (power, path_loss) {
            (Some(power), _) => range.clamp(i16::from(power)),
            (None, Some(path_loss)) => range.for_path_loss(path_loss),
            (None, None) => range.conservative(),
        };
        match fresh {
            Some(seen) => (
                GatewayTarget::Gateway(seen.gateway),
                power(Some(seen.path_loss)),
            ),
            None => (GatewayTarget::All, power(None)),
        }
    }

    /// Send `data` on this key
    pub fn send_message(
        &self,
        data: Bytes,
        class: DeliveryClass,
        power: Option<u8>,
    ) -> Result<GatewayTarget> {
        self.send_message_at(data, class, power, Instant::now())
    }

    /// [`Device::send_message`] with an explicit clock
    pub fn send_message_at(
        &self,
        data: Bytes,
        class: DeliveryClass,
        power: Option<u8>,
        now: Instant,
    ) -> Result<GatewayTarget> {
        let (target, power) = self.route(power, now);
        let request = SendRequest {
            key: self.key(),
            data,
            class,
            power: Some(power),
        };
        self.inner
            .bus
            .publish_cbor(&topics::send(&target), &request)?;
        debug!(key = %request.key, target = %target, power, class = ?class, "Send requested");
        Ok(target)
    }

    /// Ask gateways to keep this key's link open
    pub fn send_wake_request(&self) -> Result<GatewayTarget> {
        let (target, _) = self.route(None, Instant::now());
        let request = WakeRequest {
            key: self.key(),
            valid_for_ms: self.inner.config.wake_duration.as_millis() as u64,
        };
        self.inner
            .bus
            .publish_cbor(&topics::wake(&target), &request)?;
        debug!(key = %request.key, target = %target, "Wake requested");
        Ok(target)
    }

    /// Pair this key's node through `gateway`
    pub fn pair(&self, gateway: &str) -> Result<()> {
        let request = PairRequest {
            key: self.key(),
            node_id: self.inner.config.node_id,
        };
        self.inner
            .bus
            .publish_cbor(&topics::pair(gateway), &request)?;
        info!(key = %request.key, gateway, node_id = request.node_id, "Pair requested");
        Ok(())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("key", &self.inner.config.key)
            .field("node_id", &self.inner.config.node_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg1_core::LocalBus;

    fn message(kind: RxKind, gateway: &str, rssi: i8, path_loss: i8, timestamp: u64) -> RxMessage {
        RxMessage {
            kind,
            data: Bytes::from_static(b"payload"),
            rssi,
            path_loss,
            timestamp,
            gateway: gateway.to_string(),
            node_id: 1,
            rx_header: None,
        }
    }

    fn device(bus: &LocalBus) -> (Device, mpsc::UnboundedReceiver<DeviceEvent>) {
        let config = DeviceConfig::new(ChannelKey::new([8; 32]));
        Device::new(config, Arc::new(bus.clone())).unwrap()
    }

    fn capture(bus: &LocalBus, topic: &str) -> (Arc<Mutex<Vec<Vec<u8>>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus
            .subscribe(
                topic,
                Arc::new(move |_: &str, payload: &[u8]| sink.lock().push(payload.to_vec())),
            )
            .unwrap();
        (seen, sub)
    }

    #[test]
    fn test_announces_on_create_and_discovery() {
        let bus = LocalBus::new();
        let (seen, _sub) = capture(&bus, topics::REGISTER_DEVICE);
        let (device, _rx) = device(&bus);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(decode::<ChannelKey>(&seen.lock()[0]).unwrap(), device.key());

        bus.publish(topics::DISCOVER_DEVICES, &[]).unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_copies_from_several_gateways_delivered_once() {
        let bus = LocalBus::new();
        let (device, mut rx) = device(&bus);
        let topic = topics::inbound(RxKind::Reliable, &device.key());

        for gateway in ["gw-a", "gw-b"] {
            let payload = sg1_core::message::encode(&message(RxKind::Reliable, gateway, -70, 90, 42)).unwrap();
            bus.publish(&topic, &payload).unwrap();
        }

        assert!(matches!(rx.try_recv(), Ok(DeviceEvent::Message(m)) if m.timestamp == 42));
        assert!(rx.try_recv().is_err());
        assert_eq!(device.replay_stats().rejected, 1);
    }

    #[test]
    fn test_beacons_skip_replay_check() {
        let bus = LocalBus::new();
        let (device, mut rx) = device(&bus);
        let now = Instant::now();

        assert!(device.receive(message(RxKind::Beacon, "gw-a", -70, 90, 0), now));
        assert!(device.receive(message(RxKind::Beacon, "gw-a", -70, 90, 0), now));
        assert!(matches!(rx.try_recv(), Ok(DeviceEvent::Beacon(_))));
        assert!(matches!(rx.try_recv(), Ok(DeviceEvent::Beacon(_))));
    }

    #[test]
    fn test_observation_keeps_strongest_recent_gateway() {
        let bus = LocalBus::new();
        let (device, _rx) = device(&bus);
        let t0 = Instant::now();

        device.receive(message(RxKind::Realtime, "gw-a", -70, 100, 1), t0);
        device.receive(message(RxKind::Realtime, "gw-b", -60, 90, 1), t0 + Duration::from_millis(100));
        assert_eq!(device.observation().unwrap().gateway, "gw-b");

        // weaker and recent: ignored, even as a duplicate
        device.receive(message(RxKind::Realtime, "gw-a", -80, 110, 2), t0 + Duration::from_millis(200));
        assert_eq!(device.observation().unwrap().rssi, -60);

        // weaker but the old sighting is stale
        let late = t0 + Duration::from_millis(1500);
        device.receive(message(RxKind::Realtime, "gw-a", -90, 120, 3), late);
        let seen = device.observation().unwrap();
        assert_eq!(seen.gateway, "gw-a");
        assert_eq!(seen.seen_at, late);
    }

    #[test]
    fn test_routing_follows_observation() {
        let bus = LocalBus::new();
        let (device, _rx) = device(&bus);
        let (all, _s1) = capture(&bus, &topics::send(&GatewayTarget::All));
        let (direct, _s2) = capture(&bus, "sg1/send/gw-b");
        let t0 = Instant::now();

        // nothing heard yet: every gateway, full power
        let target = device
            .send_message_at(Bytes::from_static(b"a"), DeliveryClass::Reliable, None, t0)
            .unwrap();
        assert_eq!(target, GatewayTarget::All);
        let request: SendRequest = decode(&all.lock()[0]).unwrap();
        assert_eq!(request.power, Some(20));

        device.receive(message(RxKind::Reliable, "gw-b", -75, 95, 7), t0);
        let target = device
            .send_message_at(Bytes::from_static(b"b"), DeliveryClass::Realtime, None, t0)
            .unwrap();
        assert_eq!(target, GatewayTarget::Gateway("gw-b".into()));
        let request: SendRequest = decode(&direct.lock()[0]).unwrap();
        assert_eq!(request.power, Some(15));
        assert_eq!(request.class, DeliveryClass::Realtime);

        // sighting outlived the ttl
        let later = t0 + Duration::from_secs(61);
        let target = device
            .send_message_at(Bytes::from_static(b"c"), DeliveryClass::Reliable, Some(5), later)
            .unwrap();
        assert_eq!(target, GatewayTarget::All);
        let request: SendRequest = decode(&all.lock()[1]).unwrap();
        assert_eq!(request.power, Some(5));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = LocalBus::new();
        let (device, _rx) = device(&bus);
        let topic = topics::inbound(RxKind::Reliable, &device.key());
        assert_eq!(bus.subscriber_count(&topic), 1);
        drop(device);
        assert_eq!(bus.subscriber_count(&topic), 0);
    }
}
