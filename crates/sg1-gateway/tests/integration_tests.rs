//! Integration tests for the SG1 gateway bridge
//!
//! These tests run real gateways against scripted hardware and verify:
//! - Link bring-up, sync and reconnect pacing
//! - Hint matching and decode orchestration
//! - Delivery to devices, including copies from several gateways
//! - Outbound send, wake and pair requests from the bus
//! - Hardware queries answered through reply waiters
//! - Queue backpressure per delivery class

use bytes::Bytes;
use parking_lot::Mutex;
use sg1_core::message::decode;
use sg1_core::{
    fixed_hint, topics, ChannelKey, DeliveryClass, GatewayTarget, LocalBus, MessageBus,
    SendRequest, Subscription,
};
use sg1_gateway::test_utils::{
    beacon_frame, decoded_frame, decoded_rt_frame, frame, newdata_frame, noise_frame, time_frame,
    wait_for_state, TestFixture,
};
use sg1_gateway::{
    ConnectionState, Device, DeviceConfig, DeviceEvent, Gateway, GatewayConfigBuilder,
    GatewayError, GatewayHandle, MockInterface,
};
use sg1_protocol::{MessageType, RxIv};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

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

fn iv(timestamp: u64) -> RxIv {
    RxIv {
        timestamp,
        node_id: 3,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Link lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_gateway_syncs_and_announces() {
    let fixture = TestFixture::new("gw-1");
    let (connected, _sub) = capture(&fixture.bus, topics::GATEWAY_CONNECTED);
    let (handle, _task) = fixture.spawn().unwrap();

    assert!(wait_for_state(&handle, ConnectionState::Connected).await);
    let ids: Vec<String> = connected
        .lock()
        .iter()
        .map(|p| decode::<String>(p).unwrap())
        .collect();
    assert_eq!(ids, vec!["gw-1".to_string()]);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.connects, 1);
    assert_eq!(fixture.interface.healthy_marks(), 1);
    assert_eq!(fixture.interface.unhealthy_marks(), 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempts_are_spaced() {
    let mut fixture = TestFixture::new("gw-1");
    fixture.config = GatewayConfigBuilder::new("gw-1")
        .tick_interval(Duration::from_secs(1))
        .reconnect_interval(Duration::from_secs(5))
        .build();
    fixture.interface.fail_all_opens();
    let (handle, _task) = fixture.spawn().unwrap();

    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert_eq!(fixture.interface.open_attempts(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    // t = 0, 5, 10
    assert_eq!(fixture.interface.open_attempts(), 3);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.connect_failures, 3);
    assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lost_link_reported_and_reopened() {
    let fixture = TestFixture::new("gw-1");
    let (disconnected, _sub) = capture(&fixture.bus, topics::GATEWAY_DISCONNECTED);
    let (handle, _task) = fixture.spawn().unwrap();
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);

    fixture.interface.drop_link();
    settle().await;
    assert_eq!(disconnected.lock().len(), 1);
    assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);
    assert_eq!(fixture.interface.open_attempts(), 2);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sync_timeout_gives_up_on_link() {
    let fixture = TestFixture {
        interface: MockInterface::new(),
        ..TestFixture::new("gw-1")
    };
    let (handle, _task) = fixture.spawn().unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handle.state().await.unwrap(), ConnectionState::Syncing);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(fixture.interface.unhealthy_marks(), 1);
    assert_eq!(fixture.interface.healthy_marks(), 0);
    assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_foreign_firmware_rejected() {
    let fixture = TestFixture {
        interface: MockInterface::new(),
        ..TestFixture::new("gw-1")
    };
    fixture
        .interface
        .reply_on_connect(frame(MessageType::Version, b"XYZ\x01"));
    let (handle, _task) = fixture.spawn().unwrap();

    settle().await;
    assert_eq!(fixture.interface.unhealthy_marks(), 1);
    assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);
    handle.shutdown().await.unwrap();
}

// ============================================================================
// Radio → bus
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_registered_device_receives_decoded_packet() {
    let fixture = TestFixture::new("gw-1");
    let key = ChannelKey::new([11; 32]);
    let (_device, mut events) = Device::new(DeviceConfig::new(key), fixture.bus.clone()).unwrap();
    let (handle, _task) = fixture.spawn().unwrap();
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);

    // the device answered the first discovery poll, so its hint matches
    fixture
        .interface
        .push_incoming(newdata_frame(-80, [fixed_hint(&key), fixed_hint(&key)]));
    settle().await;
    let set_keys = fixture.interface.written_of(MessageType::SetKey);
    assert_eq!(set_keys.len(), 1);
    assert_eq!(set_keys[0].payload.as_ref(), key.as_bytes());
    let decodes = fixture.interface.written_of(MessageType::Decode);
    assert_eq!(decodes[0].payload.as_ref(), &[0x01]);

    fixture
        .interface
        .push_incoming(decoded_frame(&key, iv(1000), 92, -81, b"temp=21"));
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        DeviceEvent::Message(m) => {
            assert_eq!(m.data.as_ref(), b"temp=21");
            assert_eq!(m.gateway, "gw-1");
            assert_eq!(m.timestamp, 1000);
            assert_eq!(m.node_id, 3);
            assert_eq!(m.path_loss, 92);
        }
        other => panic!("unexpected event {other:?}"),
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_two_gateways_deliver_once() {
    let a = TestFixture::new("gw-a");
    let b = a.sibling("gw-b");
    let key = ChannelKey::new([12; 32]);
    let (device, mut events) = Device::new(DeviceConfig::new(key), a.bus.clone()).unwrap();

    let (ha, _ta) = a.spawn().unwrap();
    let (hb, _tb) = b.spawn().unwrap();
    assert!(wait_for_state(&ha, ConnectionState::Connected).await);
    assert!(wait_for_state(&hb, ConnectionState::Connected).await);

    a.interface
        .push_incoming(decoded_rt_frame(&key, iv(77), 100, -90, b"x"));
    settle().await;
    b.interface
        .push_incoming(decoded_rt_frame(&key, iv(77), 85, -75, b"x"));
    settle().await;

    assert!(matches!(events.try_recv(), Ok(DeviceEvent::RealtimeMessage(m)) if m.gateway == "gw-a"));
    assert!(events.try_recv().is_err());
    // the stronger copy still updates routing
    assert_eq!(device.observation().unwrap().gateway, "gw-b");

    ha.shutdown().await.unwrap();
    hb.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_beacons_published_without_timestamp() {
    let fixture = TestFixture::new("gw-1");
    let key = ChannelKey::new([13; 32]);
    let (beacons, _sub) = capture(&fixture.bus, &topics::inbound(sg1_core::RxKind::Beacon, &key));
    let (handle, _task) = fixture.spawn().unwrap();
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);

    fixture.interface.push_incoming(beacon_frame(&key, 88, -70));
    settle().await;

    let message: sg1_core::RxMessage = decode(&beacons.lock()[0]).unwrap();
    assert_eq!(message.timestamp, 0);
    assert_eq!(message.node_id, 0);
    assert!(message.data.is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_debug_text_and_noise() {
    let fixture = TestFixture::new("gw-1");
    let (logs, _sub) = capture(&fixture.bus, &topics::hw_log("gw-1"));
    let noise = Arc::new(Mutex::new(Vec::new()));
    let sink = noise.clone();

    let (gateway, handle) = Gateway::new(
        fixture.interface.clone(),
        &fixture.config,
        fixture.bus.clone(),
    )
    .unwrap();
    let gateway = gateway.with_noise_callback(Arc::new(move |id: &str, dbm: i8| {
        sink.lock().push((id.to_string(), dbm))
    }));
    tokio::spawn(gateway.run());
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);

    let mut chunk = b"radio ready\n".to_vec();
    chunk.extend_from_slice(&noise_frame(-110));
    fixture.interface.push_incoming(Bytes::from(chunk));
    settle().await;

    assert_eq!(logs.lock().as_slice(), &[b"radio ready".to_vec()]);
    assert_eq!(noise.lock().as_slice(), &[("gw-1".to_string(), -110)]);
    handle.shutdown().await.unwrap();
}

// ============================================================================
// Bus → radio
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_request_reaches_hardware() {
    let fixture = TestFixture::new("gw-1");
    let key = ChannelKey::new([14; 32]);
    let (device, _events) = Device::new(DeviceConfig::new(key), fixture.bus.clone()).unwrap();
    let (handle, _task) = fixture.spawn().unwrap();
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);
    fixture.interface.clear_written();

    let target = device
        .send_message(Bytes::from_static(b"led=on"), DeliveryClass::Realtime, None)
        .unwrap();
    assert_eq!(target, GatewayTarget::All);
    settle().await;

    let frames: Vec<_> = fixture
        .interface
        .written_frames()
        .into_iter()
        .filter(|f| f.frame_type != MessageType::Time.id() && f.frame_type != MessageType::Rx.id())
        .collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].frame_type, MessageType::SetKey.id());
    assert_eq!(frames[0].payload.as_ref(), key.as_bytes());
    assert_eq!(frames[1].frame_type, MessageType::SendRt.id());
    assert_eq!(frames[1].payload[0], 20);
    assert_eq!(&frames[1].payload[4..], b"led=on");
    assert_eq!(handle.stats().await.unwrap().sends, 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wake_request_sets_decode_flag() {
    let fixture = TestFixture::new("gw-1");
    let key = ChannelKey::new([15; 32]);
    let (device, _events) = Device::new(DeviceConfig::new(key), fixture.bus.clone()).unwrap();
    let (handle, _task) = fixture.spawn().unwrap();
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);

    device.send_wake_request().unwrap();
    settle().await;
    fixture
        .interface
        .push_incoming(newdata_frame(-70, [fixed_hint(&key), fixed_hint(&key)]));
    settle().await;

    let decodes = fixture.interface.written_of(MessageType::Decode);
    assert_eq!(decodes.len(), 1);
    assert_eq!(decodes[0].payload.as_ref(), &[0x02]);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pair_request_reaches_hardware() {
    let fixture = TestFixture::new("gw-1");
    let key = ChannelKey::new([16; 32]);
    let mut config = DeviceConfig::new(key);
    config.node_id = 9;
    let (device, _events) = Device::new(config, fixture.bus.clone()).unwrap();
    let (handle, _task) = fixture.spawn().unwrap();
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);

    device.pair("gw-1").unwrap();
    settle().await;

    let pairs = fixture.interface.written_of(MessageType::Pair);
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].payload.as_ref(), &[9]);
    handle.shutdown().await.unwrap();
}

// ============================================================================
// Hardware queries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rng_reply_goes_to_waiter() {
    let fixture = TestFixture::new("gw-1");
    fixture
        .interface
        .respond_to(MessageType::Rng, frame(MessageType::Rng, &[1, 2, 3, 4]));
    let (published, _sub) = capture(&fixture.bus, &topics::rng("gw-1"));
    let (handle, _task) = fixture.spawn().unwrap();
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);

    let bytes = handle.read_rng().await.unwrap().unwrap();
    assert_eq!(bytes.as_ref(), &[1, 2, 3, 4]);
    assert!(published.lock().is_empty());

    // nobody waiting: published instead
    fixture
        .interface
        .push_incoming(frame(MessageType::Rng, &[5, 6]));
    settle().await;
    assert_eq!(published.lock().as_slice(), &[vec![5, 6]]);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_hardware_time_query() {
    let fixture = TestFixture::new("gw-1");
    fixture
        .interface
        .respond_to(MessageType::Time, time_frame(1_700_000_000_000_000));
    let (handle, _task) = fixture.spawn().unwrap();
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);

    assert_eq!(
        handle.hardware_time().await.unwrap(),
        Some(1_700_000_000_000_000)
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_query_times_out() {
    let fixture = TestFixture::new("gw-1");
    let (handle, _task) = fixture.spawn().unwrap();
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);

    assert!(!handle.ping().await.unwrap());
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_query_while_disconnected_fails() {
    let fixture = TestFixture::new("gw-1");
    fixture.interface.fail_all_opens();
    let (handle, _task) = fixture.spawn().unwrap();
    settle().await;
    assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);

    let err = handle.read_rng().await.unwrap_err();
    assert!(matches!(err, GatewayError::NotConnected(ref id) if id == "gw-1"));
    assert_eq!(err.error_code(), "NOT_CONNECTED");
    assert!(handle.ping().await.is_err());
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_invalid_rf_profile_rejected() {
    let fixture = TestFixture::new("gw-1");
    let (handle, _task) = fixture.spawn().unwrap();
    assert!(wait_for_state(&handle, ConnectionState::Connected).await);
    fixture.interface.clear_written();

    let err = handle.set_rf(9, 3).await.unwrap_err();
    assert!(matches!(err, GatewayError::Protocol(_)));

    handle.set_rf(7, 5).await.unwrap();
    settle().await;
    let cfgs = fixture.interface.written_of(MessageType::Cfg);
    assert_eq!(cfgs.len(), 1);
    assert_eq!(cfgs[0].payload.as_ref(), &[7, 5, 0]);
    handle.shutdown().await.unwrap();
}

// ============================================================================
// Backpressure
// ============================================================================

fn send_request(class: DeliveryClass) -> SendRequest {
    SendRequest {
        key: ChannelKey::new([4; 32]),
        data: Bytes::from_static(b"payload"),
        class,
        power: None,
    }
}

/// A gateway with a one-slot queue that is not running yet
fn stalled_gateway() -> (Gateway<MockInterface>, GatewayHandle) {
    let config = GatewayConfigBuilder::new("gw-1")
        .command_queue_size(1)
        .build();
    let bus = Arc::new(LocalBus::new());
    Gateway::new(MockInterface::new().with_version_on_connect(), &config, bus).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_realtime_send_dropped_when_queue_stays_full() {
    let (gateway, handle) = stalled_gateway();
    handle.register_key(ChannelKey::new([1; 32])).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = handle
        .send(send_request(DeliveryClass::Realtime))
        .await
        .unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, GatewayError::QueueFull));
    assert!(waited >= Duration::from_millis(500));
    assert!(waited < Duration::from_secs(1));

    tokio::spawn(gateway.run());
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.dropped_sends, 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reliable_send_waits_for_space() {
    let (gateway, handle) = stalled_gateway();
    handle.register_key(ChannelKey::new([1; 32])).await.unwrap();

    // never drained: given up after the reliable timeout
    let started = tokio::time::Instant::now();
    let err = handle
        .send(send_request(DeliveryClass::Reliable))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::QueueFull));
    assert!(started.elapsed() >= Duration::from_secs(10));

    // space frees up after a few seconds: delivered
    let sender = handle.clone();
    let pending =
        tokio::spawn(async move { sender.send(send_request(DeliveryClass::Reliable)).await });
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!pending.is_finished());

    tokio::spawn(gateway.run());
    pending.await.unwrap().unwrap();
    handle.shutdown().await.unwrap();
}
