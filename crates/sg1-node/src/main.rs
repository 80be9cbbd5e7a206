//! SG1 Node - radio bridge daemon
//!
//! This binary runs gateways and device endpoints on an in-process bus:
//! - One gateway per configured radio (serial builds only)
//! - Device endpoints that log what their keys receive
//! - Hardware debug text and link events in the log

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sg1_core::message::decode;
use sg1_core::{topics, ChannelKey, LocalBus, MessageBus, Subscription};
use sg1_gateway::{DeviceEvent, GatewayConfig, Registry};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::NodeConfig;

#[derive(Parser)]
#[command(name = "sg1-node")]
#[command(about = "SG1 radio gateway bridge")]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Serial port for a gateway ("auto" scans for one)
    #[arg(long)]
    port: Option<String>,

    /// Id of the gateway opened with --port
    #[arg(long, default_value = "gw-1")]
    gateway_id: String,

    /// Channel key (base64) decoded by every gateway; repeatable
    #[arg(long = "key")]
    keys: Vec<String>,

    /// Print a new channel key and exit
    #[arg(long)]
    generate_key: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.generate_key {
        let key = ChannelKey::generate();
        println!("{}", key.to_b64());
        eprintln!("fingerprint: {}", key.fingerprint());
        return Ok(());
    }

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    config.apply_cli(args.port.as_deref(), &args.gateway_id, &args.keys)?;

    if config.gateways.is_empty() && config.devices.is_empty() {
        warn!("Nothing configured; pass --config or --port");
    }
    info!(
        "Starting SG1 node: {} gateway(s), {} device(s)",
        config.gateways.len(),
        config.devices.len()
    );

    let bus = Arc::new(LocalBus::new());
    let mut registry = Registry::new(bus.clone());
    let _log_subscriptions = watch_links(bus.as_ref(), &config.gateways)?;

    for gateway in &config.gateways {
        start_gateway(&mut registry, gateway)?;
    }

    for device in &config.devices {
        let events = registry
            .add_device(&device.name, device.config.clone())
            .with_context(|| format!("starting device {}", device.name))?;
        tokio::spawn(log_events(device.name.clone(), events));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    registry.shutdown().await;
    Ok(())
}

#[cfg(feature = "serial")]
fn start_gateway(registry: &mut Registry, config: &GatewayConfig) -> anyhow::Result<()> {
    let interface = sg1_gateway::SerialInterface::from_config(config);
    registry
        .add_gateway(interface, config)
        .with_context(|| format!("starting gateway {}", config.id))?;
    Ok(())
}

#[cfg(not(feature = "serial"))]
fn start_gateway(_registry: &mut Registry, config: &GatewayConfig) -> anyhow::Result<()> {
    warn!(
        "Built without the `serial` feature; gateway {} not started",
        config.id
    );
    Ok(())
}

/// Log link events and hardware debug text
fn watch_links(bus: &dyn MessageBus, gateways: &[GatewayConfig]) -> anyhow::Result<Vec<Subscription>> {
    let mut subscriptions = vec![
        bus.subscribe(
            topics::GATEWAY_CONNECTED,
            Arc::new(|_: &str, payload: &[u8]| {
                if let Ok(id) = decode::<String>(payload) {
                    info!("Gateway {} connected", id);
                }
            }),
        )?,
        bus.subscribe(
            topics::GATEWAY_DISCONNECTED,
            Arc::new(|_: &str, payload: &[u8]| {
                if let Ok(id) = decode::<String>(payload) {
                    warn!("Gateway {} disconnected", id);
                }
            }),
        )?,
    ];
    for gateway in gateways {
        let id = gateway.id.clone();
        subscriptions.push(bus.subscribe(
            &topics::hw_log(&gateway.id),
            Arc::new(move |_: &str, payload: &[u8]| {
                debug!(gateway = %id, "hw: {}", String::from_utf8_lossy(payload));
            }),
        )?);
    }
    Ok(subscriptions)
}

async fn log_events(name: String, mut events: mpsc::UnboundedReceiver<DeviceEvent>) {
    while let Some(event) = events.recv().await {
        let kind = match &event {
            DeviceEvent::Message(_) => "message",
            DeviceEvent::RealtimeMessage(_) => "realtime",
            DeviceEvent::Beacon(_) => "beacon",
        };
        let m = event.message();
        info!(
            device = %name,
            gateway = %m.gateway,
            rssi = m.rssi,
            path_loss = m.path_loss,
            bytes = m.data.len(),
            "Received {}",
            kind
        );
    }
}
