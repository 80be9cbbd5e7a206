//! Registry of the gateways and devices running in one process
//!
//! Gateways are spawned as tasks and addressed by id; devices are addressed
//! by name. Removing an entry stops it: gateways are shut down and awaited,
//! devices unsubscribe when dropped.

use std::collections::HashMap;
use std::sync::Arc;

use sg1_core::MessageBus;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{DeviceConfig, GatewayConfig};
use crate::device::{Device, DeviceEvent};
use crate::error::{GatewayError, Result};
use crate::gateway::{Gateway, GatewayHandle};
use crate::interface::RadioInterface;

/// Gateways and devices sharing one bus
pub struct Registry {
    bus: Arc<dyn MessageBus>,
    gateways: HashMap<String, (GatewayHandle, JoinHandle<Result<()>>)>,
    devices: HashMap<String, Device>,
}

impl Registry {
    /// Empty registry on `bus`
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            gateways: HashMap::new(),
            devices: HashMap::new(),
        }
    }

    /// Bus shared by everything in the registry
    pub fn bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    /// Start a gateway over `interface`
    pub fn add_gateway<I>(&mut self, interface: I, config: &GatewayConfig) -> Result<GatewayHandle>
    where
        I: RadioInterface + 'static,
    {
        if self.gateways.contains_key(&config.id) {
            return Err(GatewayError::Duplicate(format!("gateway {}", config.id)));
        }
        let (gateway, handle) = Gateway::new(interface, config, self.bus.clone())?;
        let task = tokio::spawn(gateway.run());
        info!(gateway = %config.id, "Gateway added");
        self.gateways
            .insert(config.id.clone(), (handle.clone(), task));
        Ok(handle)
    }

    /// Start a device named `name`
    pub fn add_device(
        &mut self,
        name: &str,
        config: DeviceConfig,
    ) -> Result<mpsc::UnboundedReceiver<DeviceEvent>> {
        if self.devices.contains_key(name) {
            return Err(GatewayError::Duplicate(format!("device {}", name)));
        }
        let (device, events) = Device::new(config, self.bus.clone())?;
        info!(device = name, key = %device.key(), "Device added");
        self.devices.insert(name.to_string(), device);
        Ok(events)
    }

    /// Handle to a running gateway
    pub fn gateway(&self, id: &str) -> Option<&GatewayHandle> {
        self.gateways.get(id).map(|(handle, _)| handle)
    }

    /// A device by name
    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    /// Ids of running gateways, sorted
    pub fn gateway_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.gateways.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Names of devices, sorted
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop and forget a gateway. Returns `false` if it was unknown.
    pub async fn remove_gateway(&mut self, id: &str) -> bool {
        let Some((handle, task)) = self.gateways.remove(id) else {
            return false;
        };
        stop_gateway(id, handle, task).await;
        true
    }

    /// Forget a device. Returns `false` if it was unknown.
    pub fn remove_device(&mut self, name: &str) -> bool {
        let removed = self.devices.remove(name).is_some();
        if removed {
            info!(device = name, "Device removed");
        }
        removed
    }

    /// Stop everything
    pub async fn shutdown(&mut self) {
        self.devices.clear();
        for (id, (handle, task)) in self.gateways.drain() {
            stop_gateway(&id, handle, task).await;
        }
    }
}

async fn stop_gateway(id: &str, handle: GatewayHandle, task: JoinHandle<Result<()>>) {
    if handle.shutdown().await.is_err() {
        warn!(gateway = id, "Gateway already stopped");
    }
    match task.await {
        Ok(Ok(())) => info!(gateway = id, "Gateway removed"),
        Ok(Err(e)) => warn!(gateway = id, error = %e, "Gateway exited with error"),
        Err(e) => warn!(gateway = id, error = %e, "Gateway task failed"),
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("gateways", &self.gateway_ids())
            .field("devices", &self.device_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockInterface;
    use sg1_core::{ChannelKey, LocalBus};

    #[tokio::test(start_paused = true)]
    async fn test_add_and_remove_gateway() {
        let mut registry = Registry::new(Arc::new(LocalBus::new()));
        let config = GatewayConfig::new("gw-1");
        registry.add_gateway(MockInterface::new(), &config).unwrap();

        let dup = registry.add_gateway(MockInterface::new(), &config);
        assert!(matches!(dup, Err(GatewayError::Duplicate(_))));
        assert_eq!(registry.gateway_ids(), vec!["gw-1".to_string()]);

        let handle = registry.gateway("gw-1").unwrap().clone();
        assert!(registry.remove_gateway("gw-1").await);
        assert!(!registry.remove_gateway("gw-1").await);
        assert!(handle.state().await.is_err());
    }

    #[tokio::test]
    async fn test_devices_by_name() {
        let mut registry = Registry::new(Arc::new(LocalBus::new()));
        let key = ChannelKey::new([1; 32]);
        registry.add_device("sensor", DeviceConfig::new(key)).unwrap();
        assert!(registry.add_device("sensor", DeviceConfig::new(key)).is_err());

        assert_eq!(registry.device("sensor").unwrap().key(), key);
        assert!(registry.remove_device("sensor"));
        assert!(registry.device_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let mut registry = Registry::new(Arc::new(LocalBus::new()));
        registry
            .add_gateway(MockInterface::new().with_version_on_connect(), &GatewayConfig::new("a"))
            .unwrap();
        registry
            .add_gateway(MockInterface::new(), &GatewayConfig::new("b"))
            .unwrap();
        registry
            .add_device("d", DeviceConfig::new(ChannelKey::new([2; 32])))
            .unwrap();

        registry.shutdown().await;
        assert!(registry.gateway_ids().is_empty());
        assert!(registry.device_names().is_empty());
    }
}
