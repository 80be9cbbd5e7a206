//! Node configuration file
//!
//! ```toml
//! [[gateway]]
//! id = "attic"
//! port = "/dev/ttyUSB0"
//! static_keys = ["…base64…"]
//!
//! [[device]]
//! name = "greenhouse"
//! key = "…base64…"
//! observation_ttl = "1m"
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sg1_core::ChannelKey;
use sg1_gateway::{DeviceConfig, GatewayConfig, PortSelection};
use std::collections::HashSet;
use std::path::Path;

/// A device with the name it is logged under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedDevice {
    /// Display name
    pub name: String,
    /// Endpoint settings
    #[serde(flatten)]
    pub config: DeviceConfig,
}

/// Everything one node runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Gateways, one per radio
    #[serde(default, rename = "gateway")]
    pub gateways: Vec<GatewayConfig>,
    /// Bus-side device endpoints
    #[serde(default, rename = "device")]
    pub devices: Vec<NamedDevice>,
}

impl NodeConfig {
    /// Read and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: NodeConfig =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate names and unparseable keys
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for gateway in &self.gateways {
            if !ids.insert(gateway.id.as_str()) {
                bail!("duplicate gateway id {:?}", gateway.id);
            }
            gateway
                .static_channel_keys()
                .with_context(|| format!("static keys of gateway {:?}", gateway.id))?;
        }
        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                bail!("duplicate device name {:?}", device.name);
            }
        }
        Ok(())
    }

    /// Fold command-line overrides in
    ///
    /// `port` adds (or repoints) the gateway named `gateway_id`. `keys` are
    /// added to every gateway's static list.
    pub fn apply_cli(&mut self, port: Option<&str>, gateway_id: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            ChannelKey::from_b64(key).with_context(|| format!("--key {:?}", key))?;
        }

        if let Some(port) = port {
            let selection = PortSelection::from(port.to_string());
            match self.gateways.iter_mut().find(|g| g.id == gateway_id) {
                Some(gateway) => gateway.port = selection,
                None => {
                    let mut gateway = GatewayConfig::new(gateway_id);
                    gateway.port = selection;
                    self.gateways.push(gateway);
                }
            }
        }

        for gateway in &mut self.gateways {
            for key in keys {
                if !gateway.static_keys.contains(key) {
                    gateway.static_keys.push(key.clone());
                }
            }
        }
        self.validate()
    }
}
