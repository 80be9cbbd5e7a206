//! Bus topic names
//!
//! | topic | payload |
//! |-------|---------|
//! | `sg1/in/<b64 key>` | [`crate::RxMessage`] (reliable) |
//! | `sg1/rt-in/<b64 key>` | [`crate::RxMessage`] (realtime) |
//! | `sg1/beacon/<b64 key>` | [`crate::RxMessage`] (beacon) |
//! | `sg1/send/<gw or __all__>` | [`crate::SendRequest`] |
//! | `sg1/wake/<gw or __all__>` | [`crate::WakeRequest`] |
//! | `sg1/pair/<gw>` | [`crate::PairRequest`] |
//! | `sg1/register-device/` | key bytes |
//! | `sg1/discover-devices` | empty |
//! | `sg1/gateway-connected` | gateway id |
//! | `sg1/gateway-disconnected` | gateway id |
//! | `sg1/hw-log/<gw>` | UTF-8 text line |
//! | `sg1/rng/<gw>` | raw random bytes |

use std::fmt;

use crate::key::ChannelKey;
use crate::message::RxKind;

/// Address meaning "every gateway"
pub const ALL_GATEWAYS: &str = "__all__";

/// Device announce topic
pub const REGISTER_DEVICE: &str = "sg1/register-device/";

/// Gateway discovery poll topic
pub const DISCOVER_DEVICES: &str = "sg1/discover-devices";

/// Gateway came up
pub const GATEWAY_CONNECTED: &str = "sg1/gateway-connected";

/// Gateway went down
pub const GATEWAY_DISCONNECTED: &str = "sg1/gateway-disconnected";

/// Who should handle an outbound request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GatewayTarget {
    /// One named gateway
    Gateway(String),
    /// Every gateway that hears the request
    All,
}

impl GatewayTarget {
    /// Topic suffix for this target
    pub fn as_str(&self) -> &str {
        match self {
            GatewayTarget::Gateway(id) => id,
            GatewayTarget::All => ALL_GATEWAYS,
        }
    }
}

impl fmt::Display for GatewayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound topic for a channel and frame class
pub fn inbound(kind: RxKind, key: &ChannelKey) -> String {
    let prefix = match kind {
        RxKind::Reliable => "sg1/in",
        RxKind::Realtime => "sg1/rt-in",
        RxKind::Beacon => "sg1/beacon",
    };
    format!("{}/{}", prefix, key.to_b64())
}

/// Send request topic
pub fn send(target: &GatewayTarget) -> String {
    format!("sg1/send/{}", target)
}

/// Wake request topic
pub fn wake(target: &GatewayTarget) -> String {
    format!("sg1/wake/{}", target)
}

/// Pair request topic
pub fn pair(gateway: &str) -> String {
    format!("sg1/pair/{}", gateway)
}

/// Hardware debug text topic
pub fn hw_log(gateway: &str) -> String {
    format!("sg1/hw-log/{}", gateway)
}

/// Hardware RNG output topic
pub fn rng(gateway: &str) -> String {
    format!("sg1/rng/{}", gateway)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_topics() {
        let key = ChannelKey::new([0; 32]);
        let b64 = key.to_b64();
        assert_eq!(inbound(RxKind::Reliable, &key), format!("sg1/in/{}", b64));
        assert_eq!(inbound(RxKind::Realtime, &key), format!("sg1/rt-in/{}", b64));
        assert_eq!(inbound(RxKind::Beacon, &key), format!("sg1/beacon/{}", b64));
    }

    #[test]
    fn test_targets() {
        assert_eq!(send(&GatewayTarget::All), "sg1/send/__all__");
        assert_eq!(
            wake(&GatewayTarget::Gateway("attic".into())),
            "sg1/wake/attic"
        );
        assert_eq!(pair("attic"), "sg1/pair/attic");
    }
}
