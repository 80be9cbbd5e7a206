//! Transmit power selection from observed path loss
//!
//! The hardware reports an estimated path loss (dB) with every decoded
//! frame. To reach the other side with a comfortable margin we need
//! `tx_power - path_loss >= TARGET_RX_DBM + LINK_MARGIN_DB`.

use serde::{Deserialize, Serialize};

use crate::{Result, Sg1CoreError};

/// Receive level we aim for at the far end
pub const TARGET_RX_DBM: i16 = -90;

/// Extra headroom above the target level
pub const LINK_MARGIN_DB: i16 = 10;

/// Default lowest hardware power setting (dBm)
pub const DEFAULT_MIN_POWER: u8 = 0;

/// Default highest hardware power setting (dBm)
pub const DEFAULT_MAX_POWER: u8 = 20;

/// Valid transmit power settings, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerRange {
    /// Lowest setting
    pub min: u8,
    /// Highest setting, also used when nothing is known about the link
    pub max: u8,
}

impl PowerRange {
    /// Validated range
    pub fn new(min: u8, max: u8) -> Result<Self> {
        if min > max {
            return Err(Sg1CoreError::InvalidPowerRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// Clamp a requested power into range
    pub fn clamp(&self, power: i16) -> u8 {
        power.clamp(i16::from(self.min), i16::from(self.max)) as u8
    }

    /// Power needed to cover `path_loss` dB, clamped into range
    pub fn for_path_loss(&self, path_loss: i8) -> u8 {
        self.clamp(i16::from(path_loss) + TARGET_RX_DBM + LINK_MARGIN_DB)
    }

    /// Power to use when the link is unknown
    pub fn conservative(&self) -> u8 {
        self.max
    }
}

impl Default for PowerRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_POWER,
            max: DEFAULT_MAX_POWER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_inverted_range() {
        assert!(PowerRange::new(10, 2).is_err());
        assert!(PowerRange::new(2, 2).is_ok());
    }

    #[test]
    fn test_power_tracks_path_loss() {
        let range = PowerRange::default();
        assert_eq!(range.for_path_loss(90), 10);
        assert_eq!(range.for_path_loss(95), 15);
    }

    #[test]
    fn test_power_is_clamped() {
        let range = PowerRange::new(2, 14).unwrap();
        assert_eq!(range.for_path_loss(40), 2);
        assert_eq!(range.for_path_loss(127), 14);
        assert_eq!(range.for_path_loss(-128), 2);
        assert_eq!(range.conservative(), 14);
    }
}
