//! Error types for SG1 core primitives
//!
//! Covers key parsing, power configuration, bus payload encoding and
//! delivery failures reported by a [`crate::bus::MessageBus`].

use thiserror::Error;

/// Main error type for the SG1 core crate
#[derive(Error, Debug)]
pub enum Sg1CoreError {
    // ===== Key Errors =====
    /// Channel keys are always exactly 32 bytes
    #[error("Key length must be 32, got {0}")]
    InvalidKeyLength(usize),

    /// Key text was not valid base64
    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    // ===== Configuration Errors =====
    /// Power range with min above max
    #[error("Invalid power range: min {min} exceeds max {max}")]
    InvalidPowerRange {
        /// Lower bound
        min: u8,
        /// Upper bound
        max: u8,
    },

    // ===== Serialization Errors =====
    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // ===== Bus Errors =====
    /// The broker refused or failed to deliver
    #[error("Bus error: {0}")]
    Bus(String),
}

/// Result type alias for SG1 core operations
pub type Result<T> = std::result::Result<T, Sg1CoreError>;
