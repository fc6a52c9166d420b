//! BLE central client for a single GATT peripheral
//!
//! Provides the transport abstraction, a simulated transport for testing,
//! the device scanner, and the connection state machine that drives one
//! peripheral from discovery to a subscribed, writable characteristic.

#[cfg(feature = "ble-central")]
pub mod central;
pub mod client;
pub mod connection;
pub mod decoder;
pub mod gatt;
pub mod queue;
pub mod reconnect;
pub mod scanner;
pub mod simulated;
pub mod transport;

use thiserror::Error;

use connection::LinkState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Bluetooth radio is unavailable: {0}")]
    ScanUnavailable(String),

    #[error("Peripheral does not expose the expected GATT profile: {0}")]
    TargetNotFound(String),

    #[error("Connection is not ready")]
    NotReady,

    #[error("A GATT operation is already outstanding")]
    Busy,

    #[error("Operation cancelled by disconnect")]
    Cancelled,

    #[error("Payload exceeds MTU ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Operation timed out")]
    Timeout,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Characteristic handle belongs to a released connection")]
    StaleHandle,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Illegal transition {from:?} -> {to:?}")]
    IllegalTransition { from: LinkState, to: LinkState },

    #[error("Client is closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl BleError {
    /// Errors after which the link is torn down rather than the single
    /// operation being rejected.
    pub fn is_link_fatal(&self) -> bool {
        matches!(self, BleError::Disconnected | BleError::Timeout)
    }
}
