//! Client configuration
//!
//! Every field has a default matching the stock peripheral firmware, so a
//! config file only needs to name what differs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ble::gatt::{CHARACTERISTIC_UUID, SERVICE_UUID};
use crate::ble::reconnect::ReconnectPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Exact advertised name to connect to.
    pub device_name: String,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub reconnect: ReconnectPolicy,
    /// Bound on `Connecting`; `None` waits forever.
    pub connect_timeout_ms: Option<u64>,
    /// Bound on `ServiceDiscovery` and on `EnablingNotify`.
    pub discovery_timeout_ms: Option<u64>,
    /// Bound on scanning for the device; `None` scans until found.
    pub scan_timeout_ms: Option<u64>,
    /// Operations allowed to wait behind the one in flight.
    pub queue_depth: usize,
    /// Capacity of the application event channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_name: "ESP32".to_string(),
            service_uuid: SERVICE_UUID,
            characteristic_uuid: CHARACTERISTIC_UUID,
            reconnect: ReconnectPolicy::None,
            connect_timeout_ms: Some(10_000),
            discovery_timeout_ms: Some(10_000),
            scan_timeout_ms: None,
            queue_depth: 0,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn discovery_timeout(&self) -> Option<Duration> {
        self.discovery_timeout_ms.map(Duration::from_millis)
    }

    pub fn scan_timeout(&self) -> Option<Duration> {
        self.scan_timeout_ms.map(Duration::from_millis)
    }
}
