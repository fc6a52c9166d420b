//! Device scanner
//!
//! Watches discovery events for a peripheral whose advertised name matches
//! exactly, then stops the radio scan and yields that single candidate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use super::transport::{BleTransport, PeripheralHandle, TransportEvent};
use super::BleError;

/// Case-sensitive, whole-string name match.
pub fn matches_name(peripheral: &PeripheralHandle, name_filter: &str) -> bool {
    peripheral.name.as_deref() == Some(name_filter)
}

pub struct DeviceScanner {
    transport: Arc<dyn BleTransport>,
}

impl DeviceScanner {
    pub fn new(transport: Arc<dyn BleTransport>) -> Self {
        Self { transport }
    }

    /// Scan until the first peripheral named `name_filter` shows up.
    ///
    /// The scan is always stopped before returning, whether a candidate was
    /// found, the optional `timeout` elapsed, or the event stream closed.
    pub async fn find_first(
        &self,
        name_filter: &str,
        timeout: Option<Duration>,
    ) -> Result<PeripheralHandle, BleError> {
        // Subscribe before starting so no early advertisement is missed.
        let mut events = self.transport.events();
        self.transport.start_scan().await?;
        log::info!("Scanning for peripheral named {:?}", name_filter);

        let search = async {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::DeviceDiscovered(peripheral)) => {
                        if matches_name(&peripheral, name_filter) {
                            return Ok(peripheral);
                        }
                        log::debug!(
                            "Ignoring {} ({:?})",
                            peripheral.address,
                            peripheral.name
                        );
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Scanner lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        return Err(BleError::ScanUnavailable(
                            "transport event stream closed".to_string(),
                        ));
                    }
                }
            }
        };

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, search)
                .await
                .unwrap_or(Err(BleError::Timeout)),
            None => search.await,
        };

        if let Err(e) = self.transport.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }

        if let Ok(peripheral) = &outcome {
            log::info!("Found {:?} at {}", name_filter, peripheral.address);
        }
        outcome
    }
}
