// Gattlink - BLE central client for a single GATT peripheral

pub mod ble;
pub mod config;

use std::sync::Arc;

pub use ble::client::{ClientEvent, GattClient, PendingOp};
pub use ble::connection::LinkState;
pub use ble::decoder::{InboundMessage, MessageBody};
pub use ble::reconnect::ReconnectPolicy;
pub use ble::transport::{BleTransport, PeripheralHandle};
pub use ble::BleError;
pub use config::ClientConfig;

use ble::scanner::DeviceScanner;

/// Scan for `config.device_name`, then start a client connecting to the
/// first match. The returned client is still setting up; wait for
/// [`LinkState::Ready`] before sending.
pub async fn find_and_connect(
    transport: Arc<dyn BleTransport>,
    config: ClientConfig,
) -> Result<(GattClient, PeripheralHandle), BleError> {
    let scanner = DeviceScanner::new(transport.clone());
    let peripheral = scanner
        .find_first(&config.device_name, config.scan_timeout())
        .await?;

    let client = GattClient::spawn(transport, config);
    client.connect(peripheral.clone()).await?;
    Ok((client, peripheral))
}
