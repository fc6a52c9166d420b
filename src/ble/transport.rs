//! BLE transport trait definitions and core types
//!
//! Defines the abstract radio interface the client consumes. Both the
//! simulated transport and the btleplug-backed transport conform to it.
//! Request methods only submit work; every outcome is reported later on the
//! event stream, tagged with the link it belongs to.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::gatt::GattService;
use super::BleError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// An opaque identifier assigned by the platform stack (CoreBluetooth
    /// hides MAC addresses behind per-host UUIDs).
    Platform(String),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Real(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            BleAddress::Platform(id) => f.write_str(id),
            BleAddress::Simulated(id) => write!(f, "sim-{}", id),
        }
    }
}

/// Identity of one physical peripheral, fixed once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralHandle {
    pub address: BleAddress,
    /// Advertised local name, if the peripheral sent one.
    pub name: Option<String>,
}

impl PeripheralHandle {
    pub fn new(address: BleAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: Some(name.into()),
        }
    }
}

/// Transport-level handle for one connect attempt. A fresh id is issued
/// for every call to [`BleTransport::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Asynchronous outcomes reported by the radio stack.
///
/// Failures of individual GATT operations are carried as `Err(String)`
/// so the event type stays cheap to clone across subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    DeviceDiscovered(PeripheralHandle),
    Connected {
        link: LinkId,
        mtu: u16,
    },
    Disconnected {
        link: LinkId,
    },
    MtuChanged {
        link: LinkId,
        mtu: u16,
    },
    ServicesDiscovered {
        link: LinkId,
        result: Result<Vec<GattService>, String>,
    },
    DescriptorWritten {
        link: LinkId,
        characteristic: Uuid,
        descriptor: Uuid,
        result: Result<(), String>,
    },
    CharacteristicWritten {
        link: LinkId,
        characteristic: Uuid,
        result: Result<(), String>,
    },
    CharacteristicRead {
        link: LinkId,
        characteristic: Uuid,
        result: Result<Vec<u8>, String>,
    },
    Notification {
        link: LinkId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    /// The link this event belongs to; `None` for scan results.
    pub fn link(&self) -> Option<LinkId> {
        match self {
            TransportEvent::DeviceDiscovered(_) => None,
            TransportEvent::Connected { link, .. }
            | TransportEvent::Disconnected { link }
            | TransportEvent::MtuChanged { link, .. }
            | TransportEvent::ServicesDiscovered { link, .. }
            | TransportEvent::DescriptorWritten { link, .. }
            | TransportEvent::CharacteristicWritten { link, .. }
            | TransportEvent::CharacteristicRead { link, .. }
            | TransportEvent::Notification { link, .. } => Some(*link),
        }
    }
}

/// Whether a characteristic write expects a response from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// The platform radio stack, central role only.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Start scanning. Fails with [`BleError::ScanUnavailable`] when the
    /// radio is missing or switched off.
    async fn start_scan(&self) -> Result<(), BleError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Begin connecting; completion arrives as `Connected` or `Disconnected`.
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<LinkId, BleError>;

    /// Tear down the link and release its resources.
    async fn disconnect(&self, link: LinkId) -> Result<(), BleError>;

    /// Begin service discovery; completion arrives as `ServicesDiscovered`.
    async fn discover_services(&self, link: LinkId) -> Result<(), BleError>;

    /// Begin a descriptor write; completion arrives as `DescriptorWritten`.
    async fn write_descriptor(
        &self,
        link: LinkId,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError>;

    /// Begin a characteristic write; completion arrives as `CharacteristicWritten`.
    async fn write_characteristic(
        &self,
        link: LinkId,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError>;

    /// Begin a characteristic read; completion arrives as `CharacteristicRead`.
    async fn read_characteristic(&self, link: LinkId, characteristic: Uuid)
        -> Result<(), BleError>;

    /// Subscribe to the transport's event stream.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
