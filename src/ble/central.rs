//! btleplug-backed transport for a real radio (Mac/Linux/Windows)
//!
//! btleplug exposes blocking-style async calls; each request here is run on
//! its own task and its outcome reported as a `TransportEvent`, so the
//! client sees the same event-driven surface as with the simulated radio.
//!
//! btleplug does not report the negotiated ATT MTU, so links report a
//! caller-supplied value (23 unless told otherwise).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::gatt::{
    CharProperties, GattCharacteristic, GattService, CCCD_UUID, DEFAULT_ATT_MTU,
};
use super::transport::{
    BleAddress, BleTransport, LinkId, PeripheralHandle, TransportEvent, WriteKind,
};
use super::BleError;

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        BleError::Transport(e.to_string())
    }
}

struct LinkSlot<P> {
    peripheral: P,
    /// The platform connect call, until it completes.
    connecting: Option<JoinHandle<()>>,
}

/// Link bookkeeping. A link leaves the map exactly once, and any connect
/// still running for it is aborted then, so a late success can never leave
/// an untracked connection behind.
struct Registry<P> {
    /// Peripherals seen while scanning, keyed by platform id string.
    discovered: HashMap<String, P>,
    links: HashMap<LinkId, LinkSlot<P>>,
    next_link: u64,
}

impl<P> Registry<P> {
    fn new() -> Self {
        Self {
            discovered: HashMap::new(),
            links: HashMap::new(),
            next_link: 1,
        }
    }

    fn open(&mut self, peripheral: P) -> LinkId {
        let link = LinkId(self.next_link);
        self.next_link += 1;
        self.links.insert(
            link,
            LinkSlot {
                peripheral,
                connecting: None,
            },
        );
        link
    }

    fn set_connect_task(&mut self, link: LinkId, task: JoinHandle<()>) {
        match self.links.get_mut(&link) {
            Some(slot) => slot.connecting = Some(task),
            None => task.abort(),
        }
    }

    /// Called by the connect task once the platform call returns. `false`
    /// means the link was released meanwhile and the result is unwanted.
    fn confirm(&mut self, link: LinkId) -> bool {
        match self.links.get_mut(&link) {
            Some(slot) => {
                slot.connecting = None;
                true
            }
            None => false,
        }
    }

    fn peripheral(&self, link: LinkId) -> Option<&P> {
        self.links.get(&link).map(|slot| &slot.peripheral)
    }

    fn release(&mut self, link: LinkId) -> Option<P> {
        let slot = self.links.remove(&link)?;
        if let Some(task) = slot.connecting {
            task.abort();
        }
        Some(slot.peripheral)
    }

    fn release_where(&mut self, matches: impl Fn(&P) -> bool) -> Vec<LinkId> {
        let mut dropped: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, slot)| matches(&slot.peripheral))
            .map(|(link, _)| *link)
            .collect();
        dropped.sort();
        for link in &dropped {
            self.release(*link);
        }
        dropped
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
    events_tx: broadcast::Sender<TransportEvent>,
    registry: Arc<Mutex<Registry<Peripheral>>>,
    assumed_mtu: u16,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter. Fails with `ScanUnavailable` when
    /// the host has none.
    pub async fn new() -> Result<Arc<Self>, BleError> {
        Self::with_mtu(DEFAULT_ATT_MTU).await
    }

    pub async fn with_mtu(assumed_mtu: u16) -> Result<Arc<Self>, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::ScanUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::ScanUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::ScanUnavailable("no Bluetooth adapter".to_string()))?;

        if let Ok(info) = adapter.adapter_info().await {
            log::info!("Using Bluetooth adapter {}", info);
        }

        let (events_tx, _) = broadcast::channel(256);
        let registry = Arc::new(Mutex::new(Registry::new()));

        let central_events = adapter
            .events()
            .await
            .map_err(|e| BleError::ScanUnavailable(e.to_string()))?;
        tokio::spawn(pump_central_events(
            adapter.clone(),
            central_events,
            events_tx.clone(),
            registry.clone(),
        ));

        Ok(Arc::new(Self {
            adapter,
            events_tx,
            registry,
            assumed_mtu,
        }))
    }

    async fn linked(&self, link: LinkId) -> Result<Peripheral, BleError> {
        self.registry
            .lock()
            .await
            .peripheral(link)
            .cloned()
            .ok_or(BleError::Disconnected)
    }
}

async fn report_peripheral(
    adapter: &Adapter,
    id: &PeripheralId,
    events_tx: &broadcast::Sender<TransportEvent>,
    registry: &Mutex<Registry<Peripheral>>,
) {
    let peripheral = match adapter.peripheral(id).await {
        Ok(p) => p,
        Err(e) => {
            log::debug!("Discovered peripheral vanished: {}", e);
            return;
        }
    };
    let name = match peripheral.properties().await {
        Ok(Some(props)) => props.local_name,
        _ => None,
    };
    let key = peripheral.id().to_string();
    registry
        .lock()
        .await
        .discovered
        .insert(key.clone(), peripheral);

    let _ = events_tx.send(TransportEvent::DeviceDiscovered(PeripheralHandle {
        address: BleAddress::Platform(key),
        name,
    }));
}

async fn pump_central_events(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures_util::Stream<Item = CentralEvent> + Send>>,
    events_tx: broadcast::Sender<TransportEvent>,
    registry: Arc<Mutex<Registry<Peripheral>>>,
) {
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                report_peripheral(&adapter, &id, &events_tx, &registry).await;
            }
            CentralEvent::DeviceDisconnected(id) => {
                let dropped = registry.lock().await.release_where(|p| p.id() == id);
                for link in dropped {
                    log::info!("Peripheral dropped {}", link);
                    let _ = events_tx.send(TransportEvent::Disconnected { link });
                }
            }
            _ => {}
        }
    }
    log::warn!("Adapter event stream ended");
}

fn char_properties(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn gatt_profile(peripheral: &Peripheral) -> Vec<GattService> {
    peripheral
        .services()
        .into_iter()
        .map(|service| GattService {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .into_iter()
                .map(|c| GattCharacteristic {
                    uuid: c.uuid,
                    properties: char_properties(c.properties),
                    descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                })
                .collect(),
        })
        .collect()
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, String> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| format!("characteristic {} not discovered", uuid))
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self) -> Result<(), BleError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanUnavailable(e.to_string()))?;
        log::info!("Scanning for peripherals");

        // Peripherals the adapter already knows produce no fresh discovery event.
        if let Ok(known) = self.adapter.peripherals().await {
            for peripheral in known {
                report_peripheral(&self.adapter, &peripheral.id(), &self.events_tx, &self.registry)
                    .await;
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<LinkId, BleError> {
        let BleAddress::Platform(key) = &peripheral.address else {
            return Err(BleError::Transport(format!(
                "{} is not a platform address",
                peripheral.address
            )));
        };

        // Held until the task handle is stored, so the task cannot
        // confirm before it is tracked.
        let mut registry = self.registry.lock().await;
        let target = registry
            .discovered
            .get(key)
            .cloned()
            .ok_or_else(|| BleError::Transport(format!("{} was never discovered", key)))?;
        let link = registry.open(target.clone());

        let events_tx = self.events_tx.clone();
        let shared = self.registry.clone();
        let mtu = self.assumed_mtu;
        let task = tokio::spawn(async move {
            let connected = target.connect().await;
            let still_wanted = shared.lock().await.confirm(link);
            if let Err(e) = connected {
                log::warn!("Connect on {} failed: {}", link, e);
                if still_wanted {
                    shared.lock().await.release(link);
                    let _ = events_tx.send(TransportEvent::Disconnected { link });
                }
                return;
            }
            if !still_wanted {
                log::debug!("{} was released while connecting, dropping it", link);
                if let Err(e) = target.disconnect().await {
                    log::debug!("Disconnect on {}: {}", link, e);
                }
                return;
            }

            match target.notifications().await {
                Ok(mut notifications) => {
                    let forward_tx = events_tx.clone();
                    tokio::spawn(async move {
                        while let Some(n) = notifications.next().await {
                            let _ = forward_tx.send(TransportEvent::Notification {
                                link,
                                characteristic: n.uuid,
                                value: n.value,
                            });
                        }
                        log::debug!("Notification stream for {} ended", link);
                    });
                }
                Err(e) => log::warn!("No notification stream for {}: {}", link, e),
            }

            let _ = events_tx.send(TransportEvent::Connected { link, mtu });
        });
        registry.set_connect_task(link, task);
        Ok(link)
    }

    async fn disconnect(&self, link: LinkId) -> Result<(), BleError> {
        let Some(target) = self.registry.lock().await.release(link) else {
            return Ok(());
        };
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = target.disconnect().await {
                log::debug!("Disconnect on {}: {}", link, e);
            }
            let _ = events_tx.send(TransportEvent::Disconnected { link });
        });
        Ok(())
    }

    async fn discover_services(&self, link: LinkId) -> Result<(), BleError> {
        let target = self.linked(link).await?;
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = target
                .discover_services()
                .await
                .map(|()| gatt_profile(&target))
                .map_err(|e| e.to_string());
            let _ = events_tx.send(TransportEvent::ServicesDiscovered { link, result });
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        link: LinkId,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let target = self.linked(link).await?;
        let value = value.to_vec();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            // Platforms own the CCCD; btleplug writes it through (un)subscribe.
            let result = async {
                if descriptor != CCCD_UUID {
                    return Err(format!("descriptor {} is not writable here", descriptor));
                }
                let chr = find_characteristic(&target, characteristic)?;
                let written = if value.iter().all(|b| *b == 0) {
                    target.unsubscribe(&chr).await
                } else {
                    target.subscribe(&chr).await
                };
                written.map_err(|e| e.to_string())
            }
            .await;
            let _ = events_tx.send(TransportEvent::DescriptorWritten {
                link,
                characteristic,
                descriptor,
                result,
            });
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        link: LinkId,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError> {
        let target = self.linked(link).await?;
        let value = value.to_vec();
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let chr = find_characteristic(&target, characteristic)?;
                target
                    .write(&chr, &value, write_type)
                    .await
                    .map_err(|e| e.to_string())
            }
            .await;
            let _ = events_tx.send(TransportEvent::CharacteristicWritten {
                link,
                characteristic,
                result,
            });
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        link: LinkId,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        let target = self.linked(link).await?;
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let chr = find_characteristic(&target, characteristic)?;
                target.read(&chr).await.map_err(|e| e.to_string())
            }
            .await;
            let _ = events_tx.send(TransportEvent::CharacteristicRead {
                link,
                characteristic,
                result,
            });
        });
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
