//! In-process BLE simulator
//!
//! Provides a simulated radio with scripted peripherals so the client can be
//! driven through every lifecycle path without BLE hardware. Every request
//! is recorded, and responses can be withheld and released on demand to
//! exercise timeouts, contention and mid-operation disconnects.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::gatt::{self, GattService, DEFAULT_ATT_MTU};
use super::transport::{
    BleAddress, BleTransport, LinkId, PeripheralHandle, TransportEvent, WriteKind,
};
use super::BleError;

/// A scripted peripheral living on the simulated radio.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    address: BleAddress,
    name: Option<String>,
    services: Vec<GattService>,
    mtu: u16,
    reachable: bool,
}

impl SimPeripheral {
    /// A peripheral advertising `name` with the stock firmware profile.
    pub fn new(name: &str) -> Self {
        Self {
            address: BleAddress::Simulated(Uuid::new_v4()),
            name: Some(name.to_string()),
            services: gatt::default_profile(),
            mtu: DEFAULT_ATT_MTU,
            reachable: true,
        }
    }

    pub fn unnamed() -> Self {
        Self {
            name: None,
            ..Self::new("")
        }
    }

    pub fn with_services(mut self, services: Vec<GattService>) -> Self {
        self.services = services;
        self
    }

    /// MTU reported once a link comes up.
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Connect attempts fail with an immediate disconnect.
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn handle(&self) -> PeripheralHandle {
        PeripheralHandle {
            address: self.address.clone(),
            name: self.name.clone(),
        }
    }
}

/// A request the client made of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan,
    StopScan,
    Connect(BleAddress),
    Disconnect(LinkId),
    DiscoverServices(LinkId),
    WriteDescriptor {
        link: LinkId,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    WriteCharacteristic {
        link: LinkId,
        characteristic: Uuid,
        value: Vec<u8>,
        kind: WriteKind,
    },
    ReadCharacteristic {
        link: LinkId,
        characteristic: Uuid,
    },
}

/// Which responses are withheld until [`SimTransport::release_held`].
#[derive(Debug, Clone, Copy, Default)]
struct Holds {
    connect: bool,
    discovery: bool,
    acks: bool,
}

struct SimState {
    radio_available: bool,
    scanning: bool,
    peripherals: Vec<SimPeripheral>,
    next_link: u64,
    /// Live links -> index into `peripherals`.
    links: HashMap<LinkId, usize>,
    calls: Vec<TransportCall>,
    holds: Holds,
    held: VecDeque<TransportEvent>,
    fail_writes: bool,
    echo: bool,
    values: HashMap<Uuid, Vec<u8>>,
}

impl SimState {
    fn live(&self, link: LinkId) -> Result<&SimPeripheral, BleError> {
        self.links
            .get(&link)
            .map(|idx| &self.peripherals[*idx])
            .ok_or(BleError::Disconnected)
    }
}

/// A simulated central-role radio.
pub struct SimTransport {
    events_tx: broadcast::Sender<TransportEvent>,
    state: Mutex<SimState>,
}

impl SimTransport {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            events_tx,
            state: Mutex::new(SimState {
                radio_available: true,
                scanning: false,
                peripherals: Vec::new(),
                next_link: 1,
                links: HashMap::new(),
                calls: Vec::new(),
                holds: Holds::default(),
                held: VecDeque::new(),
                fail_writes: false,
                echo: false,
                values: HashMap::new(),
            }),
        })
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Emit `event` now, or park it if that kind of response is on hold.
    fn respond(&self, state: &mut SimState, held: bool, event: TransportEvent) {
        if held {
            state.held.push_back(event);
        } else {
            self.emit(event);
        }
    }

    /// Place a peripheral on the air. It is reported straight away if a
    /// scan is running, otherwise on the next `start_scan`.
    pub async fn add_peripheral(&self, peripheral: SimPeripheral) -> PeripheralHandle {
        let handle = peripheral.handle();
        let mut state = self.state.lock().await;
        state.peripherals.push(peripheral);
        if state.scanning {
            self.emit(TransportEvent::DeviceDiscovered(handle.clone()));
        }
        handle
    }

    pub async fn set_radio_available(&self, available: bool) {
        self.state.lock().await.radio_available = available;
    }

    pub async fn hold_connect(&self, hold: bool) {
        self.state.lock().await.holds.connect = hold;
    }

    pub async fn hold_discovery(&self, hold: bool) {
        self.state.lock().await.holds.discovery = hold;
    }

    /// Withhold descriptor/characteristic write and read acknowledgements.
    pub async fn hold_acks(&self, hold: bool) {
        self.state.lock().await.holds.acks = hold;
    }

    /// Acknowledge every write with a failure status.
    pub async fn fail_writes(&self, fail: bool) {
        self.state.lock().await.fail_writes = fail;
    }

    /// Notify each written value back on the same characteristic, like the
    /// echo sketch commonly flashed on the peripheral.
    pub async fn set_echo(&self, echo: bool) {
        self.state.lock().await.echo = echo;
    }

    /// Emit withheld responses in the order they were produced. Returns how
    /// many were released.
    pub async fn release_held(&self) -> usize {
        let mut state = self.state.lock().await;
        let held: Vec<TransportEvent> = state.held.drain(..).collect();
        let count = held.len();
        for event in held {
            self.emit(event);
        }
        count
    }

    pub async fn held_count(&self) -> usize {
        self.state.lock().await.held.len()
    }

    pub async fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.scanning
    }

    pub async fn live_links(&self) -> Vec<LinkId> {
        let mut links: Vec<LinkId> = self.state.lock().await.links.keys().copied().collect();
        links.sort();
        links
    }

    /// The peripheral pushes a notification on every live link.
    pub async fn notify(&self, characteristic: Uuid, value: &[u8]) {
        let state = self.state.lock().await;
        let mut links: Vec<LinkId> = state.links.keys().copied().collect();
        links.sort();
        for link in links {
            self.emit(TransportEvent::Notification {
                link,
                characteristic,
                value: value.to_vec(),
            });
        }
    }

    /// Push `values` back to back on every live link without yielding, as a
    /// chatty peripheral does when the central falls behind.
    pub async fn notify_burst(&self, characteristic: Uuid, values: &[Vec<u8>]) {
        let state = self.state.lock().await;
        let mut links: Vec<LinkId> = state.links.keys().copied().collect();
        links.sort();
        for value in values {
            for link in &links {
                self.emit(TransportEvent::Notification {
                    link: *link,
                    characteristic,
                    value: value.clone(),
                });
            }
        }
    }

    /// The peripheral drops every live link (power loss, out of range).
    pub async fn drop_links(&self) {
        let mut state = self.state.lock().await;
        let mut links: Vec<LinkId> = state.links.drain().map(|(link, _)| link).collect();
        links.sort();
        for link in links {
            self.emit(TransportEvent::Disconnected { link });
        }
    }

    /// Last value written to `characteristic` on any link.
    pub async fn value(&self, characteristic: Uuid) -> Option<Vec<u8>> {
        self.state.lock().await.values.get(&characteristic).cloned()
    }
}

#[async_trait]
impl BleTransport for SimTransport {
    async fn start_scan(&self) -> Result<(), BleError> {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::StartScan);
        if !state.radio_available {
            return Err(BleError::ScanUnavailable(
                "simulated radio is switched off".to_string(),
            ));
        }
        state.scanning = true;
        for peripheral in &state.peripherals {
            self.emit(TransportEvent::DeviceDiscovered(peripheral.handle()));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::StopScan);
        state.scanning = false;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<LinkId, BleError> {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::Connect(peripheral.address.clone()));
        if !state.radio_available {
            return Err(BleError::Transport("simulated radio is switched off".to_string()));
        }
        let idx = state
            .peripherals
            .iter()
            .position(|p| p.address == peripheral.address)
            .ok_or_else(|| {
                BleError::Transport(format!("No peripheral at {}", peripheral.address))
            })?;

        let link = LinkId(state.next_link);
        state.next_link += 1;

        let (reachable, mtu) = {
            let target = &state.peripherals[idx];
            (target.reachable, target.mtu)
        };
        let event = if reachable {
            state.links.insert(link, idx);
            TransportEvent::Connected { link, mtu }
        } else {
            TransportEvent::Disconnected { link }
        };
        let hold = state.holds.connect;
        self.respond(&mut state, hold, event);
        Ok(link)
    }

    async fn disconnect(&self, link: LinkId) -> Result<(), BleError> {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::Disconnect(link));
        state.held.retain(|event| event.link() != Some(link));
        if state.links.remove(&link).is_some() {
            self.emit(TransportEvent::Disconnected { link });
        }
        Ok(())
    }

    async fn discover_services(&self, link: LinkId) -> Result<(), BleError> {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::DiscoverServices(link));
        let services = state.live(link)?.services.clone();
        let hold = state.holds.discovery;
        self.respond(
            &mut state,
            hold,
            TransportEvent::ServicesDiscovered {
                link,
                result: Ok(services),
            },
        );
        Ok(())
    }

    async fn write_descriptor(
        &self,
        link: LinkId,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::WriteDescriptor {
            link,
            characteristic,
            descriptor,
            value: value.to_vec(),
        });
        state.live(link)?;
        let result = if state.fail_writes {
            Err("GATT write failed (simulated)".to_string())
        } else {
            Ok(())
        };
        let hold = state.holds.acks;
        self.respond(
            &mut state,
            hold,
            TransportEvent::DescriptorWritten {
                link,
                characteristic,
                descriptor,
                result,
            },
        );
        Ok(())
    }

    async fn write_characteristic(
        &self,
        link: LinkId,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError> {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::WriteCharacteristic {
            link,
            characteristic,
            value: value.to_vec(),
            kind,
        });
        state.live(link)?;
        let result = if state.fail_writes {
            Err("GATT write failed (simulated)".to_string())
        } else {
            state.values.insert(characteristic, value.to_vec());
            Ok(())
        };
        let echo = state.echo && result.is_ok();
        let hold = state.holds.acks;
        self.respond(
            &mut state,
            hold,
            TransportEvent::CharacteristicWritten {
                link,
                characteristic,
                result,
            },
        );
        if echo {
            self.respond(
                &mut state,
                hold,
                TransportEvent::Notification {
                    link,
                    characteristic,
                    value: value.to_vec(),
                },
            );
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        link: LinkId,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::ReadCharacteristic {
            link,
            characteristic,
        });
        state.live(link)?;
        let value = state.values.get(&characteristic).cloned().unwrap_or_default();
        let hold = state.holds.acks;
        self.respond(
            &mut state,
            hold,
            TransportEvent::CharacteristicRead {
                link,
                characteristic,
                result: Ok(value),
            },
        );
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
