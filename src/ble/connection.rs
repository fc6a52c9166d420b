//! Connection lifecycle
//!
//! `Connection` is the single owner of the transport link and the
//! characteristic handle discovered on it. All state changes go through
//! [`Connection::transition`], which only admits the edges of the
//! lifecycle graph:
//!
//! ```text
//! Idle -> Connecting -> ServiceDiscovery -> EnablingNotify -> Ready
//!   ^________________________|________________|_______________|   (disconnect / error)
//! any non-terminal state -> Closed                                 (explicit teardown)
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::gatt::{self, CharProperties, GattService, DEFAULT_ATT_MTU};
use super::transport::{LinkId, PeripheralHandle};
use super::BleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Idle,
    Connecting,
    ServiceDiscovery,
    EnablingNotify,
    Ready,
    Closed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        self == LinkState::Closed
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Connecting)
            | (Connecting, ServiceDiscovery)
            | (ServiceDiscovery, EnablingNotify)
            | (EnablingNotify, Ready) => true,
            (Connecting | ServiceDiscovery | EnablingNotify | Ready, Idle) => true,
            _ => false,
        }
    }
}

/// The target characteristic on one specific link.
///
/// Only meaningful while the link it was discovered on is alive; the owning
/// [`Connection`] rejects it with [`BleError::StaleHandle`] afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharProperties,
    pub has_cccd: bool,
    link: LinkId,
}

impl CharacteristicHandle {
    pub fn link(&self) -> LinkId {
        self.link
    }
}

#[derive(Debug)]
pub struct Connection {
    state: LinkState,
    peripheral: Option<PeripheralHandle>,
    link: Option<LinkId>,
    characteristic: Option<CharacteristicHandle>,
    mtu: u16,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: LinkState::Idle,
            peripheral: None,
            link: None,
            characteristic: None,
            mtu: DEFAULT_ATT_MTU,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.peripheral.as_ref()
    }

    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn characteristic(&self) -> Option<&CharacteristicHandle> {
        self.characteristic.as_ref()
    }

    /// Whether `link` is the live transport handle of this connection.
    pub fn owns(&self, link: LinkId) -> bool {
        self.link == Some(link)
    }

    pub fn transition(&mut self, next: LinkState) -> Result<(), BleError> {
        if !self.state.can_transition_to(next) {
            return Err(BleError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!("Link state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// `Idle -> Connecting` on a freshly issued link. The caller must have
    /// released any previous link via [`Connection::release`] first.
    pub fn begin_connect(
        &mut self,
        peripheral: PeripheralHandle,
        link: LinkId,
    ) -> Result<(), BleError> {
        if self.link.is_some() {
            return Err(BleError::InvalidState(
                "previous transport handle still held".to_string(),
            ));
        }
        self.transition(LinkState::Connecting)?;
        self.peripheral = Some(peripheral);
        self.link = Some(link);
        self.mtu = DEFAULT_ATT_MTU;
        Ok(())
    }

    /// `Connecting -> ServiceDiscovery`.
    pub fn on_connected(&mut self, mtu: u16) -> Result<(), BleError> {
        self.transition(LinkState::ServiceDiscovery)?;
        self.mtu = mtu;
        Ok(())
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    /// `ServiceDiscovery -> EnablingNotify` when the discovery result holds
    /// a subscribable target characteristic. Otherwise the state is left
    /// untouched and `TargetNotFound` is returned for the caller to tear down.
    pub fn on_services_discovered(
        &mut self,
        services: &[GattService],
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle, BleError> {
        if self.state != LinkState::ServiceDiscovery {
            return Err(BleError::IllegalTransition {
                from: self.state,
                to: LinkState::EnablingNotify,
            });
        }
        let link = self.link.ok_or(BleError::Disconnected)?;

        if !services.iter().any(|s| s.uuid == service) {
            return Err(BleError::TargetNotFound(format!("service {} missing", service)));
        }
        let found = gatt::find_characteristic(services, &service, &characteristic)
            .ok_or_else(|| {
                BleError::TargetNotFound(format!("characteristic {} missing", characteristic))
            })?;
        if !found.properties.can_subscribe() {
            return Err(BleError::TargetNotFound(format!(
                "characteristic {} supports neither notify nor indicate",
                characteristic
            )));
        }

        let handle = CharacteristicHandle {
            service,
            uuid: characteristic,
            properties: found.properties,
            has_cccd: found.descriptors.contains(&gatt::CCCD_UUID),
            link,
        };
        self.transition(LinkState::EnablingNotify)?;
        self.characteristic = Some(handle.clone());
        Ok(handle)
    }

    /// `EnablingNotify -> Ready` once the CCCD write is acknowledged.
    pub fn on_notify_enabled(&mut self) -> Result<(), BleError> {
        self.transition(LinkState::Ready)
    }

    /// Check that `handle` was issued for the link that is live right now.
    pub fn validate(&self, handle: &CharacteristicHandle) -> Result<(), BleError> {
        match &self.characteristic {
            Some(current) if current.link == handle.link && self.owns(handle.link) => Ok(()),
            _ => Err(BleError::StaleHandle),
        }
    }

    /// The characteristic to use for application I/O; only available in `Ready`.
    pub fn ready_characteristic(&self) -> Result<&CharacteristicHandle, BleError> {
        if self.state != LinkState::Ready {
            return Err(BleError::NotReady);
        }
        self.characteristic.as_ref().ok_or(BleError::NotReady)
    }

    /// Return to `Idle`, dropping the characteristic handle and handing the
    /// released link back so the caller can disconnect it. The peripheral
    /// identity is kept for reconnection.
    pub fn release(&mut self) -> Result<Option<LinkId>, BleError> {
        if self.state != LinkState::Idle {
            self.transition(LinkState::Idle)?;
        }
        self.characteristic = None;
        self.mtu = DEFAULT_ATT_MTU;
        Ok(self.link.take())
    }

    /// Terminal teardown. Returns the link that was live, if any.
    pub fn close(&mut self) -> Result<Option<LinkId>, BleError> {
        self.transition(LinkState::Closed)?;
        self.characteristic = None;
        Ok(self.link.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{default_profile, CHARACTERISTIC_UUID, SERVICE_UUID};
    use crate::ble::transport::BleAddress;

    const ALL: [LinkState; 6] = [
        LinkState::Idle,
        LinkState::Connecting,
        LinkState::ServiceDiscovery,
        LinkState::EnablingNotify,
        LinkState::Ready,
        LinkState::Closed,
    ];

    fn peripheral() -> PeripheralHandle {
        PeripheralHandle::new(BleAddress::Simulated(Uuid::nil()), "ESP32")
    }

    fn ready_connection(link: LinkId) -> Connection {
        let mut conn = Connection::new();
        conn.begin_connect(peripheral(), link).unwrap();
        conn.on_connected(185).unwrap();
        conn.on_services_discovered(&default_profile(), SERVICE_UUID, CHARACTERISTIC_UUID)
            .unwrap();
        conn.on_notify_enabled().unwrap();
        conn
    }

    #[test]
    fn test_edge_table() {
        let allowed: Vec<(LinkState, LinkState)> = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        use LinkState::*;
        let expected = vec![
            (Idle, Connecting),
            (Idle, Closed),
            (Connecting, Idle),
            (Connecting, ServiceDiscovery),
            (Connecting, Closed),
            (ServiceDiscovery, Idle),
            (ServiceDiscovery, EnablingNotify),
            (ServiceDiscovery, Closed),
            (EnablingNotify, Idle),
            (EnablingNotify, Ready),
            (EnablingNotify, Closed),
            (Ready, Idle),
            (Ready, Closed),
        ];
        assert_eq!(allowed, expected);
    }

    #[test]
    fn test_happy_path() {
        let conn = ready_connection(LinkId(1));
        assert_eq!(conn.state(), LinkState::Ready);
        assert_eq!(conn.mtu(), 185);
        let handle = conn.ready_characteristic().unwrap();
        assert_eq!(handle.uuid, CHARACTERISTIC_UUID);
        assert!(handle.has_cccd);
        assert!(conn.validate(handle).is_ok());
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        let mut conn = Connection::new();
        assert_eq!(
            conn.on_connected(23),
            Err(BleError::IllegalTransition {
                from: LinkState::Idle,
                to: LinkState::ServiceDiscovery
            })
        );
        assert_eq!(conn.state(), LinkState::Idle);

        conn.begin_connect(peripheral(), LinkId(1)).unwrap();
        assert!(conn.on_notify_enabled().is_err());
        assert_eq!(conn.state(), LinkState::Connecting);
    }

    #[test]
    fn test_missing_service_is_target_not_found() {
        let mut conn = Connection::new();
        conn.begin_connect(peripheral(), LinkId(1)).unwrap();
        conn.on_connected(23).unwrap();

        let result = conn.on_services_discovered(&[], SERVICE_UUID, CHARACTERISTIC_UUID);
        assert!(matches!(result, Err(BleError::TargetNotFound(_))));
        assert_eq!(conn.state(), LinkState::ServiceDiscovery);
    }

    #[test]
    fn test_unsubscribable_characteristic_is_target_not_found() {
        let mut profile = default_profile();
        profile[0].characteristics[0].properties.notify = false;

        let mut conn = Connection::new();
        conn.begin_connect(peripheral(), LinkId(1)).unwrap();
        conn.on_connected(23).unwrap();
        let result = conn.on_services_discovered(&profile, SERVICE_UUID, CHARACTERISTIC_UUID);
        assert!(matches!(result, Err(BleError::TargetNotFound(_))));
    }

    #[test]
    fn test_release_invalidates_handle() {
        let mut conn = ready_connection(LinkId(1));
        let handle = conn.ready_characteristic().unwrap().clone();

        let released = conn.release().unwrap();
        assert_eq!(released, Some(LinkId(1)));
        assert_eq!(conn.state(), LinkState::Idle);
        assert_eq!(conn.validate(&handle), Err(BleError::StaleHandle));
        assert_eq!(conn.ready_characteristic().err(), Some(BleError::NotReady));
        assert_eq!(conn.peripheral(), Some(&peripheral()));

        // A handle from the old link stays stale on the next link as well.
        conn.begin_connect(peripheral(), LinkId(2)).unwrap();
        conn.on_connected(23).unwrap();
        conn.on_services_discovered(&default_profile(), SERVICE_UUID, CHARACTERISTIC_UUID)
            .unwrap();
        assert_eq!(conn.validate(&handle), Err(BleError::StaleHandle));
    }

    #[test]
    fn test_second_link_requires_release() {
        let mut conn = Connection::new();
        conn.begin_connect(peripheral(), LinkId(1)).unwrap();
        // Force back to Idle without releasing the handle.
        conn.transition(LinkState::Idle).unwrap();
        assert!(matches!(
            conn.begin_connect(peripheral(), LinkId(2)),
            Err(BleError::InvalidState(_))
        ));
        conn.release().unwrap();
        conn.begin_connect(peripheral(), LinkId(2)).unwrap();
        assert!(conn.owns(LinkId(2)));
        assert!(!conn.owns(LinkId(1)));
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut conn = ready_connection(LinkId(3));
        assert_eq!(conn.close().unwrap(), Some(LinkId(3)));
        assert!(conn.state().is_terminal());
        for next in ALL {
            assert!(conn.transition(next).is_err());
        }
        assert!(conn.release().is_err());
    }
}
