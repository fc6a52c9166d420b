//! GATT profile constants and discovered-attribute types
//!
//! The service and characteristic UUIDs must match the peripheral firmware.
//! The descriptor UUID is the Bluetooth SIG Client Characteristic
//! Configuration descriptor.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Primary service exposed by the peripheral firmware.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Read/write/notify characteristic carrying the text messages.
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Client Characteristic Configuration descriptor (0x2902).
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// ATT MTU every link starts with before an exchange.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Opcode + attribute handle prefix of an ATT write request.
pub const ATT_WRITE_OVERHEAD: u16 = 3;

/// Largest characteristic value that fits in one write on a link with `mtu`.
pub fn max_write_len(mtu: u16) -> usize {
    usize::from(mtu.saturating_sub(ATT_WRITE_OVERHEAD))
}

/// Capability flags advertised by a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }

    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    /// Value to write into the CCCD to start receiving updates.
    /// Notifications are preferred; indications are the fallback.
    pub fn cccd_enable_value(&self) -> Option<[u8; 2]> {
        if self.notify {
            Some(ENABLE_NOTIFICATION_VALUE)
        } else if self.indicate {
            Some(ENABLE_INDICATION_VALUE)
        } else {
            None
        }
    }
}

/// A characteristic as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharProperties,
    pub descriptors: Vec<Uuid>,
}

/// A service and its characteristics as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// Locate `characteristic` inside `service` in a discovery result.
pub fn find_characteristic<'a>(
    services: &'a [GattService],
    service: &Uuid,
    characteristic: &Uuid,
) -> Option<&'a GattCharacteristic> {
    services
        .iter()
        .find(|s| &s.uuid == service)
        .and_then(|s| s.characteristic(characteristic))
}

/// The profile the stock peripheral firmware exposes: one service with a
/// single read/write/notify characteristic carrying a CCCD.
pub fn default_profile() -> Vec<GattService> {
    vec![GattService {
        uuid: SERVICE_UUID,
        characteristics: vec![GattCharacteristic {
            uuid: CHARACTERISTIC_UUID,
            properties: CharProperties {
                read: true,
                write: true,
                write_without_response: false,
                notify: true,
                indicate: false,
            },
            descriptors: vec![CCCD_UUID],
        }],
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_constants_match_firmware() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
        assert_eq!(
            CHARACTERISTIC_UUID.to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26a8"
        );
        assert_eq!(CCCD_UUID.to_string(), "00002902-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_max_write_len() {
        assert_eq!(max_write_len(DEFAULT_ATT_MTU), 20);
        assert_eq!(max_write_len(517), 514);
        assert_eq!(max_write_len(2), 0);
    }

    #[test]
    fn test_cccd_value_prefers_notify() {
        let both = CharProperties {
            notify: true,
            indicate: true,
            ..Default::default()
        };
        assert_eq!(both.cccd_enable_value(), Some(ENABLE_NOTIFICATION_VALUE));

        let indicate_only = CharProperties {
            indicate: true,
            ..Default::default()
        };
        assert_eq!(
            indicate_only.cccd_enable_value(),
            Some(ENABLE_INDICATION_VALUE)
        );

        assert_eq!(CharProperties::default().cccd_enable_value(), None);
    }

    #[test]
    fn test_find_characteristic() {
        let profile = default_profile();
        assert!(find_characteristic(&profile, &SERVICE_UUID, &CHARACTERISTIC_UUID).is_some());
        assert!(find_characteristic(&profile, &SERVICE_UUID, &CCCD_UUID).is_none());
        assert!(find_characteristic(&profile, &Uuid::nil(), &CHARACTERISTIC_UUID).is_none());
    }
}
