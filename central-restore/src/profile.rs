use btuuid::{BluetoothUuid, BluetoothUuid128};

/// The service advertised by transfer peripherals.
pub const TRANSFER_SERVICE_UUID: BluetoothUuid =
    BluetoothUuid::Uuid128(BluetoothUuid128::new(0xE20A39F4_73F5_4BC4_A12F_17D1AD666661));

/// The notifying characteristic that carries message fragments.
pub const TRANSFER_CHARACTERISTIC_UUID: BluetoothUuid =
    BluetoothUuid::Uuid128(BluetoothUuid128::new(0x08590F7E_DB05_467E_8757_72F6F66666D4));

/// Marks the end of a message split across several notifications.
pub const END_OF_MESSAGE: &str = "EOM";

/// Largest payload a peer is expected to send per notification.
pub const NOTIFY_MTU: usize = 20;

/// The GATT layout a [`ConnectionStateMachine`](crate::ConnectionStateMachine) looks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// Service that must be advertised and discovered.
    pub service: BluetoothUuid,
    /// Characteristic to subscribe to within `service`.
    pub characteristic: BluetoothUuid,
    /// Text that terminates a message.
    pub end_of_message: String,
    /// Advisory notification size; larger updates are accepted but logged.
    pub notify_mtu: usize,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            service: TRANSFER_SERVICE_UUID,
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            end_of_message: END_OF_MESSAGE.to_owned(),
            notify_mtu: NOTIFY_MTU,
        }
    }
}

impl Profile {
    /// Returns whether `text` is exactly the end-of-message sentinel.
    pub fn is_end_of_message(&self, text: &str) -> bool {
        text == self.end_of_message
    }

    /// Returns whether an advertisement lists the target service.
    pub fn is_advertised(&self, services: &[BluetoothUuid]) -> bool {
        services.contains(&self.service)
    }
}
