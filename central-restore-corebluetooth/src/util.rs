use btuuid::BluetoothUuid;
use central_restore::{ConnectionState, PowerState};
use objc2::rc::Retained;
use objc2_core_bluetooth::{CBManagerState, CBPeripheralState, CBUUID};
use objc2_foundation::NSData;

pub fn to_cbuuid(uuid: &BluetoothUuid) -> Retained<CBUUID> {
    let data = match uuid {
        BluetoothUuid::Uuid16(uuid) => NSData::with_bytes(&uuid.to_be_bytes()),
        BluetoothUuid::Uuid32(uuid) => NSData::with_bytes(&uuid.to_be_bytes()),
        BluetoothUuid::Uuid128(uuid) => NSData::with_bytes(&uuid.to_be_bytes()),
    };
    unsafe { CBUUID::UUIDWithData(&data) }
}

/// Converts a `CBUUID` back, or `None` if its data is not a valid UUID length.
pub fn from_cbuuid(uuid: &CBUUID) -> Option<BluetoothUuid> {
    let data = unsafe { uuid.data() };
    BluetoothUuid::from_be_slice(unsafe { data.as_bytes_unchecked() }).ok()
}

pub fn power_state(state: CBManagerState) -> PowerState {
    match state {
        CBManagerState::Resetting => PowerState::Resetting,
        CBManagerState::Unsupported => PowerState::Unsupported,
        CBManagerState::Unauthorized => PowerState::Unauthorized,
        CBManagerState::PoweredOff => PowerState::PoweredOff,
        CBManagerState::PoweredOn => PowerState::PoweredOn,
        _ => PowerState::Unknown,
    }
}

pub fn connection_state(state: CBPeripheralState) -> ConnectionState {
    match state {
        CBPeripheralState::Connecting => ConnectionState::Connecting,
        CBPeripheralState::Connected => ConnectionState::Connected,
        CBPeripheralState::Disconnecting => ConnectionState::Disconnecting,
        _ => ConnectionState::Disconnected,
    }
}
