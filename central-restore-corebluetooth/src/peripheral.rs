use btuuid::BluetoothUuid;
use central_restore::{
    ConnectionState, DiscoveredCharacteristic, PeripheralCapability, PeripheralId,
};
use objc2::rc::{Retained, RetainedFromIterator};
use objc2_core_bluetooth::{CBCharacteristic, CBPeripheral, CBService};
use objc2_foundation::NSArray;
use tracing::warn;
use uuid::Uuid;

use crate::util::{connection_state, from_cbuuid, to_cbuuid};

/// A `CBPeripheral` handle.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CoreBluetoothPeripheral {
    pub(crate) peripheral: Retained<CBPeripheral>,
}

impl std::fmt::Debug for CoreBluetoothPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreBluetoothPeripheral")
            .field("identifier", &self.identifier())
            .finish()
    }
}

impl CoreBluetoothPeripheral {
    pub(crate) fn new(peripheral: Retained<CBPeripheral>) -> Self {
        CoreBluetoothPeripheral { peripheral }
    }

    fn service(&self, uuid: &BluetoothUuid) -> Option<Retained<CBService>> {
        unsafe { self.peripheral.services() }?
            .into_iter()
            .find(|service| from_cbuuid(&unsafe { service.UUID() }).as_ref() == Some(uuid))
    }

    fn characteristic(&self, uuid: &BluetoothUuid) -> Option<Retained<CBCharacteristic>> {
        unsafe { self.peripheral.services() }?
            .into_iter()
            .flat_map(|service| unsafe { service.characteristics() })
            .flatten()
            .find(|characteristic| {
                from_cbuuid(&unsafe { characteristic.UUID() }).as_ref() == Some(uuid)
            })
    }

    /// The UUIDs of the services discovered so far.
    pub(crate) fn service_uuids(&self) -> Vec<BluetoothUuid> {
        unsafe { self.peripheral.services() }
            .into_iter()
            .flatten()
            .filter_map(|service| from_cbuuid(&unsafe { service.UUID() }))
            .collect()
    }
}

pub(crate) fn characteristics_of(service: &CBService) -> Vec<DiscoveredCharacteristic> {
    unsafe { service.characteristics() }
        .into_iter()
        .flatten()
        .filter_map(|characteristic| {
            Some(DiscoveredCharacteristic {
                uuid: from_cbuuid(&unsafe { characteristic.UUID() })?,
                is_notifying: unsafe { characteristic.isNotifying() },
            })
        })
        .collect()
}

impl PeripheralCapability for CoreBluetoothPeripheral {
    fn identifier(&self) -> PeripheralId {
        let uuid = unsafe { self.peripheral.identifier() };
        PeripheralId::new(Uuid::from_bytes(uuid.as_bytes()))
    }

    fn name(&self) -> Option<String> {
        let name = unsafe { self.peripheral.name() };
        name.map(|x| x.to_string())
    }

    fn state(&self) -> ConnectionState {
        connection_state(unsafe { self.peripheral.state() })
    }

    fn discover_services(&self, service: &BluetoothUuid) {
        let services = NSArray::retained_from_iter(std::iter::once(to_cbuuid(service)));
        unsafe { self.peripheral.discoverServices(Some(&services)) };
    }

    fn discover_characteristics(&self, service: &BluetoothUuid, characteristic: &BluetoothUuid) {
        let Some(service) = self.service(service) else {
            warn!(?service, "service not discovered, skipping characteristic discovery");
            return;
        };

        let characteristics = NSArray::retained_from_iter(std::iter::once(to_cbuuid(characteristic)));
        unsafe {
            self.peripheral
                .discoverCharacteristics_forService(Some(&characteristics), &service)
        };
    }

    fn set_notify(&self, characteristic: &BluetoothUuid, enabled: bool) {
        let Some(characteristic) = self.characteristic(characteristic) else {
            warn!(?characteristic, "characteristic not discovered, cannot set notify");
            return;
        };

        unsafe {
            self.peripheral
                .setNotifyValue_forCharacteristic(enabled, &characteristic)
        };
    }
}
