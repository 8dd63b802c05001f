use btuuid::BluetoothUuid;

use crate::accumulator::Accumulator;
use crate::capability::{PeripheralCapability, PeripheralId};
use crate::event::DiscoveredCharacteristic;

/// Where the connection lifecycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    Scanning,
    Connecting,
    Connected,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribing,
    Streaming,
    Unsubscribing,
    Disconnecting,
}

impl State {
    /// Returns whether the link to the session's peripheral is up.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            State::Connected
                | State::DiscoveringServices
                | State::DiscoveringCharacteristics
                | State::Subscribing
                | State::Streaming
                | State::Unsubscribing
        )
    }
}

/// A discovered characteristic within a [`ServiceDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    uuid: BluetoothUuid,
    is_notifying: bool,
    value: Option<Vec<u8>>,
}

impl CharacteristicDescriptor {
    pub fn uuid(&self) -> &BluetoothUuid {
        &self.uuid
    }

    pub fn is_notifying(&self) -> bool {
        self.is_notifying
    }

    /// The last value received for this characteristic.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

impl From<DiscoveredCharacteristic> for CharacteristicDescriptor {
    fn from(characteristic: DiscoveredCharacteristic) -> Self {
        Self {
            uuid: characteristic.uuid,
            is_notifying: characteristic.is_notifying,
            value: None,
        }
    }
}

/// A discovered service matching the target service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    uuid: BluetoothUuid,
    characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn uuid(&self) -> &BluetoothUuid {
        &self.uuid
    }

    pub fn characteristics(&self) -> &[CharacteristicDescriptor] {
        &self.characteristics
    }
}

/// The single in-flight peripheral session.
///
/// A session is replaced, never cleared in place, when its peripheral connects, so
/// its buffer and descriptors always belong to one connection.
#[derive(Debug, Clone)]
pub struct Session<P> {
    peripheral: P,
    services: Vec<ServiceDescriptor>,
    awaiting_characteristics: usize,
    accumulator: Accumulator,
}

impl<P: PeripheralCapability> Session<P> {
    pub fn new(peripheral: P) -> Self {
        Self {
            peripheral,
            services: Vec::new(),
            awaiting_characteristics: 0,
            accumulator: Accumulator::new(),
        }
    }

    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    pub fn peripheral_id(&self) -> PeripheralId {
        self.peripheral.identifier()
    }

    pub fn is(&self, peripheral: &P) -> bool {
        self.peripheral_id() == peripheral.identifier()
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Bytes received in this session, up to the end-of-message sentinel.
    pub fn buffer(&self) -> &[u8] {
        self.accumulator.bytes()
    }

    pub(crate) fn accumulator_mut(&mut self) -> &mut Accumulator {
        &mut self.accumulator
    }

    /// Records the matching services and how many characteristic discoveries are owed.
    pub(crate) fn set_services(&mut self, services: impl IntoIterator<Item = BluetoothUuid>) {
        self.services = services
            .into_iter()
            .map(|uuid| ServiceDescriptor {
                uuid,
                characteristics: Vec::new(),
            })
            .collect();
        self.awaiting_characteristics = self.services.len();
    }

    /// Records the characteristics discovered for `service` and returns how many
    /// services have yet to answer.
    pub(crate) fn record_characteristics(
        &mut self,
        service: &BluetoothUuid,
        characteristics: Vec<DiscoveredCharacteristic>,
    ) -> usize {
        if let Some(descriptor) = self.services.iter_mut().find(|s| &s.uuid == service) {
            descriptor.characteristics = characteristics.into_iter().map(Into::into).collect();
        }
        self.awaiting_characteristics = self.awaiting_characteristics.saturating_sub(1);
        self.awaiting_characteristics
    }

    fn characteristic_mut(
        &mut self,
        characteristic: &BluetoothUuid,
    ) -> Option<&mut CharacteristicDescriptor> {
        self.services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| &c.uuid == characteristic)
    }

    pub(crate) fn set_notifying(&mut self, characteristic: &BluetoothUuid, is_notifying: bool) {
        if let Some(descriptor) = self.characteristic_mut(characteristic) {
            descriptor.is_notifying = is_notifying;
        }
    }

    pub(crate) fn set_value(&mut self, characteristic: &BluetoothUuid, value: &[u8]) {
        if let Some(descriptor) = self.characteristic_mut(characteristic) {
            descriptor.value = Some(value.to_vec());
        }
    }

    /// Returns whether `characteristic` is currently notifying.
    pub fn is_notifying(&self, characteristic: &BluetoothUuid) -> bool {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .any(|c| &c.uuid == characteristic && c.is_notifying)
    }
}
