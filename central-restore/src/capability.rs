//! The host Bluetooth stack, as seen by the connection lifecycle.
//!
//! Every method here is fire-and-forget: results are reported later through
//! [`Event`](crate::Event)s rather than returned.

use btuuid::BluetoothUuid;
use uuid::Uuid;

/// Opaque identity of a remote peripheral, stable within one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeripheralId(Uuid);

impl PeripheralId {
    pub const fn new(uuid: Uuid) -> Self {
        PeripheralId(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for PeripheralId {
    fn from(uuid: Uuid) -> Self {
        PeripheralId(uuid)
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// The power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl PowerState {
    /// Returns whether existing connections and scans are lost in this state.
    ///
    /// A reset counts: the host drops its links and comes back with a fresh power-on.
    pub fn is_unusable(self) -> bool {
        matches!(
            self,
            PowerState::Resetting
                | PowerState::Unsupported
                | PowerState::Unauthorized
                | PowerState::PoweredOff
        )
    }
}

/// The link state of a peripheral as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A handle to a discovered remote device.
pub trait PeripheralCapability: Clone {
    /// The peripheral's identity.
    fn identifier(&self) -> PeripheralId;

    /// The advertised or cached name, if any.
    fn name(&self) -> Option<String> {
        None
    }

    /// The current link state.
    fn state(&self) -> ConnectionState;

    /// Discovers the services matching `service`.
    fn discover_services(&self, service: &BluetoothUuid);

    /// Discovers `characteristic` within the previously discovered `service`.
    fn discover_characteristics(&self, service: &BluetoothUuid, characteristic: &BluetoothUuid);

    /// Enables or disables notifications for `characteristic`.
    fn set_notify(&self, characteristic: &BluetoothUuid, enabled: bool);
}

/// The local central-role adapter.
pub trait AdapterCapability {
    type Peripheral: PeripheralCapability;

    /// The current power state.
    fn power_state(&self) -> PowerState;

    /// Starts scanning for peripherals advertising `service`.
    fn scan(&self, service: &BluetoothUuid);

    /// Stops scanning.
    fn stop_scan(&self);

    /// Starts connecting to `peripheral`.
    fn connect(&self, peripheral: &Self::Peripheral);

    /// Cancels an active or pending connection to `peripheral`.
    fn cancel_connection(&self, peripheral: &Self::Peripheral);
}
