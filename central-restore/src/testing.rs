//! In-memory host doubles for exercising the connection lifecycle without a radio.
//!
//! [`RecordingAdapter`] and the [`FakePeripheral`]s it hands out append every command
//! they receive to one shared log, so a test can assert on the exact order of
//! instructions issued to the host.

use std::sync::{Arc, Mutex, PoisonError};

use btuuid::BluetoothUuid;
use uuid::Uuid;

use crate::capability::{
    AdapterCapability, ConnectionState, PeripheralCapability, PeripheralId, PowerState,
};
use crate::error::{Error, ErrorKind};
use crate::state_machine::MessageConsumer;

/// A command as received by the fake host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Scan(BluetoothUuid),
    StopScan,
    Connect(PeripheralId),
    CancelConnection(PeripheralId),
    DiscoverServices(PeripheralId, BluetoothUuid),
    DiscoverCharacteristics(PeripheralId, BluetoothUuid, BluetoothUuid),
    SetNotify(PeripheralId, BluetoothUuid, bool),
}

type Log = Arc<Mutex<Vec<Recorded>>>;

fn record(log: &Log, command: Recorded) {
    log.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(command);
}

/// A fake adapter that records commands instead of performing them.
///
/// Clones share the command log and power state.
#[derive(Debug, Clone)]
pub struct RecordingAdapter {
    log: Log,
    power: Arc<Mutex<PowerState>>,
}

impl Default for RecordingAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingAdapter {
    /// Creates a powered-on adapter with an empty log.
    pub fn new() -> Self {
        Self {
            log: Arc::default(),
            power: Arc::new(Mutex::new(PowerState::PoweredOn)),
        }
    }

    pub fn set_power_state(&self, power: PowerState) {
        *self.power.lock().unwrap_or_else(PoisonError::into_inner) = power;
    }

    /// Returns a peripheral whose identifier is derived from `n`, sharing this log.
    pub fn peripheral(&self, n: u128) -> FakePeripheral {
        FakePeripheral {
            id: PeripheralId::new(Uuid::from_u128(n)),
            name: None,
            state: ConnectionState::Disconnected,
            log: self.log.clone(),
        }
    }

    /// Every command recorded so far.
    pub fn commands(&self) -> Vec<Recorded> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drains the log.
    pub fn take_commands(&self) -> Vec<Recorded> {
        std::mem::take(&mut *self.log.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl AdapterCapability for RecordingAdapter {
    type Peripheral = FakePeripheral;

    fn power_state(&self) -> PowerState {
        *self.power.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scan(&self, service: &BluetoothUuid) {
        record(&self.log, Recorded::Scan(*service));
    }

    fn stop_scan(&self) {
        record(&self.log, Recorded::StopScan);
    }

    fn connect(&self, peripheral: &FakePeripheral) {
        record(&self.log, Recorded::Connect(peripheral.id));
    }

    fn cancel_connection(&self, peripheral: &FakePeripheral) {
        record(&self.log, Recorded::CancelConnection(peripheral.id));
    }
}

/// A fake peripheral handle. Two handles are equal when their identifiers are.
#[derive(Debug, Clone)]
pub struct FakePeripheral {
    id: PeripheralId,
    name: Option<String>,
    state: ConnectionState,
    log: Log,
}

impl FakePeripheral {
    pub fn id(&self) -> PeripheralId {
        self.id
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the link state reported to the lifecycle, as a restored handle would carry.
    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.state = state;
        self
    }
}

impl PartialEq for FakePeripheral {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FakePeripheral {}

impl PeripheralCapability for FakePeripheral {
    fn identifier(&self) -> PeripheralId {
        self.id
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn discover_services(&self, service: &BluetoothUuid) {
        record(&self.log, Recorded::DiscoverServices(self.id, *service));
    }

    fn discover_characteristics(&self, service: &BluetoothUuid, characteristic: &BluetoothUuid) {
        record(
            &self.log,
            Recorded::DiscoverCharacteristics(self.id, *service, *characteristic),
        );
    }

    fn set_notify(&self, characteristic: &BluetoothUuid, enabled: bool) {
        record(
            &self.log,
            Recorded::SetNotify(self.id, *characteristic, enabled),
        );
    }
}

/// A consumer that keeps everything it is given.
#[derive(Debug, Clone, Default)]
pub struct RecordingConsumer {
    pub messages: Vec<Vec<u8>>,
    pub errors: Vec<Error>,
}

impl RecordingConsumer {
    /// The kinds of the errors received, in order.
    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        self.errors.iter().map(Error::kind).collect()
    }
}

impl MessageConsumer for RecordingConsumer {
    fn on_message_complete(&mut self, message: &[u8]) {
        self.messages.push(message.to_vec());
    }

    fn on_error(&mut self, error: &Error) {
        self.errors.push(error.clone());
    }
}
