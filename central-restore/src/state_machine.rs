//! The connection lifecycle: one serialized actor, one session at a time.

use btuuid::BluetoothUuid;
use futures_lite::StreamExt;
use tracing::{debug, info, warn};

use crate::accumulator::Accumulated;
use crate::capability::{AdapterCapability, PeripheralCapability, PowerState};
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Command, DiscoveredCharacteristic, Event, EventReceiver};
use crate::profile::Profile;
use crate::session::{Session, State};

/// Receives the output of a [`ConnectionStateMachine`].
#[allow(unused_variables)]
pub trait MessageConsumer {
    /// Called once per message, with the sentinel stripped.
    fn on_message_complete(&mut self, message: &[u8]);

    /// Called for errors that did not stop the lifecycle.
    fn on_error(&mut self, error: &Error) {}
}

impl<F: FnMut(&[u8])> MessageConsumer for F {
    fn on_message_complete(&mut self, message: &[u8]) {
        self(message)
    }
}

/// Something a transition produced for the consumer rather than the host.
#[derive(Debug, Clone)]
pub enum Notice {
    MessageComplete(Vec<u8>),
    Error(Error),
}

/// The result of one transition.
#[derive(Debug, Clone)]
pub struct Step<P> {
    pub commands: Vec<Command<P>>,
    pub notices: Vec<Notice>,
}

impl<P> Default for Step<P> {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            notices: Vec::new(),
        }
    }
}

impl<P> Step<P> {
    fn command(&mut self, command: Command<P>) {
        self.commands.push(command);
    }

    fn notice(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    fn error(&mut self, error: Error) {
        self.notices.push(Notice::Error(error));
    }
}

/// The transition function of the connection lifecycle.
///
/// `Machine` never talks to the host. Each call applies one input and returns the
/// [`Step`] to carry out; [`ConnectionStateMachine`] is the driver that does so.
#[derive(Debug, Clone)]
pub struct Machine<P> {
    profile: Profile,
    state: State,
    session: Option<Session<P>>,
    // Connects issued for restored peripherals that do not own the session.
    pending: Vec<P>,
    message: Option<Vec<u8>>,
}

impl<P: PeripheralCapability> Machine<P> {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            state: State::Idle,
            session: None,
            pending: Vec::new(),
            message: None,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn session(&self) -> Option<&Session<P>> {
        self.session.as_ref()
    }

    /// The last completed message.
    ///
    /// It stays available until the next session connects.
    pub fn message(&self) -> Option<&[u8]> {
        self.message.as_deref()
    }

    /// Restored peripherals with a connect in flight that do not own the session.
    pub fn pending(&self) -> &[P] {
        &self.pending
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state transition");
            self.state = state;
        }
    }

    fn is_session(&self, peripheral: &P) -> bool {
        self.session.as_ref().is_some_and(|s| s.is(peripheral))
    }

    fn take_pending(&mut self, peripheral: &P) -> Option<P> {
        let id = peripheral.identifier();
        let index = self.pending.iter().position(|p| p.identifier() == id)?;
        Some(self.pending.remove(index))
    }

    fn scan(&mut self, step: &mut Step<P>) {
        info!("started scanning");
        step.command(Command::Scan {
            service: self.profile.service,
        });
        self.set_state(State::Scanning);
    }

    /// Starts scanning unless a session exists.
    ///
    /// While the adapter is not powered on this only waits; the power-on event starts
    /// the scan.
    pub fn start(&mut self, power: PowerState) -> Result<Step<P>> {
        if let Some(session) = &self.session {
            warn!(peripheral = %session.peripheral_id(), state = ?self.state, "scan rejected, session active");
            return Err(ErrorKind::SessionActive.into());
        }

        let mut step = Step::default();
        match self.state {
            State::Scanning => debug!("already scanning"),
            _ if power != PowerState::PoweredOn => {
                debug!(?power, "waiting for the adapter to power on")
            }
            _ => self.scan(&mut step),
        }
        Ok(step)
    }

    /// Reattaches to peripherals the host kept on the process's behalf.
    ///
    /// Connects are issued for every peripheral without scanning. The first becomes the
    /// session; the others stay pending until one of them connects first.
    pub fn restore(&mut self, peripherals: Vec<P>) -> Result<Step<P>> {
        if self.state != State::Idle || self.session.is_some() {
            warn!(state = ?self.state, "restore rejected, lifecycle already running");
            return Err(ErrorKind::AlreadyStarted.into());
        }

        let mut step = Step::default();
        let mut peripherals = peripherals.into_iter();
        let Some(first) = peripherals.next() else {
            return Ok(step);
        };

        for peripheral in std::iter::once(&first).chain(peripherals.as_slice()) {
            info!(
                peripheral = %peripheral.identifier(),
                host_state = ?peripheral.state(),
                "restoring peripheral"
            );
            step.command(Command::Connect(peripheral.clone()));
        }

        self.pending.extend(peripherals);
        self.session = Some(Session::new(first));
        self.set_state(State::Connecting);
        Ok(step)
    }

    /// Tears the session down cooperatively.
    ///
    /// Does nothing unless connected. If the target characteristic is notifying it is
    /// unsubscribed first and the disconnect follows the confirmation; otherwise the
    /// connection is cancelled directly.
    pub fn cleanup(&mut self) -> Step<P> {
        let mut step = Step::default();
        self.teardown(&mut step);
        step
    }

    fn teardown(&mut self, step: &mut Step<P>) {
        let Some(session) = &self.session else {
            return;
        };

        if !self.state.is_connected() {
            debug!(state = ?self.state, "teardown skipped, not connected");
            return;
        }

        if self.state == State::Unsubscribing {
            debug!("teardown already in progress");
            return;
        }

        let peripheral = session.peripheral().clone();
        let characteristic = self.profile.characteristic;
        if session.is_notifying(&characteristic) {
            info!(peripheral = %peripheral.identifier(), "unsubscribing before disconnect");
            step.command(Command::SetNotify {
                peripheral,
                characteristic,
                enabled: false,
            });
            self.set_state(State::Unsubscribing);
        } else {
            self.disconnect(peripheral, step);
        }
    }

    fn disconnect(&mut self, peripheral: P, step: &mut Step<P>) {
        info!(peripheral = %peripheral.identifier(), "disconnecting");
        step.command(Command::CancelConnection(peripheral));
        self.set_state(State::Disconnecting);
    }

    /// Applies one event.
    pub fn handle(&mut self, event: Event<P>) -> Step<P> {
        let mut step = Step::default();
        match event {
            Event::PowerStateChanged(power) => self.on_power_state(power, &mut step),
            Event::Discovered {
                peripheral,
                services,
                rssi,
            } => self.on_discovered(peripheral, &services, rssi, &mut step),
            Event::Connected(peripheral) => self.on_connected(peripheral, &mut step),
            Event::ConnectFailed { peripheral, error } => {
                self.on_connect_failed(peripheral, error, &mut step)
            }
            Event::Disconnected { peripheral, error } => {
                self.on_disconnected(peripheral, error, &mut step)
            }
            Event::RestoreState(peripherals) => match self.restore(peripherals) {
                Ok(restored) => step = restored,
                Err(error) => debug!(%error, "ignoring restore state"),
            },
            Event::ServicesDiscovered { peripheral, result } => {
                self.on_services_discovered(peripheral, result, &mut step)
            }
            Event::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => self.on_characteristics_discovered(peripheral, service, result, &mut step),
            Event::NotifyStateChanged {
                peripheral,
                characteristic,
                result,
            } => self.on_notify_state_changed(peripheral, characteristic, result, &mut step),
            Event::ValueUpdated {
                peripheral,
                characteristic,
                result,
            } => self.on_value_updated(peripheral, characteristic, result, &mut step),
        }
        step
    }

    fn on_power_state(&mut self, power: PowerState, step: &mut Step<P>) {
        debug!(?power, "adapter power state changed");
        if power == PowerState::PoweredOn {
            if self.state == State::Idle && self.session.is_none() {
                self.scan(step);
            }
        } else if power.is_unusable() && self.state != State::Idle {
            // The host drops every connection and scan on its own.
            self.pending.clear();
            if let Some(session) = self.session.take() {
                warn!(peripheral = %session.peripheral_id(), ?power, "session lost");
                step.error(ErrorKind::PoweredOff.into());
            }
            self.set_state(State::Idle);
        }
    }

    fn on_discovered(
        &mut self,
        peripheral: P,
        services: &[BluetoothUuid],
        rssi: i16,
        step: &mut Step<P>,
    ) {
        let id = peripheral.identifier();
        debug!(peripheral = %id, name = ?peripheral.name(), rssi, "discovered peripheral");

        if self.is_session(&peripheral) {
            debug!(peripheral = %id, "already sessioned, ignoring");
            return;
        }

        if self.state != State::Scanning {
            debug!(peripheral = %id, state = ?self.state, "not scanning, ignoring");
            return;
        }

        if !self.profile.is_advertised(services) {
            debug!(peripheral = %id, "target service not advertised, ignoring");
            return;
        }

        if self.pending.iter().any(|p| p.identifier() == id) {
            debug!(peripheral = %id, "connect already pending, ignoring");
            return;
        }

        info!(peripheral = %id, "connecting to peripheral");
        step.command(Command::Connect(peripheral.clone()));
        self.session = Some(Session::new(peripheral));
        self.set_state(State::Connecting);
    }

    fn on_connected(&mut self, peripheral: P, step: &mut Step<P>) {
        let id = peripheral.identifier();

        if self.is_session(&peripheral) {
            if self.state != State::Connecting {
                debug!(peripheral = %id, state = ?self.state, "duplicate connection event");
                return;
            }
        } else if self.take_pending(&peripheral).is_some() {
            if !matches!(self.state, State::Connecting | State::Scanning) {
                warn!(peripheral = %id, state = ?self.state, "restored peripheral connected while busy");
                step.command(Command::CancelConnection(peripheral));
                return;
            }
            // A restored peripheral won the race; the session's connect is abandoned.
            if let Some(session) = self.session.take() {
                info!(peripheral = %session.peripheral_id(), "abandoning pending connect");
                step.command(Command::CancelConnection(session.peripheral().clone()));
            }
        } else {
            warn!(peripheral = %id, "unexpected connection, cancelling");
            step.command(Command::CancelConnection(peripheral));
            return;
        }

        info!(peripheral = %id, "peripheral connected");
        self.set_state(State::Connected);

        step.command(Command::StopScan);
        for peripheral in self.pending.drain(..) {
            step.command(Command::CancelConnection(peripheral));
        }

        // Fresh session: the previous buffer and message are gone.
        self.session = Some(Session::new(peripheral.clone()));
        self.message = None;

        step.command(Command::DiscoverServices {
            peripheral,
            service: self.profile.service,
        });
        self.set_state(State::DiscoveringServices);
    }

    fn on_connect_failed(&mut self, peripheral: P, error: Error, step: &mut Step<P>) {
        let id = peripheral.identifier();
        let error = error.with_kind(ErrorKind::ConnectFailed);

        if self.take_pending(&peripheral).is_some() {
            warn!(peripheral = %id, %error, "restored peripheral failed to connect");
            step.error(error);
            return;
        }

        if !self.is_session(&peripheral) || self.state != State::Connecting {
            debug!(peripheral = %id, state = ?self.state, "ignoring connect failure");
            return;
        }

        warn!(peripheral = %id, %error, "failed to connect");
        step.error(error);
        self.session = None;
        self.scan(step);
    }

    fn on_disconnected(&mut self, peripheral: P, error: Option<Error>, step: &mut Step<P>) {
        let id = peripheral.identifier();

        if self.take_pending(&peripheral).is_some() {
            debug!(peripheral = %id, "restored peripheral disconnected");
            return;
        }

        if !self.is_session(&peripheral) {
            debug!(peripheral = %id, "ignoring disconnect of unknown peripheral");
            return;
        }

        if self.state == State::Disconnecting {
            info!(peripheral = %id, "peripheral disconnected");
        } else {
            let error = match error {
                Some(error) => error.with_kind(ErrorKind::UnexpectedDisconnect),
                None => ErrorKind::UnexpectedDisconnect.into(),
            };
            warn!(peripheral = %id, state = ?self.state, %error, "peripheral disconnected");
            step.error(error);
        }

        self.session = None;
        self.scan(step);
    }

    fn on_services_discovered(
        &mut self,
        peripheral: P,
        result: Result<Vec<BluetoothUuid>>,
        step: &mut Step<P>,
    ) {
        if !self.is_session(&peripheral) || self.state != State::DiscoveringServices {
            debug!(peripheral = %peripheral.identifier(), state = ?self.state, "ignoring service discovery");
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(error) => {
                let error = error.with_kind(ErrorKind::DiscoveryFailed);
                warn!(%error, "error discovering services");
                step.error(error);
                return self.teardown(step);
            }
        };

        let target = self.profile.service;
        let matching: Vec<_> = services.into_iter().filter(|s| *s == target).collect();
        if matching.is_empty() {
            warn!("target service not found");
            step.error(Error::new(ErrorKind::DiscoveryFailed, "target service not found"));
            return self.teardown(step);
        }

        for service in &matching {
            step.command(Command::DiscoverCharacteristics {
                peripheral: peripheral.clone(),
                service: *service,
                characteristic: self.profile.characteristic,
            });
        }

        if let Some(session) = &mut self.session {
            session.set_services(matching);
        }
        self.set_state(State::DiscoveringCharacteristics);
    }

    fn on_characteristics_discovered(
        &mut self,
        peripheral: P,
        service: BluetoothUuid,
        result: Result<Vec<DiscoveredCharacteristic>>,
        step: &mut Step<P>,
    ) {
        if !self.is_session(&peripheral) || self.state != State::DiscoveringCharacteristics {
            debug!(peripheral = %peripheral.identifier(), state = ?self.state, "ignoring characteristic discovery");
            return;
        }

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(error) => {
                let error = error.with_kind(ErrorKind::DiscoveryFailed);
                warn!(%error, "error discovering characteristics");
                step.error(error);
                return self.teardown(step);
            }
        };

        let target = self.profile.characteristic;
        let found = characteristics.iter().any(|c| c.uuid == target);

        let Some(session) = &mut self.session else {
            return;
        };
        let remaining = session.record_characteristics(&service, characteristics);

        if found {
            info!(peripheral = %peripheral.identifier(), "subscribing to characteristic");
            step.command(Command::SetNotify {
                peripheral,
                characteristic: target,
                enabled: true,
            });
            self.set_state(State::Subscribing);
        } else if remaining == 0 {
            warn!("target characteristic not found");
            step.error(Error::new(ErrorKind::DiscoveryFailed, "target characteristic not found"));
            self.teardown(step);
        }
    }

    fn on_notify_state_changed(
        &mut self,
        peripheral: P,
        characteristic: BluetoothUuid,
        result: Result<bool>,
        step: &mut Step<P>,
    ) {
        if !self.is_session(&peripheral) || characteristic != self.profile.characteristic {
            return;
        }

        if let (Ok(is_notifying), Some(session)) = (&result, &mut self.session) {
            session.set_notifying(&characteristic, *is_notifying);
        }

        match (self.state, result) {
            (State::Subscribing, Ok(true)) => {
                info!(peripheral = %peripheral.identifier(), "notification began");
                self.set_state(State::Streaming);
            }
            (State::Subscribing, Ok(false)) => {
                warn!("notification was not enabled");
                step.error(ErrorKind::SubscribeFailed.into());
                self.disconnect(peripheral, step);
            }
            (State::Subscribing, Err(error)) => {
                let error = error.with_kind(ErrorKind::SubscribeFailed);
                warn!(%error, "error enabling notification");
                step.error(error);
                self.disconnect(peripheral, step);
            }
            (State::Unsubscribing, Err(error)) => {
                warn!(%error, "error disabling notification");
                self.disconnect(peripheral, step);
            }
            (State::Unsubscribing | State::Streaming, Ok(false)) => {
                info!(peripheral = %peripheral.identifier(), "notification stopped");
                self.disconnect(peripheral, step);
            }
            (state, result) => debug!(?state, ?result, "ignoring notification state"),
        }
    }

    fn on_value_updated(
        &mut self,
        peripheral: P,
        characteristic: BluetoothUuid,
        result: Result<Vec<u8>>,
        step: &mut Step<P>,
    ) {
        if !self.is_session(&peripheral) || characteristic != self.profile.characteristic {
            return;
        }

        if self.state != State::Streaming {
            debug!(state = ?self.state, "not streaming, dropping value");
            return;
        }

        let value = match result {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "error receiving value");
                return;
            }
        };

        if value.len() > self.profile.notify_mtu {
            debug!(len = value.len(), mtu = self.profile.notify_mtu, "value exceeds notify MTU");
        }

        let Some(session) = &mut self.session else {
            return;
        };
        session.set_value(&characteristic, &value);

        match session.accumulator_mut().push(&value, &self.profile) {
            Accumulated::Appended(len) => {
                debug!(received = %String::from_utf8_lossy(&value), len, "received");
            }
            Accumulated::Invalid(err) => {
                warn!(%err, "invalid data");
                step.error(Error::new(ErrorKind::InvalidPayload, err));
            }
            Accumulated::Complete(message) => {
                info!(len = message.len(), "message complete");
                self.message = Some(message.clone());
                step.notice(Notice::MessageComplete(message));
                step.command(Command::SetNotify {
                    peripheral,
                    characteristic,
                    enabled: false,
                });
                self.set_state(State::Unsubscribing);
            }
        }
    }
}

/// Drives a [`Machine`] against a host adapter and a consumer.
///
/// Events must be delivered one at a time; each is fully applied, commands included,
/// before the next is looked at. [`run`](Self::run) does this for an event queue.
pub struct ConnectionStateMachine<A: AdapterCapability, C> {
    adapter: A,
    consumer: C,
    machine: Machine<A::Peripheral>,
}

impl<A: AdapterCapability, C: MessageConsumer> ConnectionStateMachine<A, C> {
    pub fn new(adapter: A, consumer: C) -> Self {
        Self::with_profile(adapter, consumer, Profile::default())
    }

    pub fn with_profile(adapter: A, consumer: C, profile: Profile) -> Self {
        Self {
            adapter,
            consumer,
            machine: Machine::new(profile),
        }
    }

    pub fn current_state(&self) -> State {
        self.machine.state()
    }

    pub fn session(&self) -> Option<&Session<A::Peripheral>> {
        self.machine.session()
    }

    /// The last completed message, until the next session connects.
    pub fn message(&self) -> Option<&[u8]> {
        self.machine.message()
    }

    pub fn machine(&self) -> &Machine<A::Peripheral> {
        &self.machine
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    fn apply(&mut self, step: Step<A::Peripheral>) {
        for command in &step.commands {
            command.execute(&self.adapter);
        }

        for notice in step.notices {
            match notice {
                Notice::MessageComplete(message) => self.consumer.on_message_complete(&message),
                Notice::Error(error) => self.consumer.on_error(&error),
            }
        }
    }

    /// Starts scanning; rejected with [`ErrorKind::SessionActive`] while a session exists.
    pub fn start(&mut self) -> Result<()> {
        let step = self.machine.start(self.adapter.power_state())?;
        self.apply(step);
        Ok(())
    }

    /// Connects directly to restored peripherals.
    pub fn restore(&mut self, peripherals: Vec<A::Peripheral>) -> Result<()> {
        let step = self.machine.restore(peripherals)?;
        self.apply(step);
        Ok(())
    }

    /// Tears down the current session, if connected.
    pub fn cleanup(&mut self) {
        let step = self.machine.cleanup();
        self.apply(step);
    }

    /// Applies one event and issues the resulting commands.
    pub fn handle(&mut self, event: Event<A::Peripheral>) {
        let step = self.machine.handle(event);
        self.apply(step);
    }

    /// Applies events from `events` in order until the queue closes.
    pub async fn run(&mut self, mut events: EventReceiver<A::Peripheral>) {
        while let Some(event) = events.next().await {
            self.handle(event);
        }
        debug!("event queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{TRANSFER_CHARACTERISTIC_UUID, TRANSFER_SERVICE_UUID};
    use crate::testing::{FakePeripheral, RecordingAdapter};

    fn discovered(peripheral: &FakePeripheral) -> Event<FakePeripheral> {
        Event::Discovered {
            peripheral: peripheral.clone(),
            services: vec![TRANSFER_SERVICE_UUID],
            rssi: -40,
        }
    }

    fn scanning() -> Machine<FakePeripheral> {
        let mut machine = Machine::new(Profile::default());
        machine.handle(Event::PowerStateChanged(PowerState::PoweredOn));
        assert_eq!(machine.state(), State::Scanning);
        machine
    }

    fn subscribing(peripheral: &FakePeripheral) -> Machine<FakePeripheral> {
        let mut machine = scanning();
        machine.handle(discovered(peripheral));
        machine.handle(Event::Connected(peripheral.clone()));
        machine.handle(Event::ServicesDiscovered {
            peripheral: peripheral.clone(),
            result: Ok(vec![TRANSFER_SERVICE_UUID]),
        });
        machine.handle(Event::CharacteristicsDiscovered {
            peripheral: peripheral.clone(),
            service: TRANSFER_SERVICE_UUID,
            result: Ok(vec![DiscoveredCharacteristic {
                uuid: TRANSFER_CHARACTERISTIC_UUID,
                is_notifying: false,
            }]),
        });
        assert_eq!(machine.state(), State::Subscribing);
        machine
    }

    fn streaming(peripheral: &FakePeripheral) -> Machine<FakePeripheral> {
        let mut machine = subscribing(peripheral);
        machine.handle(Event::NotifyStateChanged {
            peripheral: peripheral.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            result: Ok(true),
        });
        assert_eq!(machine.state(), State::Streaming);
        machine
    }

    fn value(peripheral: &FakePeripheral, bytes: &[u8]) -> Event<FakePeripheral> {
        Event::ValueUpdated {
            peripheral: peripheral.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            result: Ok(bytes.to_vec()),
        }
    }

    #[test]
    fn test_power_on_scans_once() {
        let mut machine = Machine::<FakePeripheral>::new(Profile::default());
        let step = machine.handle(Event::PowerStateChanged(PowerState::PoweredOn));
        assert_eq!(
            step.commands,
            vec![Command::Scan {
                service: TRANSFER_SERVICE_UUID
            }]
        );

        let step = machine.handle(Event::PowerStateChanged(PowerState::PoweredOn));
        assert!(step.commands.is_empty());
        assert_eq!(machine.state(), State::Scanning);
    }

    #[test]
    fn test_start_waits_for_power() {
        let mut machine = Machine::<FakePeripheral>::new(Profile::default());
        let step = machine.start(PowerState::PoweredOff).unwrap();
        assert!(step.commands.is_empty());
        assert_eq!(machine.state(), State::Idle);

        let step = machine.handle(Event::PowerStateChanged(PowerState::PoweredOn));
        assert_eq!(step.commands.len(), 1);
        assert_eq!(machine.state(), State::Scanning);
    }

    #[test]
    fn test_start_rejected_with_active_session() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = scanning();
        machine.handle(discovered(&p1));

        let err = machine.start(PowerState::PoweredOn).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionActive);
        assert_eq!(machine.state(), State::Connecting);
    }

    #[test]
    fn test_discovery_requires_target_service() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = scanning();

        let step = machine.handle(Event::Discovered {
            peripheral: p1.clone(),
            services: vec![BluetoothUuid::from_u16(0x180D)],
            rssi: -40,
        });
        assert!(step.commands.is_empty());
        assert_eq!(machine.state(), State::Scanning);
    }

    #[test]
    fn test_connected_starts_service_discovery() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = scanning();
        machine.handle(discovered(&p1));

        let step = machine.handle(Event::Connected(p1.clone()));
        assert_eq!(
            step.commands,
            vec![
                Command::StopScan,
                Command::DiscoverServices {
                    peripheral: p1.clone(),
                    service: TRANSFER_SERVICE_UUID
                }
            ]
        );
        assert_eq!(machine.state(), State::DiscoveringServices);
    }

    #[test]
    fn test_service_discovery_error_tears_down() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = scanning();
        machine.handle(discovered(&p1));
        machine.handle(Event::Connected(p1.clone()));

        let step = machine.handle(Event::ServicesDiscovered {
            peripheral: p1.clone(),
            result: Err(ErrorKind::Other.into()),
        });
        assert_eq!(step.commands, vec![Command::CancelConnection(p1.clone())]);
        assert!(matches!(
            step.notices.as_slice(),
            [Notice::Error(e)] if e.kind() == ErrorKind::DiscoveryFailed
        ));
        assert_eq!(machine.state(), State::Disconnecting);

        let step = machine.handle(Event::Disconnected {
            peripheral: p1,
            error: None,
        });
        assert_eq!(
            step.commands,
            vec![Command::Scan {
                service: TRANSFER_SERVICE_UUID
            }]
        );
        assert!(step.notices.is_empty());
        assert_eq!(machine.state(), State::Scanning);
        assert!(machine.session().is_none());
    }

    #[test]
    fn test_missing_service_tears_down() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = scanning();
        machine.handle(discovered(&p1));
        machine.handle(Event::Connected(p1.clone()));

        let step = machine.handle(Event::ServicesDiscovered {
            peripheral: p1.clone(),
            result: Ok(vec![BluetoothUuid::from_u16(0x180F)]),
        });
        assert_eq!(step.commands, vec![Command::CancelConnection(p1)]);
        assert_eq!(machine.state(), State::Disconnecting);
    }

    #[test]
    fn test_characteristic_search_waits_for_every_service() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = scanning();
        machine.handle(discovered(&p1));
        machine.handle(Event::Connected(p1.clone()));

        let step = machine.handle(Event::ServicesDiscovered {
            peripheral: p1.clone(),
            result: Ok(vec![TRANSFER_SERVICE_UUID, TRANSFER_SERVICE_UUID]),
        });
        assert_eq!(step.commands.len(), 2);

        let step = machine.handle(Event::CharacteristicsDiscovered {
            peripheral: p1.clone(),
            service: TRANSFER_SERVICE_UUID,
            result: Ok(Vec::new()),
        });
        assert!(step.commands.is_empty());
        assert_eq!(machine.state(), State::DiscoveringCharacteristics);

        let step = machine.handle(Event::CharacteristicsDiscovered {
            peripheral: p1.clone(),
            service: TRANSFER_SERVICE_UUID,
            result: Ok(Vec::new()),
        });
        assert_eq!(step.commands, vec![Command::CancelConnection(p1)]);
        assert_eq!(machine.state(), State::Disconnecting);
    }

    #[test]
    fn test_subscribe_refused_disconnects() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = scanning();
        machine.handle(discovered(&p1));
        machine.handle(Event::Connected(p1.clone()));
        machine.handle(Event::ServicesDiscovered {
            peripheral: p1.clone(),
            result: Ok(vec![TRANSFER_SERVICE_UUID]),
        });
        let step = machine.handle(Event::CharacteristicsDiscovered {
            peripheral: p1.clone(),
            service: TRANSFER_SERVICE_UUID,
            result: Ok(vec![DiscoveredCharacteristic {
                uuid: TRANSFER_CHARACTERISTIC_UUID,
                is_notifying: false,
            }]),
        });
        assert_eq!(
            step.commands,
            vec![Command::SetNotify {
                peripheral: p1.clone(),
                characteristic: TRANSFER_CHARACTERISTIC_UUID,
                enabled: true
            }]
        );
        assert_eq!(machine.state(), State::Subscribing);

        let step = machine.handle(Event::NotifyStateChanged {
            peripheral: p1.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            result: Err(ErrorKind::Other.into()),
        });
        assert_eq!(step.commands, vec![Command::CancelConnection(p1)]);
        assert!(matches!(
            step.notices.as_slice(),
            [Notice::Error(e)] if e.kind() == ErrorKind::SubscribeFailed
        ));
        assert_eq!(machine.state(), State::Disconnecting);
    }

    #[test]
    fn test_subscribe_not_enabled_disconnects() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = subscribing(&p1);

        let step = machine.handle(Event::NotifyStateChanged {
            peripheral: p1.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            result: Ok(false),
        });
        assert_eq!(step.commands, vec![Command::CancelConnection(p1)]);
        assert!(matches!(
            step.notices.as_slice(),
            [Notice::Error(e)] if e.kind() == ErrorKind::SubscribeFailed
        ));
        assert_eq!(machine.state(), State::Disconnecting);
    }

    #[test]
    fn test_unsubscribe_error_still_disconnects() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = streaming(&p1);
        machine.handle(value(&p1, b"AB"));
        machine.handle(value(&p1, b"EOM"));
        assert_eq!(machine.state(), State::Unsubscribing);

        let step = machine.handle(Event::NotifyStateChanged {
            peripheral: p1.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            result: Err(ErrorKind::Other.into()),
        });
        assert_eq!(step.commands, vec![Command::CancelConnection(p1.clone())]);
        assert!(step.notices.is_empty());
        assert_eq!(machine.state(), State::Disconnecting);

        machine.handle(Event::Disconnected {
            peripheral: p1,
            error: None,
        });
        assert_eq!(machine.state(), State::Scanning);
    }

    #[test]
    fn test_notification_stopped_by_peer_disconnects() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = streaming(&p1);
        machine.handle(value(&p1, b"AB"));

        let step = machine.handle(Event::NotifyStateChanged {
            peripheral: p1.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            result: Ok(false),
        });
        assert_eq!(step.commands, vec![Command::CancelConnection(p1)]);
        assert!(step.notices.is_empty());
        assert_eq!(machine.state(), State::Disconnecting);
        assert_eq!(machine.message(), None);
    }

    #[test]
    fn test_message_completes_on_sentinel() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = streaming(&p1);

        assert!(machine.handle(value(&p1, b"AB")).commands.is_empty());
        assert!(machine.handle(value(&p1, b"CD")).commands.is_empty());
        assert_eq!(machine.session().unwrap().buffer(), b"ABCD");

        let step = machine.handle(value(&p1, b"EOM"));
        assert_eq!(
            step.commands,
            vec![Command::SetNotify {
                peripheral: p1.clone(),
                characteristic: TRANSFER_CHARACTERISTIC_UUID,
                enabled: false
            }]
        );
        assert!(matches!(
            step.notices.as_slice(),
            [Notice::MessageComplete(m)] if m == b"ABCD"
        ));
        assert_eq!(machine.state(), State::Unsubscribing);
        assert_eq!(machine.message(), Some(&b"ABCD"[..]));
        assert_eq!(machine.session().unwrap().buffer(), b"ABCD");

        let step = machine.handle(Event::NotifyStateChanged {
            peripheral: p1.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            result: Ok(false),
        });
        assert_eq!(step.commands, vec![Command::CancelConnection(p1.clone())]);
        assert_eq!(machine.state(), State::Disconnecting);

        machine.handle(Event::Disconnected {
            peripheral: p1,
            error: None,
        });
        assert_eq!(machine.state(), State::Scanning);
        assert_eq!(machine.message(), Some(&b"ABCD"[..]));
    }

    #[test]
    fn test_message_survives_until_next_connection() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let p2 = adapter.peripheral(2);
        let mut machine = streaming(&p1);
        machine.handle(value(&p1, b"AB"));
        machine.handle(value(&p1, b"EOM"));
        machine.handle(Event::NotifyStateChanged {
            peripheral: p1.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            result: Ok(false),
        });
        machine.handle(Event::Disconnected {
            peripheral: p1,
            error: None,
        });

        machine.handle(discovered(&p2));
        assert_eq!(machine.message(), Some(&b"AB"[..]));
        machine.handle(Event::Connected(p2));
        assert_eq!(machine.message(), None);
        assert!(machine.session().unwrap().buffer().is_empty());
    }

    #[test]
    fn test_invalid_payload_keeps_streaming() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = streaming(&p1);
        machine.handle(value(&p1, b"AB"));

        let step = machine.handle(value(&p1, &[0xC3, 0x28]));
        assert!(step.commands.is_empty());
        assert!(matches!(
            step.notices.as_slice(),
            [Notice::Error(e)] if e.kind() == ErrorKind::InvalidPayload
        ));
        assert_eq!(machine.state(), State::Streaming);
        assert_eq!(machine.session().unwrap().buffer(), b"AB");
    }

    #[test]
    fn test_value_error_is_ignored() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = streaming(&p1);
        machine.handle(value(&p1, b"AB"));

        let step = machine.handle(Event::ValueUpdated {
            peripheral: p1.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            result: Err(ErrorKind::Other.into()),
        });
        assert!(step.commands.is_empty());
        assert!(step.notices.is_empty());
        assert_eq!(machine.session().unwrap().buffer(), b"AB");
    }

    #[test]
    fn test_values_for_other_characteristics_are_ignored() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = streaming(&p1);

        machine.handle(Event::ValueUpdated {
            peripheral: p1.clone(),
            characteristic: BluetoothUuid::from_u16(0x2A19),
            result: Ok(b"AB".to_vec()),
        });
        assert!(machine.session().unwrap().buffer().is_empty());
    }

    #[test]
    fn test_unexpected_disconnect_rescans() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = streaming(&p1);

        let step = machine.handle(Event::Disconnected {
            peripheral: p1,
            error: Some(Error::new(ErrorKind::Other, "connection timeout")),
        });
        assert_eq!(
            step.commands,
            vec![Command::Scan {
                service: TRANSFER_SERVICE_UUID
            }]
        );
        assert!(matches!(
            step.notices.as_slice(),
            [Notice::Error(e)] if e.kind() == ErrorKind::UnexpectedDisconnect
        ));
        assert_eq!(machine.state(), State::Scanning);
    }

    #[test]
    fn test_power_off_drops_session() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = streaming(&p1);

        let step = machine.handle(Event::PowerStateChanged(PowerState::PoweredOff));
        assert!(step.commands.is_empty());
        assert!(matches!(
            step.notices.as_slice(),
            [Notice::Error(e)] if e.kind() == ErrorKind::PoweredOff
        ));
        assert_eq!(machine.state(), State::Idle);
        assert!(machine.session().is_none());

        let step = machine.handle(Event::PowerStateChanged(PowerState::PoweredOn));
        assert_eq!(step.commands.len(), 1);
        assert_eq!(machine.state(), State::Scanning);
    }

    #[test]
    fn test_adapter_reset_rescans() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = scanning();
        machine.handle(discovered(&p1));
        machine.handle(Event::Connected(p1.clone()));
        assert_eq!(machine.state(), State::DiscoveringServices);

        let step = machine.handle(Event::PowerStateChanged(PowerState::Resetting));
        assert!(step.commands.is_empty());
        assert!(matches!(
            step.notices.as_slice(),
            [Notice::Error(e)] if e.kind() == ErrorKind::PoweredOff
        ));
        assert_eq!(machine.state(), State::Idle);
        assert!(machine.session().is_none());

        let step = machine.handle(Event::PowerStateChanged(PowerState::PoweredOn));
        assert_eq!(
            step.commands,
            vec![Command::Scan {
                service: TRANSFER_SERVICE_UUID
            }]
        );
        assert_eq!(machine.state(), State::Scanning);

        // The old link is gone; a late callback for it changes nothing.
        let step = machine.handle(Event::ServicesDiscovered {
            peripheral: p1,
            result: Ok(vec![TRANSFER_SERVICE_UUID]),
        });
        assert!(step.commands.is_empty());
        assert_eq!(machine.state(), State::Scanning);
    }

    #[test]
    fn test_cleanup_before_subscribe_disconnects() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = scanning();
        machine.handle(discovered(&p1));
        machine.handle(Event::Connected(p1.clone()));

        let step = machine.cleanup();
        assert_eq!(step.commands, vec![Command::CancelConnection(p1)]);
        assert_eq!(machine.state(), State::Disconnecting);

        assert!(machine.cleanup().commands.is_empty());
    }

    #[test]
    fn test_cleanup_while_connecting_is_noop() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut machine = scanning();
        machine.handle(discovered(&p1));

        assert!(machine.cleanup().commands.is_empty());
        assert_eq!(machine.state(), State::Connecting);
    }

    #[test]
    fn test_stale_events_for_other_peripherals_are_ignored() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let p2 = adapter.peripheral(2);
        let mut machine = streaming(&p1);

        assert!(machine.handle(value(&p2, b"XY")).commands.is_empty());
        let step = machine.handle(Event::Disconnected {
            peripheral: p2.clone(),
            error: None,
        });
        assert!(step.commands.is_empty());

        let step = machine.handle(Event::Connected(p2.clone()));
        assert_eq!(step.commands, vec![Command::CancelConnection(p2)]);
        assert_eq!(machine.state(), State::Streaming);
    }

    #[test]
    fn test_driver_reports_to_consumer() {
        let adapter = RecordingAdapter::new();
        let p1 = adapter.peripheral(1);
        let mut messages = Vec::new();
        let mut csm = ConnectionStateMachine::new(adapter, |m: &[u8]| messages.push(m.to_vec()));
        csm.start().unwrap();
        csm.handle(discovered(&p1));
        assert_eq!(csm.current_state(), State::Connecting);
        drop(csm);
        assert!(messages.is_empty());
    }
}
