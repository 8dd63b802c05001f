use btuuid::BluetoothUuid;
use futures_channel::mpsc;

use crate::capability::{AdapterCapability, PeripheralCapability, PowerState};
use crate::error::{Error, ErrorKind, Result};

/// A characteristic reported by characteristic discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: BluetoothUuid,
    pub is_notifying: bool,
}

/// Something the host Bluetooth stack reported.
///
/// `P` is the host's peripheral handle.
#[derive(Debug, Clone)]
pub enum Event<P> {
    PowerStateChanged(PowerState),
    Discovered {
        peripheral: P,
        services: Vec<BluetoothUuid>,
        rssi: i16,
    },
    Connected(P),
    ConnectFailed {
        peripheral: P,
        error: Error,
    },
    Disconnected {
        peripheral: P,
        error: Option<Error>,
    },
    /// The process was relaunched and the host handed back these peripherals.
    RestoreState(Vec<P>),
    ServicesDiscovered {
        peripheral: P,
        result: Result<Vec<BluetoothUuid>>,
    },
    CharacteristicsDiscovered {
        peripheral: P,
        service: BluetoothUuid,
        result: Result<Vec<DiscoveredCharacteristic>>,
    },
    NotifyStateChanged {
        peripheral: P,
        characteristic: BluetoothUuid,
        result: Result<bool>,
    },
    ValueUpdated {
        peripheral: P,
        characteristic: BluetoothUuid,
        result: Result<Vec<u8>>,
    },
}

/// An instruction for the host Bluetooth stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<P> {
    Scan {
        service: BluetoothUuid,
    },
    StopScan,
    Connect(P),
    CancelConnection(P),
    DiscoverServices {
        peripheral: P,
        service: BluetoothUuid,
    },
    DiscoverCharacteristics {
        peripheral: P,
        service: BluetoothUuid,
        characteristic: BluetoothUuid,
    },
    SetNotify {
        peripheral: P,
        characteristic: BluetoothUuid,
        enabled: bool,
    },
}

impl<P: PeripheralCapability> Command<P> {
    /// Issues this command to the host.
    pub fn execute<A>(&self, adapter: &A)
    where
        A: AdapterCapability<Peripheral = P>,
    {
        match self {
            Command::Scan { service } => adapter.scan(service),
            Command::StopScan => adapter.stop_scan(),
            Command::Connect(peripheral) => adapter.connect(peripheral),
            Command::CancelConnection(peripheral) => adapter.cancel_connection(peripheral),
            Command::DiscoverServices {
                peripheral,
                service,
            } => peripheral.discover_services(service),
            Command::DiscoverCharacteristics {
                peripheral,
                service,
                characteristic,
            } => peripheral.discover_characteristics(service, characteristic),
            Command::SetNotify {
                peripheral,
                characteristic,
                enabled,
            } => peripheral.set_notify(characteristic, *enabled),
        }
    }
}

/// The sending half of a serialized event queue.
///
/// Host callbacks push events here; a single
/// [`ConnectionStateMachine::run`](crate::ConnectionStateMachine::run) loop drains them
/// in delivery order.
#[derive(Debug)]
pub struct EventSender<P> {
    sender: mpsc::UnboundedSender<Event<P>>,
}

impl<P> Clone for EventSender<P> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<P> EventSender<P> {
    /// Queues `event`, failing if the receiving loop has gone away.
    pub fn send(&self, event: Event<P>) -> Result<()> {
        self.sender
            .unbounded_send(event)
            .map_err(|_| ErrorKind::Closed.into())
    }

    /// Closes the queue; the receiving loop ends once it has drained.
    pub fn close(&self) {
        self.sender.close_channel();
    }
}

/// The receiving half of a serialized event queue.
pub type EventReceiver<P> = mpsc::UnboundedReceiver<Event<P>>;

/// Creates an unbounded, ordered event queue.
pub fn event_queue<P>() -> (EventSender<P>, EventReceiver<P>) {
    let (sender, receiver) = mpsc::unbounded();
    (EventSender { sender }, receiver)
}

#[cfg(test)]
mod tests {
    use futures_lite::StreamExt;
    use futures_lite::future::block_on;

    use super::*;

    #[test]
    fn test_event_queue_preserves_order() {
        let (sender, mut receiver) = event_queue::<()>();
        sender
            .send(Event::PowerStateChanged(PowerState::PoweredOff))
            .unwrap();
        sender
            .send(Event::PowerStateChanged(PowerState::PoweredOn))
            .unwrap();
        sender.close();

        let events: Vec<_> = block_on(async {
            let mut events = Vec::new();
            while let Some(event) = receiver.next().await {
                events.push(event);
            }
            events
        });

        assert!(matches!(
            events.as_slice(),
            [
                Event::PowerStateChanged(PowerState::PoweredOff),
                Event::PowerStateChanged(PowerState::PoweredOn)
            ]
        ));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (sender, receiver) = event_queue::<()>();
        drop(receiver);
        let err = sender
            .send(Event::PowerStateChanged(PowerState::PoweredOn))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
