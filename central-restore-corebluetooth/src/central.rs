//! The central manager, driven by the connection lifecycle.

use std::cell::RefCell;

use btuuid::BluetoothUuid;
use central_restore::{
    AdapterCapability, ConnectionStateMachine, DEFAULT_RESTORE_IDENTIFIER, Error, ErrorKind,
    Event, LaunchOptions, MessageConsumer, PowerState, RestoreCoordinator, RestoreDescriptor,
    Result, State,
};
use dispatch2::DispatchQueue;
use objc2::rc::{Retained, RetainedFromIterator};
use objc2::runtime::{AnyObject, ProtocolObject};
use objc2::{AnyThread, DefinedClass, MainThreadMarker, Message, define_class, msg_send};
use objc2_core_bluetooth::{
    CBAdvertisementDataOverflowServiceUUIDsKey, CBAdvertisementDataServiceUUIDsKey,
    CBCentralManager, CBCentralManagerDelegate, CBCentralManagerOptionRestoreIdentifierKey,
    CBCentralManagerOptionShowPowerAlertKey, CBCentralManagerRestoredStatePeripheralsKey,
    CBCentralManagerScanOptionAllowDuplicatesKey, CBCharacteristic, CBPeripheral,
    CBPeripheralDelegate, CBService, CBUUID,
};
use objc2_foundation::{
    NSArray, NSDictionary, NSError, NSMutableDictionary, NSNumber, NSObject, NSObjectProtocol,
    NSString,
};
use tracing::{debug, info, warn};

use crate::error::{from_nserror, from_nserror_or_kind, or_err};
use crate::peripheral::{CoreBluetoothPeripheral, characteristics_of};
use crate::util::{from_cbuuid, power_state, to_cbuuid};

/// Options for creating the central manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// The identifier the system preserves the manager's state under.
    ///
    /// Without one the process is never relaunched for Bluetooth events.
    pub restore_identifier: Option<String>,
    /// Whether the system warns the user if Bluetooth is powered off.
    pub show_power_alert: bool,
    /// Whether every advertisement is reported, rather than one per peripheral.
    pub allow_duplicates: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            restore_identifier: Some(DEFAULT_RESTORE_IDENTIFIER.to_string()),
            show_power_alert: false,
            allow_duplicates: true,
        }
    }
}

/// A `CBCentralManager` as an [`AdapterCapability`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CoreBluetoothAdapter {
    central: Retained<CBCentralManager>,
    allow_duplicates: bool,
}

impl std::fmt::Debug for CoreBluetoothAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreBluetoothAdapter")
            .field("central", &self.central)
            .finish()
    }
}

impl AdapterCapability for CoreBluetoothAdapter {
    type Peripheral = CoreBluetoothPeripheral;

    fn power_state(&self) -> PowerState {
        power_state(unsafe { self.central.state() })
    }

    fn scan(&self, service: &BluetoothUuid) {
        let services = NSArray::retained_from_iter(std::iter::once(to_cbuuid(service)));
        let options = NSMutableDictionary::<NSString, AnyObject>::new();

        if self.allow_duplicates {
            unsafe {
                options.setValue_forKey(
                    Some(&NSNumber::new_bool(true)),
                    CBCentralManagerScanOptionAllowDuplicatesKey,
                );
            }
        }

        unsafe {
            self.central
                .scanForPeripheralsWithServices_options(Some(&services), Some(&options));
        }
    }

    fn stop_scan(&self) {
        unsafe { self.central.stopScan() };
    }

    fn connect(&self, peripheral: &CoreBluetoothPeripheral) {
        unsafe {
            self.central
                .connectPeripheral_options(&peripheral.peripheral, None)
        };
    }

    fn cancel_connection(&self, peripheral: &CoreBluetoothPeripheral) {
        unsafe {
            self.central
                .cancelPeripheralConnection(&peripheral.peripheral)
        };
    }
}

struct BoxedConsumer(Box<dyn MessageConsumer>);

impl MessageConsumer for BoxedConsumer {
    fn on_message_complete(&mut self, message: &[u8]) {
        self.0.on_message_complete(message);
    }

    fn on_error(&mut self, error: &Error) {
        self.0.on_error(error);
    }
}

type Lifecycle = ConnectionStateMachine<CoreBluetoothAdapter, BoxedConsumer>;

struct LifecycleIvars {
    lifecycle: RefCell<Option<Lifecycle>>,
    // Restored state that arrived before the lifecycle was installed.
    restored: RefCell<Option<RestoreDescriptor<CoreBluetoothPeripheral>>>,
}

define_class!(
    #[unsafe(super(NSObject))]
    #[ivars = LifecycleIvars]
    struct LifecycleBridge;

    unsafe impl NSObjectProtocol for LifecycleBridge {}

    #[allow(non_snake_case)]
    unsafe impl CBCentralManagerDelegate for LifecycleBridge {
        #[unsafe(method(centralManagerDidUpdateState:))]
        fn centralManagerDidUpdateState(&self, central: &CBCentralManager) {
            let power = power_state(unsafe { central.state() });
            self.deliver(Event::PowerStateChanged(power));
        }

        #[unsafe(method(centralManager:willRestoreState:))]
        fn centralManager_willRestoreState(
            &self,
            _central: &CBCentralManager,
            dict: &NSDictionary<NSString, AnyObject>,
        ) {
            let peripherals: Vec<_> = dict
                .objectForKey(unsafe { CBCentralManagerRestoredStatePeripheralsKey })
                .into_iter()
                .flat_map(|x| x.downcast::<NSArray>())
                .flatten()
                .flat_map(|obj| obj.downcast::<CBPeripheral>())
                .map(|peripheral| self.adopt(&peripheral))
                .collect();

            self.restore(peripherals);
        }

        #[unsafe(method(centralManager:didDiscoverPeripheral:advertisementData:RSSI:))]
        fn centralManager_didDiscoverPeripheral_advertisementData_RSSI(
            &self,
            _central: &CBCentralManager,
            peripheral: &CBPeripheral,
            advertisement_data: &NSDictionary<NSString, AnyObject>,
            rssi: &NSNumber,
        ) {
            let services = [
                unsafe { CBAdvertisementDataServiceUUIDsKey },
                unsafe { CBAdvertisementDataOverflowServiceUUIDsKey },
            ]
            .into_iter()
            .flat_map(|key| advertisement_data.objectForKey(key))
            .flat_map(|x| x.downcast::<NSArray>())
            .flatten()
            .flat_map(|obj| obj.downcast::<CBUUID>())
            .filter_map(|uuid| from_cbuuid(&uuid))
            .collect();

            self.deliver(Event::Discovered {
                peripheral: self.adopt(peripheral),
                services,
                rssi: rssi.shortValue(),
            });
        }

        #[unsafe(method(centralManager:didConnectPeripheral:))]
        fn centralManager_didConnectPeripheral(
            &self,
            _central: &CBCentralManager,
            peripheral: &CBPeripheral,
        ) {
            self.deliver(Event::Connected(self.adopt(peripheral)));
        }

        #[unsafe(method(centralManager:didFailToConnectPeripheral:error:))]
        fn centralManager_didFailToConnectPeripheral_error(
            &self,
            _central: &CBCentralManager,
            peripheral: &CBPeripheral,
            error: Option<&NSError>,
        ) {
            self.deliver(Event::ConnectFailed {
                peripheral: CoreBluetoothPeripheral::new(peripheral.retain()),
                error: from_nserror_or_kind(error, ErrorKind::ConnectFailed),
            });
        }

        #[unsafe(method(centralManager:didDisconnectPeripheral:error:))]
        fn centralManager_didDisconnectPeripheral_error(
            &self,
            _central: &CBCentralManager,
            peripheral: &CBPeripheral,
            error: Option<&NSError>,
        ) {
            self.deliver(Event::Disconnected {
                peripheral: CoreBluetoothPeripheral::new(peripheral.retain()),
                error: error.map(|error| from_nserror(ErrorKind::Other, error)),
            });
        }
    }

    #[allow(non_snake_case)]
    unsafe impl CBPeripheralDelegate for LifecycleBridge {
        #[unsafe(method(peripheral:didDiscoverServices:))]
        unsafe fn peripheral_didDiscoverServices(
            &self,
            peripheral: &CBPeripheral,
            error: Option<&NSError>,
        ) {
            let peripheral = CoreBluetoothPeripheral::new(peripheral.retain());
            let result = or_err(peripheral.service_uuids(), error, ErrorKind::DiscoveryFailed);
            self.deliver(Event::ServicesDiscovered { peripheral, result });
        }

        #[unsafe(method(peripheral:didDiscoverCharacteristicsForService:error:))]
        unsafe fn peripheral_didDiscoverCharacteristicsForService_error(
            &self,
            peripheral: &CBPeripheral,
            service: &CBService,
            error: Option<&NSError>,
        ) {
            let Some(uuid) = from_cbuuid(&unsafe { service.UUID() }) else {
                return;
            };

            self.deliver(Event::CharacteristicsDiscovered {
                peripheral: CoreBluetoothPeripheral::new(peripheral.retain()),
                service: uuid,
                result: or_err(characteristics_of(service), error, ErrorKind::DiscoveryFailed),
            });
        }

        #[unsafe(method(peripheral:didUpdateNotificationStateForCharacteristic:error:))]
        unsafe fn peripheral_didUpdateNotificationStateForCharacteristic_error(
            &self,
            peripheral: &CBPeripheral,
            characteristic: &CBCharacteristic,
            error: Option<&NSError>,
        ) {
            let Some(uuid) = from_cbuuid(&unsafe { characteristic.UUID() }) else {
                return;
            };

            let is_notifying = unsafe { characteristic.isNotifying() };
            self.deliver(Event::NotifyStateChanged {
                peripheral: CoreBluetoothPeripheral::new(peripheral.retain()),
                characteristic: uuid,
                result: or_err(is_notifying, error, ErrorKind::SubscribeFailed),
            });
        }

        #[unsafe(method(peripheral:didUpdateValueForCharacteristic:error:))]
        unsafe fn peripheral_didUpdateValueForCharacteristic_error(
            &self,
            peripheral: &CBPeripheral,
            characteristic: &CBCharacteristic,
            error: Option<&NSError>,
        ) {
            let Some(uuid) = from_cbuuid(&unsafe { characteristic.UUID() }) else {
                return;
            };

            let value = unsafe { characteristic.value() }
                .map(|x| x.to_vec())
                .unwrap_or_default();
            self.deliver(Event::ValueUpdated {
                peripheral: CoreBluetoothPeripheral::new(peripheral.retain()),
                characteristic: uuid,
                result: or_err(value, error, ErrorKind::Other),
            });
        }
    }
);

impl LifecycleBridge {
    fn new() -> Retained<Self> {
        let ivars = LifecycleIvars {
            lifecycle: RefCell::new(None),
            restored: RefCell::new(None),
        };
        let this = LifecycleBridge::alloc().set_ivars(ivars);
        unsafe { msg_send![super(this), init] }
    }

    /// Installs the lifecycle, then applies any restored state that was held for it.
    ///
    /// Returns whether held state was applied, in which case the lifecycle has already
    /// been started.
    fn install(&self, lifecycle: Lifecycle) -> bool {
        *self.ivars().lifecycle.borrow_mut() = Some(lifecycle);
        let Some(descriptor) = self.ivars().restored.borrow_mut().take() else {
            return false;
        };
        debug!(count = descriptor.peripherals().len(), "applying held restored state");
        self.apply_restore(descriptor);
        true
    }

    fn with_lifecycle<R>(&self, f: impl FnOnce(&mut Lifecycle) -> R) -> Option<R> {
        let Ok(mut lifecycle) = self.ivars().lifecycle.try_borrow_mut() else {
            warn!("lifecycle re-entered, dropping callback");
            return None;
        };
        lifecycle.as_mut().map(f)
    }

    /// Makes this bridge the peripheral's delegate and wraps it.
    fn adopt(&self, peripheral: &CBPeripheral) -> CoreBluetoothPeripheral {
        unsafe { peripheral.setDelegate(Some(ProtocolObject::from_ref(self))) };
        CoreBluetoothPeripheral::new(peripheral.retain())
    }

    fn deliver(&self, event: Event<CoreBluetoothPeripheral>) {
        if self.with_lifecycle(|lifecycle| lifecycle.handle(event)).is_none() {
            debug!("no lifecycle installed, event dropped");
        }
    }

    fn restore(&self, peripherals: Vec<CoreBluetoothPeripheral>) {
        info!(count = peripherals.len(), "system restored central manager state");
        let installed = match self.ivars().lifecycle.try_borrow() {
            Ok(lifecycle) => lifecycle.is_some(),
            Err(_) => true,
        };
        if !installed {
            debug!("no lifecycle installed yet, holding restored state");
            self.ivars()
                .restored
                .borrow_mut()
                .get_or_insert_with(|| RestoreDescriptor::new(Vec::new()))
                .extend(peripherals);
            return;
        }
        self.apply_restore(RestoreDescriptor::new(peripherals));
    }

    fn apply_restore(&self, descriptor: RestoreDescriptor<CoreBluetoothPeripheral>) {
        let coordinator = RestoreCoordinator::new(Some(descriptor));
        match self.with_lifecycle(|lifecycle| coordinator.run(lifecycle)) {
            Some(Ok(())) => {}
            Some(Err(error)) => warn!(%error, "restored state not applied"),
            None => warn!("restored state dropped"),
        }
    }
}

/// Owns a `CBCentralManager` and the connection lifecycle driving it.
///
/// Delegate callbacks arrive on the main dispatch queue, which serializes them; the
/// lifecycle handles each one before the next is delivered.
pub struct CentralHost {
    central: Retained<CBCentralManager>,
    bridge: Retained<LifecycleBridge>,
}

impl std::fmt::Debug for CentralHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralHost")
            .field("central", &self.central)
            .finish()
    }
}

impl CentralHost {
    /// Creates the central manager on the main thread and starts the lifecycle.
    ///
    /// If `launch` says the process was relaunched to restore this manager, the
    /// lifecycle waits for the restored peripherals instead of scanning.
    pub fn main_thread(
        options: &ManagerOptions,
        launch: &LaunchOptions,
        consumer: impl MessageConsumer + 'static,
        _mtm: MainThreadMarker,
    ) -> Result<Self> {
        let bridge = LifecycleBridge::new();

        let manager_options: Retained<NSMutableDictionary<NSString, AnyObject>> =
            NSMutableDictionary::from_retained_objects(
                &[unsafe { CBCentralManagerOptionShowPowerAlertKey }],
                &[NSNumber::new_bool(options.show_power_alert).into()],
            );

        if let Some(restore_id) = &options.restore_identifier {
            unsafe {
                manager_options.setValue_forKey(
                    Some(&NSString::from_str(restore_id)),
                    CBCentralManagerOptionRestoreIdentifierKey,
                );
            }
        }

        let central = CBCentralManager::alloc();
        let central = unsafe {
            CBCentralManager::initWithDelegate_queue_options(
                central,
                Some(ProtocolObject::from_ref(&*bridge)),
                Some(DispatchQueue::main()),
                Some(&manager_options),
            )
        };

        let adapter = CoreBluetoothAdapter {
            central: central.clone(),
            allow_duplicates: options.allow_duplicates,
        };
        let restored = bridge.install(ConnectionStateMachine::new(
            adapter,
            BoxedConsumer(Box::new(consumer)),
        ));

        let relaunch = options.restore_identifier.as_deref().and_then(|identifier| {
            RestoreDescriptor::<CoreBluetoothPeripheral>::from_launch(launch, identifier)
        });

        if restored {
            info!("restored state arrived during setup and was applied");
        } else if relaunch.is_some() {
            info!("relaunched for state restoration, waiting for restored peripherals");
        } else {
            bridge
                .with_lifecycle(|lifecycle| RestoreCoordinator::new(None).run(lifecycle))
                .transpose()?;
        }

        Ok(Self { central, bridge })
    }

    /// The lifecycle's current state.
    pub fn current_state(&self) -> Option<State> {
        self.bridge
            .with_lifecycle(|lifecycle| lifecycle.current_state())
    }

    /// The last completed message, until the next session connects.
    pub fn message(&self) -> Option<Vec<u8>> {
        self.bridge
            .with_lifecycle(|lifecycle| lifecycle.message().map(<[u8]>::to_vec))
            .flatten()
    }

    /// Starts scanning if no session is active.
    pub fn start(&self) -> Result<()> {
        self.bridge
            .with_lifecycle(|lifecycle| lifecycle.start())
            .unwrap_or(Ok(()))
    }

    /// Tears the current session down.
    pub fn cleanup(&self) {
        self.bridge.with_lifecycle(|lifecycle| lifecycle.cleanup());
    }
}
