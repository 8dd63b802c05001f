//! Relaunch handling.
//!
//! When the host relaunches the process to deliver Bluetooth events, the peripherals it
//! kept connected on the process's behalf are handed back. The connection lifecycle
//! reattaches to them directly instead of scanning.

use tracing::info;

use crate::capability::AdapterCapability;
use crate::error::Result;
use crate::state_machine::{ConnectionStateMachine, MessageConsumer};

/// The identifier under which the central manager's state is preserved.
pub const DEFAULT_RESTORE_IDENTIFIER: &str = "witworks.central.restore.key";

/// Launch information relevant to Bluetooth state restoration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Restore identifiers of the central managers the host relaunched the process for.
    pub bluetooth_centrals: Vec<String>,
}

impl LaunchOptions {
    /// Returns whether the process was relaunched to restore the central manager
    /// registered under `identifier`.
    pub fn restores(&self, identifier: &str) -> bool {
        self.bluetooth_centrals.iter().any(|id| id == identifier)
    }
}

/// The peripherals the host handed back when relaunching the process.
#[derive(Debug, Clone)]
pub struct RestoreDescriptor<P> {
    peripherals: Vec<P>,
}

impl<P> RestoreDescriptor<P> {
    pub fn new(peripherals: Vec<P>) -> Self {
        Self { peripherals }
    }

    /// Builds a descriptor if `launch` says the process was relaunched for `identifier`.
    ///
    /// The peripherals arrive separately, so the descriptor starts empty and is filled by
    /// the host's restore callback.
    pub fn from_launch(launch: &LaunchOptions, identifier: &str) -> Option<Self> {
        launch
            .restores(identifier)
            .then(|| Self::new(Vec::new()))
    }

    pub fn peripherals(&self) -> &[P] {
        &self.peripherals
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }

    pub fn into_peripherals(self) -> Vec<P> {
        self.peripherals
    }
}

impl<P> Extend<P> for RestoreDescriptor<P> {
    fn extend<T: IntoIterator<Item = P>>(&mut self, iter: T) {
        self.peripherals.extend(iter);
    }
}

/// Decides how a freshly created connection lifecycle begins.
///
/// With restored peripherals the lifecycle reconnects to them without scanning; on a
/// normal launch, or when nothing was handed back, it scans.
#[derive(Debug, Clone)]
pub struct RestoreCoordinator<P> {
    descriptor: Option<RestoreDescriptor<P>>,
}

impl<P> RestoreCoordinator<P> {
    pub fn new(descriptor: Option<RestoreDescriptor<P>>) -> Self {
        Self { descriptor }
    }

    /// Returns whether this launch is a restoration relaunch.
    pub fn is_relaunch(&self) -> bool {
        self.descriptor.is_some()
    }

    /// Starts `machine` in the mode this launch calls for.
    pub fn run<A, C>(self, machine: &mut ConnectionStateMachine<A, C>) -> Result<()>
    where
        A: AdapterCapability<Peripheral = P>,
        C: MessageConsumer,
    {
        match self.descriptor {
            Some(descriptor) if !descriptor.is_empty() => {
                info!(count = descriptor.peripherals.len(), "restoring peripherals");
                machine.restore(descriptor.into_peripherals())
            }
            Some(_) => {
                info!("nothing to restore, scanning");
                machine.start()
            }
            None => machine.start(),
        }
    }
}
