//! A [CoreBluetooth](https://developer.apple.com/documentation/corebluetooth) host for the
//! [`central_restore`] connection lifecycle.
//!
//! [`CentralHost`] creates a `CBCentralManager` with a restore identifier, translates its
//! delegate callbacks into lifecycle events and carries out the resulting commands. When
//! the system relaunches the process to restore Bluetooth state, the peripherals it hands
//! back are reconnected without scanning.
//!
//! This crate is empty on non-Apple targets.

#![cfg(target_vendor = "apple")]

mod central;
pub mod error;
mod peripheral;
mod util;

pub use central::*;
pub use error::OsError;
pub use peripheral::*;
