//! A platform-independent Bluetooth LE central connection lifecycle.
//!
//! This crate drives a single peripheral session through scan, connect, service and
//! characteristic discovery, subscription, message accumulation and teardown, and
//! reattaches to previously connected peripherals when the process is relaunched to
//! restore Bluetooth state.
//!
//! The operating system's Bluetooth stack is reached only through the
//! [`AdapterCapability`] and [`PeripheralCapability`] traits. Host bindings translate
//! their callbacks into [`Event`]s and feed them, one at a time, to a
//! [`ConnectionStateMachine`], which answers with [`Command`]s.

mod accumulator;
mod capability;
pub mod error;
mod event;
mod profile;
mod restore;
mod session;
mod state_machine;
pub mod testing;

pub use accumulator::*;
pub use capability::*;
pub use error::{Error, ErrorKind, Result};
pub use event::*;
pub use profile::*;
pub use restore::*;
pub use session::*;
pub use state_machine::*;

pub use btuuid::BluetoothUuid;
