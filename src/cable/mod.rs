//! Cable observation
//!
//! Kernel power-supply events flow in through the udev monitor bridge,
//! get classified into a [`CableState`], and leave through the debouncing
//! observer as the state the rest of the daemon reacts to.

pub mod discovery;
pub mod monitor;
pub mod observer;
pub mod state;

pub use discovery::{discover, PowerSupplyDevice, POWER_SUPPLY_CLASS};
pub use observer::{CableObserver, CABLE_DEBOUNCE};
pub use state::{CableState, PowerSupplyProps};
