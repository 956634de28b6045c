//! Daemon configuration
//!
//! The config file and the per-mode descriptor records are plain serde
//! structures; everything is immutable after startup except the mode
//! settings, which the controller mutates through the explicit setters.

pub mod modes;
pub mod schema;

pub use modes::{ModeDescriptor, ModeRegistry};
pub use schema::{CableConfig, DaemonConfig, GadgetIdentity, ModeSettings, PolicyConfig};
