//! Cable state classification
//!
//! Raw power-supply properties are folded into a four-valued cable state.
//! Classification is a pure function over the property map so the mapping
//! table can be tested without any kernel involvement.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

/// Debounced cable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CableState {
    #[default]
    Unknown,
    Disconnected,
    ChargerConnected,
    PcConnected,
}

impl CableState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::ChargerConnected | Self::PcConnected)
    }
}

impl fmt::Display for CableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Disconnected => "disconnected",
            Self::ChargerConnected => "charger_connected",
            Self::PcConnected => "pc_connected",
        };
        f.write_str(name)
    }
}

/// Owned snapshot of a power-supply device's properties
///
/// Populated either from a udev event's property list or from a sysfs
/// `uevent` file; both use the same `POWER_SUPPLY_*` keys.
#[derive(Debug, Clone, Default)]
pub struct PowerSupplyProps {
    props: HashMap<String, String>,
}

impl PowerSupplyProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.props.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    /// Parse the `KEY=value` lines of a sysfs `uevent` file.
    pub fn parse_uevent(text: &str) -> Self {
        let mut props = Self::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                props.insert(key.trim(), value.trim());
            }
        }
        props
    }

    /// Classify the properties into a cable state.
    ///
    /// `previously_connected` only affects the log level of the USB_FLOAT
    /// fallback warning.
    pub fn classify(&self, previously_connected: bool) -> CableState {
        // Check PRESENT first: some drivers use ONLINE to mean "charging
        // enabled" rather than "cable attached".
        let (present, via_online) = match self.get("POWER_SUPPLY_PRESENT") {
            Some(value) => (Some(value), false),
            None => (self.get("POWER_SUPPLY_ONLINE"), true),
        };

        let Some(present) = present else {
            warn!("no usable power supply indicator");
            return CableState::Disconnected;
        };

        if present != "1" {
            return CableState::Disconnected;
        }

        if via_online {
            debug!("using POWER_SUPPLY_ONLINE property");
        }

        // Some devices carry the type usb-moded style daemons expect in
        // POWER_SUPPLY_TYPE under POWER_SUPPLY_REAL_TYPE instead.
        let supply_type = self
            .get("POWER_SUPPLY_REAL_TYPE")
            .or_else(|| self.get("POWER_SUPPLY_TYPE"));

        let Some(supply_type) = supply_type else {
            warn!("power supply type missing, assuming pc connection");
            return CableState::PcConnected;
        };

        debug!("connected, power supply type = {}", supply_type);

        match supply_type {
            "USB" | "USB_CDP" => CableState::PcConnected,
            "USB_DCP" | "USB_HVDCP" | "USB_HVDCP_3" => CableState::ChargerConnected,
            "USB_FLOAT" => {
                if !previously_connected {
                    warn!("connection type detection failed, assuming charger");
                }
                CableState::ChargerConnected
            }
            "Unknown" => {
                warn!("unknown connection type reported, assuming disconnected");
                CableState::Disconnected
            }
            other => {
                warn!("unhandled power supply type: {}", other);
                CableState::Disconnected
            }
        }
    }
}
