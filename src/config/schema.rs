use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::modes::MODE_ASK;
use crate::policy::UserId;

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// USB identity written to the gadget at startup
    pub gadget: GadgetIdentity,
    /// Power-supply observation settings
    pub cable: CableConfig,
    /// Policy knobs
    pub policy: PolicyConfig,
    /// Mode selection settings
    pub settings: ModeSettings,
    /// Directory holding per-mode descriptor files
    pub modes_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            gadget: GadgetIdentity::default(),
            cable: CableConfig::default(),
            policy: PolicyConfig::default(),
            settings: ModeSettings::default(),
            modes_dir: PathBuf::from("/etc/usbgadgetd/modes.d"),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }
}

/// USB device identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GadgetIdentity {
    /// Vendor id, hex text (`1d6b` or `0x1d6b`)
    pub vendor_id: String,
    /// Default product id, hex text
    pub product_id: String,
    /// Product id presented while in a charging-only configuration
    pub charging_product_id: String,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    /// MAC address written to the RNDIS function, when present
    pub rndis_mac: Option<String>,
}

impl Default for GadgetIdentity {
    fn default() -> Self {
        Self {
            vendor_id: "1d6b".to_string(),
            product_id: "0104".to_string(),
            charging_product_id: "0AFE".to_string(),
            manufacturer: "Mer".to_string(),
            product: "USB Gadget".to_string(),
            serial: "0123456789".to_string(),
            rndis_mac: None,
        }
    }
}

/// Power-supply observation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CableConfig {
    /// Explicit sysfs path of the power-supply device; discovery heuristics
    /// run when absent
    pub device_path: Option<PathBuf>,
    /// Kernel subsystem to watch
    pub subsystem: String,
}

impl Default for CableConfig {
    fn default() -> Self {
        Self {
            device_path: None,
            subsystem: "power_supply".to_string(),
        }
    }
}

/// Policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Do not leave developer mode on user change
    pub keep_developer_mode: bool,
    /// External synonym published while internally in charging fallback
    pub fallback_external: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            keep_developer_mode: false,
            fallback_external: crate::modes::MODE_CHARGING_ONLY.to_string(),
        }
    }
}

/// Mode selection settings
///
/// Per-user configured modes plus the hidden-mode and whitelist filters.
/// Mutators report whether anything changed so callers know when to
/// rebroadcast the configuration signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeSettings {
    /// Mode used while no user session is active
    pub global_mode: String,
    /// Per-user configured mode, keyed by uid
    pub user_modes: BTreeMap<u32, String>,
    /// Modes never offered or accepted
    pub hidden: Vec<String>,
    /// When non-empty, the only modes that may be requested
    pub whitelist: Vec<String>,
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self {
            global_mode: MODE_ASK.to_string(),
            user_modes: BTreeMap::new(),
            hidden: Vec::new(),
            whitelist: Vec::new(),
        }
    }
}

impl ModeSettings {
    /// Configured mode for a user; the global slot when the user is unknown.
    pub fn mode_for(&self, user: UserId) -> &str {
        match user {
            UserId::Uid(uid) => self
                .user_modes
                .get(&uid)
                .map(String::as_str)
                .unwrap_or(&self.global_mode),
            UserId::Unknown => &self.global_mode,
        }
    }

    pub fn set_mode_setting(&mut self, user: UserId, mode: &str) -> bool {
        match user {
            UserId::Uid(uid) => {
                let previous = self.user_modes.insert(uid, mode.to_string());
                previous.as_deref() != Some(mode)
            }
            UserId::Unknown => {
                if self.global_mode == mode {
                    false
                } else {
                    self.global_mode = mode.to_string();
                    true
                }
            }
        }
    }

    pub fn is_hidden(&self, mode: &str) -> bool {
        self.hidden.iter().any(|m| m == mode)
    }

    /// Empty whitelist permits everything.
    pub fn in_whitelist(&self, mode: &str) -> bool {
        self.whitelist.is_empty() || self.whitelist.iter().any(|m| m == mode)
    }

    pub fn hide_mode(&mut self, mode: &str) -> bool {
        if self.is_hidden(mode) {
            return false;
        }
        self.hidden.push(mode.to_string());
        true
    }

    pub fn unhide_mode(&mut self, mode: &str) -> bool {
        let before = self.hidden.len();
        self.hidden.retain(|m| m != mode);
        self.hidden.len() != before
    }

    pub fn set_whitelist(&mut self, modes: Vec<String>) -> bool {
        if self.whitelist == modes {
            return false;
        }
        self.whitelist = modes;
        true
    }

    pub fn set_mode_in_whitelist(&mut self, mode: &str, allowed: bool) -> bool {
        let present = self.whitelist.iter().any(|m| m == mode);
        match (present, allowed) {
            (false, true) => {
                self.whitelist.push(mode.to_string());
                true
            }
            (true, false) => {
                self.whitelist.retain(|m| m != mode);
                true
            }
            _ => false,
        }
    }
}
