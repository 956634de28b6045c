//! Mode selection policy
//!
//! `select_mode` is a pure function from the observed situation to the
//! internal mode the controller should request. All inputs are passed in;
//! nothing here touches the filesystem or the bus.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ModeRegistry, ModeSettings};
use crate::error::{Error, Result};
use crate::modes::{MODE_ASK, MODE_CHARGING_FALLBACK, MODE_DEVELOPER};

/// The user owning the active session, when one can be determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserId {
    Unknown,
    Uid(u32),
}

impl UserId {
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Device-wide policy flags affecting mode selection
#[derive(Debug, Clone, Default)]
pub struct DevicePolicy {
    /// Force developer mode regardless of configuration
    pub rescue_mode: bool,
    /// Diagnostic boot: the first configured mode wins
    pub diag_mode: bool,
    /// Device lock state
    pub device_unlocked: bool,
    /// Device is in acting-dead (charging-while-off) state
    pub acting_dead: bool,
    /// Do not leave developer mode on user change
    pub keep_developer_mode: bool,
}

impl DevicePolicy {
    /// Whether exposing user data over USB is currently permitted.
    pub fn can_export(&self) -> bool {
        self.device_unlocked && !self.acting_dead
    }
}

/// Pick the internal mode for a PC connection.
///
/// `user_changed` forces the charging fallback: a freshly switched user has
/// not consented to whatever mode the previous one configured.
pub fn select_mode(
    policy: &DevicePolicy,
    settings: &ModeSettings,
    registry: &ModeRegistry,
    user: UserId,
    user_changed: bool,
) -> Result<String> {
    if policy.rescue_mode {
        info!("rescue mode requested, entering {}", MODE_DEVELOPER);
        return Ok(MODE_DEVELOPER.to_string());
    }

    if policy.diag_mode {
        // Diagnostic setups configure exactly one mode, loaded first.
        let Some(descriptor) = registry.first() else {
            return Err(Error::Fatal(
                "diagnostic mode requested but no modes are configured".to_string(),
            ));
        };
        info!("diagnostic mode requested, entering {}", descriptor.name);
        return Ok(descriptor.name.clone());
    }

    let mut mode = Some(settings.mode_for(user).to_string());

    if mode.as_deref() == Some(MODE_ASK) {
        if !user.is_known() {
            // Nobody to ask; stay on charging until a session appears
            mode = None;
        } else {
            let mut available = registry.available_modes(settings);
            if available.len() == 1 {
                debug!("single available mode, skipping ask dialog");
                mode = available.pop();
            }
        }
    }

    match mode {
        Some(mode) if !mode.is_empty() && policy.can_export() && !user_changed => Ok(mode),
        _ => {
            debug!(
                "no exportable mode (can_export={}, user_changed={}), falling back",
                policy.can_export(),
                user_changed
            );
            Ok(MODE_CHARGING_FALLBACK.to_string())
        }
    }
}
