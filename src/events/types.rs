//! Signal types emitted over the bridge bus

use serde::{Deserialize, Serialize};

/// Event name broadcast when the UI should open the mode-selection dialog
pub const EVENT_CONNECTED_DIALOG_SHOW: &str = "connected_dialog_show";

/// Signals the controller emits towards the IPC bridge
///
/// The wire format is the bridge's concern; the serde tagging here produces
/// the JSON shape
/// `{"signal": "usb.current_state", "data": {"mode": "mtp_mode"}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "data")]
pub enum UsbSignal {
    /// External mode changed
    #[serde(rename = "usb.current_state")]
    CurrentState { mode: String },

    /// Target mode changed
    #[serde(rename = "usb.target_state")]
    TargetState { mode: String },

    /// One-shot event, e.g. the connect dialog request
    #[serde(rename = "usb.event")]
    Event { name: String },

    /// Supported mode list changed
    #[serde(rename = "usb.supported_modes")]
    SupportedModes { modes: Vec<String> },

    /// Hidden mode list changed
    #[serde(rename = "usb.hidden_modes")]
    HiddenModes { modes: Vec<String> },

    /// Whitelist changed
    #[serde(rename = "usb.whitelisted_modes")]
    WhitelistedModes { modes: Vec<String> },
}

impl UsbSignal {
    /// Signal name, for filtering and routing.
    pub fn signal_name(&self) -> &'static str {
        match self {
            Self::CurrentState { .. } => "usb.current_state",
            Self::TargetState { .. } => "usb.target_state",
            Self::Event { .. } => "usb.event",
            Self::SupportedModes { .. } => "usb.supported_modes",
            Self::HiddenModes { .. } => "usb.hidden_modes",
            Self::WhitelistedModes { .. } => "usb.whitelisted_modes",
        }
    }
}
