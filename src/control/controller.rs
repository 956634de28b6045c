//! Mode controller
//!
//! Owns the `(internal, target, external)` mode triple and is its only
//! mutator. Cable-state changes and bridge requests come in, worker
//! completions come back, and every externally visible change leaves as a
//! signal on the bus.
//!
//! While a switch is in flight the external mode reads `busy`; the newest
//! request always supersedes anything still queued, and a completion for a
//! superseded target is ignored because the worker already holds the newer
//! request.

use std::sync::Arc;

use tracing::{debug, info};

use super::worker::WorkerHandle;
use crate::cable::CableState;
use crate::config::{ModeRegistry, ModeSettings};
use crate::error::{Error, Result};
use crate::events::{SignalBus, UsbSignal, EVENT_CONNECTED_DIALOG_SHOW};
use crate::modes::{
    MODE_ASK, MODE_BUSY, MODE_CHARGER, MODE_CHARGING_FALLBACK, MODE_DEVELOPER, MODE_UNDEFINED,
};
use crate::policy::{select_mode, DevicePolicy, UserId};

/// The mode triple plus the user it was set for
#[derive(Debug, Clone)]
pub struct ControllerState {
    /// Full-precision mode, including fallback values
    pub internal: String,
    /// Mode the daemon is working towards
    pub target: String,
    /// Mode visible on the bus; `busy` during transitions
    pub external: String,
    /// User that owned the session when the mode was reached
    pub user_for_mode: UserId,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            internal: MODE_UNDEFINED.to_string(),
            target: MODE_UNDEFINED.to_string(),
            external: MODE_UNDEFINED.to_string(),
            user_for_mode: UserId::Unknown,
        }
    }
}

pub struct ModeController {
    state: ControllerState,
    cable: CableState,
    current_user: UserId,
    policy: DevicePolicy,
    settings: ModeSettings,
    registry: Arc<ModeRegistry>,
    /// External synonym published for the charging fallback
    fallback_external: String,
    worker: WorkerHandle,
    signals: Arc<SignalBus>,
}

impl ModeController {
    pub fn new(
        registry: Arc<ModeRegistry>,
        settings: ModeSettings,
        policy: DevicePolicy,
        fallback_external: String,
        worker: WorkerHandle,
        signals: Arc<SignalBus>,
    ) -> Self {
        Self {
            state: ControllerState::default(),
            cable: CableState::Unknown,
            current_user: UserId::Unknown,
            policy,
            settings,
            registry,
            fallback_external,
            worker,
            signals,
        }
    }

    pub fn cable_state(&self) -> CableState {
        self.cable
    }

    /// The full-precision internal mode
    pub fn usb_mode(&self) -> &str {
        &self.state.internal
    }

    pub fn target_mode(&self) -> &str {
        &self.state.target
    }

    pub fn external_mode(&self) -> &str {
        &self.state.external
    }

    pub fn user_for_mode(&self) -> UserId {
        self.state.user_for_mode
    }

    /// Cable state changed; converge the mode accordingly.
    pub fn set_cable_state(&mut self, state: CableState) -> Result<()> {
        let prev = self.cable;
        if prev == state {
            return Ok(());
        }
        self.cable = state;
        info!("cable_state: {} -> {}", prev, state);

        match state {
            CableState::Unknown | CableState::Disconnected => {
                self.set_usb_mode(MODE_UNDEFINED);
                Ok(())
            }
            CableState::ChargerConnected => {
                self.set_usb_mode(MODE_CHARGER);
                Ok(())
            }
            CableState::PcConnected => self.select_usb_mode(),
        }
    }

    /// Gauge what mode to enter and request it.
    pub fn select_usb_mode(&mut self) -> Result<()> {
        self.select_usb_mode_ex(false)
    }

    fn select_usb_mode_ex(&mut self, user_changed: bool) -> Result<()> {
        let mode = select_mode(
            &self.policy,
            &self.settings,
            &self.registry,
            self.current_user,
            user_changed,
        )?;
        self.set_usb_mode(&mode);
        Ok(())
    }

    /// Request a mode switch. The target is published before the external
    /// mode goes busy, and the work item is posted last.
    pub fn set_usb_mode(&mut self, mode: &str) {
        if self.state.internal == mode {
            return;
        }
        debug!("internal_mode: {} -> {}", self.state.internal, mode);
        self.state.internal = mode.to_string();

        self.set_target_mode(mode.to_string());
        self.set_external_mode(MODE_BUSY.to_string());

        // Mode owner is unknown until the switch completes
        self.state.user_for_mode = UserId::Unknown;

        self.worker.request_mode(mode);
    }

    /// Worker finished a switch.
    ///
    /// A completion for anything other than the current internal target
    /// belongs to a superseded request; the worker already holds the newer
    /// one, so the transition stays busy and nothing is published.
    pub fn mode_switched(&mut self, requested: &str, achieved: &str) {
        if requested != self.state.internal {
            debug!(
                "completion for superseded target {} ignored (current {})",
                requested, self.state.internal
            );
            return;
        }

        if self.state.internal != achieved {
            debug!("internal_mode: {} -> {}", self.state.internal, achieved);
            self.state.internal = achieved.to_string();
        }

        self.update_external_mode();
        self.state.user_for_mode = self.current_user;
    }

    /// Re-evaluate the charging fallback after a device-lock change.
    ///
    /// Only acts while a PC is connected and the mode is still undecided or
    /// held back; an established mode is never torn down from here.
    pub fn rethink_charging_fallback(&mut self) -> Result<()> {
        if self.cable != CableState::PcConnected {
            return Ok(());
        }
        let current = self.state.internal.as_str();
        if current != MODE_UNDEFINED && current != MODE_CHARGING_FALLBACK {
            return Ok(());
        }
        if !self.policy.can_export() {
            info!("exporting data not allowed; staying in {}", current);
            return Ok(());
        }
        debug!("attempting to leave {}", current);
        self.select_usb_mode()
    }

    /// The session user changed.
    pub fn user_changed(&mut self, user: UserId) -> Result<()> {
        self.current_user = user;

        if self.cable != CableState::PcConnected {
            return Ok(());
        }
        if self.state.internal == MODE_DEVELOPER && self.policy.keep_developer_mode {
            return Ok(());
        }

        let changed = self.current_user != self.state.user_for_mode;
        debug!("user changed: {}", changed);
        if changed {
            self.select_usb_mode_ex(true)
        } else {
            Ok(())
        }
    }

    /// Device lock or acting-dead state changed.
    pub fn set_lock_state(&mut self, unlocked: bool, acting_dead: bool) -> Result<()> {
        self.policy.device_unlocked = unlocked;
        self.policy.acting_dead = acting_dead;
        self.rethink_charging_fallback()
    }

    /// Bridge request to enter a mode, checked against the whitelist and
    /// the requesting user.
    pub fn request_mode(&mut self, mode: &str, uid: u32) -> Result<()> {
        if self.registry.get(mode).is_none() {
            return Err(Error::Config(format!("unknown mode: {}", mode)));
        }
        if self.settings.is_hidden(mode) || !self.settings.in_whitelist(mode) {
            return Err(Error::PolicyDenied(format!("mode {} is not allowed", mode)));
        }

        let permitted = uid == 0
            || match self.current_user {
                UserId::Uid(current) => current == uid,
                UserId::Unknown => false,
            };
        if !permitted {
            return Err(Error::PolicyDenied(format!(
                "uid {} may not change the usb mode",
                uid
            )));
        }

        self.set_usb_mode(mode);
        Ok(())
    }

    pub fn hide_mode(&mut self, mode: &str) {
        if self.settings.hide_mode(mode) {
            self.publish_configuration();
        }
    }

    pub fn unhide_mode(&mut self, mode: &str) {
        if self.settings.unhide_mode(mode) {
            self.publish_configuration();
        }
    }

    pub fn set_whitelist(&mut self, modes: Vec<String>) {
        if self.settings.set_whitelist(modes) {
            self.publish_configuration();
        }
    }

    pub fn set_mode_setting(&mut self, user: UserId, mode: &str) {
        self.settings.set_mode_setting(user, mode);
    }

    /// Broadcast the configuration signals.
    pub fn publish_configuration(&self) {
        self.signals.publish(UsbSignal::SupportedModes {
            modes: self.registry.supported_modes(&self.settings),
        });
        self.signals.publish(UsbSignal::HiddenModes {
            modes: self.settings.hidden.clone(),
        });
        self.signals.publish(UsbSignal::WhitelistedModes {
            modes: self.settings.whitelist.clone(),
        });
    }

    fn map_mode_to_external(&self, internal: &str) -> String {
        if internal == MODE_CHARGING_FALLBACK {
            self.fallback_external.clone()
        } else {
            internal.to_string()
        }
    }

    fn update_external_mode(&mut self) {
        let external = self.map_mode_to_external(&self.state.internal);
        self.set_external_mode(external);
    }

    fn set_external_mode(&mut self, mode: String) {
        if self.state.external == mode {
            return;
        }
        debug!("external_mode: {} -> {}", self.state.external, mode);
        self.state.external = mode.clone();

        if mode == MODE_ASK {
            // The mode proper arrives once the dialog service answers
            self.signals.publish(UsbSignal::Event {
                name: EVENT_CONNECTED_DIALOG_SHOW.to_string(),
            });
        }

        self.signals.publish(UsbSignal::CurrentState { mode: mode.clone() });

        if mode != MODE_BUSY {
            // Stable state reached; synchronize the target. Normally a
            // nop, but needed when the scheduled target could not be
            // reached due to errors or a yanked cable.
            self.set_target_mode(mode);
        }
    }

    fn set_target_mode(&mut self, mode: String) {
        if self.state.target == mode {
            return;
        }
        debug!("target_mode: {} -> {}", self.state.target, mode);
        self.state.target = mode.clone();
        self.signals.publish(UsbSignal::TargetState { mode });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeDescriptor;
    use crate::modes::MODE_CHARGING_ONLY;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::{broadcast, mpsc};

    struct Fixture {
        controller: ModeController,
        worker_rx: mpsc::UnboundedReceiver<String>,
        signal_rx: broadcast::Receiver<UsbSignal>,
    }

    fn descriptor(name: &str) -> ModeDescriptor {
        ModeDescriptor {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn fixture(mode_names: &[&str], settings: ModeSettings, policy: DevicePolicy) -> Fixture {
        let registry = Arc::new(ModeRegistry::new(
            mode_names.iter().map(|n| descriptor(n)).collect(),
        ));
        let signals = Arc::new(SignalBus::new());
        let signal_rx = signals.subscribe();
        let (tx, worker_rx) = mpsc::unbounded_channel();

        Fixture {
            controller: ModeController::new(
                registry,
                settings,
                policy,
                MODE_CHARGING_ONLY.to_string(),
                WorkerHandle { tx },
                signals,
            ),
            worker_rx,
            signal_rx,
        }
    }

    fn unlocked_with_global(mode: &str) -> (ModeSettings, DevicePolicy) {
        let mut settings = ModeSettings::default();
        settings.set_mode_setting(UserId::Unknown, mode);
        let policy = DevicePolicy {
            device_unlocked: true,
            ..Default::default()
        };
        (settings, policy)
    }

    fn drain_signals(rx: &mut broadcast::Receiver<UsbSignal>) -> Vec<UsbSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            signals.push(signal);
        }
        signals
    }

    #[test]
    fn test_pc_connect_happy_path() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode"], settings, policy);

        fx.controller
            .set_cable_state(CableState::PcConnected)
            .unwrap();

        // The work item is posted and the triple reflects the transition
        assert_eq!(fx.worker_rx.try_recv().unwrap(), "mtp_mode");
        assert_eq!(fx.controller.usb_mode(), "mtp_mode");
        assert_eq!(fx.controller.target_mode(), "mtp_mode");
        assert_eq!(fx.controller.external_mode(), MODE_BUSY);
        assert_eq!(fx.controller.user_for_mode(), UserId::Unknown);

        fx.controller.mode_switched("mtp_mode", "mtp_mode");
        assert_eq!(fx.controller.external_mode(), "mtp_mode");

        let signals = drain_signals(&mut fx.signal_rx);
        assert_eq!(
            signals,
            vec![
                UsbSignal::TargetState {
                    mode: "mtp_mode".to_string()
                },
                UsbSignal::CurrentState {
                    mode: MODE_BUSY.to_string()
                },
                UsbSignal::CurrentState {
                    mode: "mtp_mode".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_cable_convergence() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode"], settings, policy);

        fx.controller
            .set_cable_state(CableState::ChargerConnected)
            .unwrap();
        assert_eq!(fx.worker_rx.try_recv().unwrap(), MODE_CHARGER);
        fx.controller.mode_switched(MODE_CHARGER, MODE_CHARGER);
        assert_eq!(fx.controller.external_mode(), MODE_CHARGER);

        fx.controller
            .set_cable_state(CableState::Disconnected)
            .unwrap();
        assert_eq!(fx.worker_rx.try_recv().unwrap(), MODE_UNDEFINED);
        fx.controller.mode_switched(MODE_UNDEFINED, MODE_UNDEFINED);
        assert_eq!(fx.controller.usb_mode(), MODE_UNDEFINED);
        assert_eq!(fx.controller.external_mode(), MODE_UNDEFINED);
    }

    #[test]
    fn test_repeated_cable_state_is_noop() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode"], settings, policy);

        fx.controller
            .set_cable_state(CableState::PcConnected)
            .unwrap();
        fx.worker_rx.try_recv().unwrap();
        fx.controller
            .set_cable_state(CableState::PcConnected)
            .unwrap();
        assert!(fx.worker_rx.try_recv().is_err());
    }

    #[test]
    fn test_same_mode_request_is_noop() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode"], settings, policy);

        fx.controller.set_usb_mode("mtp_mode");
        fx.worker_rx.try_recv().unwrap();
        drain_signals(&mut fx.signal_rx);

        fx.controller.set_usb_mode("mtp_mode");
        assert!(fx.worker_rx.try_recv().is_err());
        assert!(drain_signals(&mut fx.signal_rx).is_empty());
    }

    #[test]
    fn test_newer_request_supersedes_pending() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode", "developer_mode"], settings, policy);

        fx.controller.set_usb_mode("mtp_mode");
        fx.controller.set_usb_mode("developer_mode");
        drain_signals(&mut fx.signal_rx);

        // Completion of the superseded target changes nothing
        fx.controller.mode_switched("mtp_mode", "mtp_mode");
        assert_eq!(fx.controller.external_mode(), MODE_BUSY);
        assert_eq!(fx.controller.usb_mode(), "developer_mode");
        assert!(drain_signals(&mut fx.signal_rx).is_empty());

        // The newer target completes normally
        fx.controller.mode_switched("developer_mode", "developer_mode");
        assert_eq!(fx.controller.external_mode(), "developer_mode");
        assert_eq!(fx.controller.target_mode(), "developer_mode");
    }

    #[test]
    fn test_transition_failure_publishes_fallback_synonym() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode"], settings, policy);

        fx.controller.set_usb_mode("mtp_mode");
        drain_signals(&mut fx.signal_rx);

        // Worker could not reach mtp_mode and fell back
        fx.controller.mode_switched("mtp_mode", MODE_CHARGING_FALLBACK);

        assert_eq!(fx.controller.usb_mode(), MODE_CHARGING_FALLBACK);
        assert_eq!(fx.controller.external_mode(), MODE_CHARGING_ONLY);
        // Stable state synchronized the target to the external synonym
        assert_eq!(fx.controller.target_mode(), MODE_CHARGING_ONLY);

        let signals = drain_signals(&mut fx.signal_rx);
        assert_eq!(
            signals,
            vec![
                UsbSignal::CurrentState {
                    mode: MODE_CHARGING_ONLY.to_string()
                },
                UsbSignal::TargetState {
                    mode: MODE_CHARGING_ONLY.to_string()
                },
            ]
        );
    }

    #[test]
    fn test_ask_emits_dialog_event() {
        let policy = DevicePolicy {
            device_unlocked: true,
            ..Default::default()
        };
        let mut fx = fixture(
            &["mtp_mode", "developer_mode"],
            ModeSettings::default(),
            policy,
        );
        fx.controller.current_user = UserId::Uid(100000);

        fx.controller
            .set_cable_state(CableState::PcConnected)
            .unwrap();
        assert_eq!(fx.worker_rx.try_recv().unwrap(), MODE_ASK);

        fx.controller.mode_switched(MODE_ASK, MODE_ASK);
        let signals = drain_signals(&mut fx.signal_rx);
        assert!(signals.contains(&UsbSignal::Event {
            name: EVENT_CONNECTED_DIALOG_SHOW.to_string()
        }));
        assert_eq!(fx.controller.external_mode(), MODE_ASK);
    }

    #[test]
    fn test_single_available_mode_skips_dialog() {
        let policy = DevicePolicy {
            device_unlocked: true,
            ..Default::default()
        };
        let mut fx = fixture(&["mtp_mode"], ModeSettings::default(), policy);
        fx.controller.current_user = UserId::Uid(100000);

        fx.controller
            .set_cable_state(CableState::PcConnected)
            .unwrap();
        assert_eq!(fx.worker_rx.try_recv().unwrap(), "mtp_mode");

        fx.controller.mode_switched("mtp_mode", "mtp_mode");
        let signals = drain_signals(&mut fx.signal_rx);
        assert!(!signals.iter().any(|s| matches!(s, UsbSignal::Event { .. })));
    }

    #[test]
    fn test_locked_device_falls_back_then_recovers() {
        let mut settings = ModeSettings::default();
        settings.set_mode_setting(UserId::Unknown, "mtp_mode");
        let mut fx = fixture(&["mtp_mode"], settings, DevicePolicy::default());

        fx.controller
            .set_cable_state(CableState::PcConnected)
            .unwrap();
        assert_eq!(fx.worker_rx.try_recv().unwrap(), MODE_CHARGING_FALLBACK);
        fx.controller
            .mode_switched(MODE_CHARGING_FALLBACK, MODE_CHARGING_FALLBACK);

        // Unlocking the device leaves the fallback
        fx.controller.set_lock_state(true, false).unwrap();
        assert_eq!(fx.worker_rx.try_recv().unwrap(), "mtp_mode");
    }

    #[test]
    fn test_rethink_leaves_established_modes_alone() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode"], settings, policy);

        fx.controller
            .set_cable_state(CableState::PcConnected)
            .unwrap();
        fx.worker_rx.try_recv().unwrap();
        fx.controller.mode_switched("mtp_mode", "mtp_mode");

        fx.controller.set_lock_state(true, false).unwrap();
        assert!(fx.worker_rx.try_recv().is_err());
    }

    #[test]
    fn test_user_change_reselects() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode"], settings, policy);

        fx.controller
            .set_cable_state(CableState::PcConnected)
            .unwrap();
        fx.worker_rx.try_recv().unwrap();
        fx.controller.mode_switched("mtp_mode", "mtp_mode");

        // A different user takes the seat; selection falls back because
        // the new user did not pick the mode
        fx.controller.user_changed(UserId::Uid(100001)).unwrap();
        assert_eq!(fx.worker_rx.try_recv().unwrap(), MODE_CHARGING_FALLBACK);
    }

    #[test]
    fn test_keep_developer_mode_survives_user_change() {
        let mut settings = ModeSettings::default();
        settings.set_mode_setting(UserId::Unknown, MODE_DEVELOPER);
        let policy = DevicePolicy {
            device_unlocked: true,
            keep_developer_mode: true,
            ..Default::default()
        };
        let mut fx = fixture(&[MODE_DEVELOPER], settings, policy);

        fx.controller
            .set_cable_state(CableState::PcConnected)
            .unwrap();
        fx.worker_rx.try_recv().unwrap();
        fx.controller.mode_switched(MODE_DEVELOPER, MODE_DEVELOPER);

        fx.controller.user_changed(UserId::Uid(100001)).unwrap();
        assert!(fx.worker_rx.try_recv().is_err());
        assert_eq!(fx.controller.usb_mode(), MODE_DEVELOPER);
    }

    #[test]
    fn test_request_mode_policy_checks() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode", "developer_mode"], settings, policy);
        fx.controller.current_user = UserId::Uid(100000);

        assert!(matches!(
            fx.controller.request_mode("no_such_mode", 0),
            Err(Error::Config(_))
        ));

        fx.controller.settings.hide_mode("developer_mode");
        assert!(matches!(
            fx.controller.request_mode("developer_mode", 0),
            Err(Error::PolicyDenied(_))
        ));

        // A foreign uid may not switch modes, root may
        assert!(matches!(
            fx.controller.request_mode("mtp_mode", 100001),
            Err(Error::PolicyDenied(_))
        ));
        fx.controller.request_mode("mtp_mode", 100000).unwrap();
        assert_eq!(fx.worker_rx.try_recv().unwrap(), "mtp_mode");
    }

    #[test]
    fn test_request_mode_whitelist() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode", "developer_mode"], settings, policy);
        fx.controller.settings.set_whitelist(vec!["mtp_mode".to_string()]);

        assert!(matches!(
            fx.controller.request_mode("developer_mode", 0),
            Err(Error::PolicyDenied(_))
        ));
        fx.controller.request_mode("mtp_mode", 0).unwrap();
    }

    #[test]
    fn test_configuration_signals_on_hide() {
        let (settings, policy) = unlocked_with_global("mtp_mode");
        let mut fx = fixture(&["mtp_mode", "developer_mode"], settings, policy);

        fx.controller.hide_mode("developer_mode");
        let signals = drain_signals(&mut fx.signal_rx);
        assert_eq!(
            signals[0],
            UsbSignal::SupportedModes {
                modes: vec!["mtp_mode".to_string()]
            }
        );
        assert_eq!(
            signals[1],
            UsbSignal::HiddenModes {
                modes: vec!["developer_mode".to_string()]
            }
        );

        // Hiding again changes nothing and stays silent
        fx.controller.hide_mode("developer_mode");
        assert_eq!(fx.signal_rx.try_recv(), Err(TryRecvError::Empty));
    }
}
