//! Reserved mode names
//!
//! Mode names form an open set: every descriptor loaded from configuration
//! introduces a new one. The constants below are the reserved names the
//! controller and worker give special treatment to.

/// No cable attached, or no decision has been made yet.
pub const MODE_UNDEFINED: &str = "undefined";

/// A mode transition is in progress. Only ever visible externally.
pub const MODE_BUSY: &str = "busy";

/// Policy defers the decision to a UI dialog.
pub const MODE_ASK: &str = "ask";

/// A dedicated charger is attached.
pub const MODE_CHARGER: &str = "charger";

/// Cable is a PC connection but data export is not permitted.
pub const MODE_CHARGING_FALLBACK: &str = "charging_fallback";

/// User-visible synonym for modes that only charge.
pub const MODE_CHARGING_ONLY: &str = "charging_only";

/// Developer mode, forced when the rescue flag is set.
pub const MODE_DEVELOPER: &str = "developer_mode";

/// True for names the daemon reserves for itself; descriptors may not
/// redefine these.
pub fn is_reserved(mode: &str) -> bool {
    matches!(
        mode,
        MODE_UNDEFINED | MODE_BUSY | MODE_ASK | MODE_CHARGER | MODE_CHARGING_FALLBACK
    )
}
