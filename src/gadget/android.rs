//! Android-sysfs gadget backend
//!
//! Legacy vendor kernels expose a fixed-shape gadget through
//! `/sys/class/android_usb/android0`. The gadget is reconfigured by
//! disabling it, writing the new function list, and enabling it again;
//! there is no separate UDC attribute.

use std::path::PathBuf;

use tracing::{debug, warn};

use super::sysfs;
use crate::config::GadgetIdentity;
use crate::error::{Error, Result};

/// Default gadget root probed at startup
pub const ANDROID0_ROOT: &str = "/sys/class/android_usb/android0";

pub struct AndroidGadget {
    root: PathBuf,
    identity: GadgetIdentity,
}

impl AndroidGadget {
    pub fn new(identity: GadgetIdentity) -> Self {
        Self::with_root(PathBuf::from(ANDROID0_ROOT), identity)
    }

    pub fn with_root(root: PathBuf, identity: GadgetIdentity) -> Self {
        Self { root, identity }
    }

    pub fn in_use(&self) -> bool {
        self.root.exists()
    }

    fn require_root(&self) -> Result<()> {
        if self.in_use() {
            Ok(())
        } else {
            Err(Error::ConfigAbsent(format!(
                "{}: gadget root absent",
                self.root.display()
            )))
        }
    }

    /// Best-effort attribute write used during one-time setup
    fn setup_write(&self, attr: &str, value: &str) {
        if let Err(e) = sysfs::write_attr(&self.root.join(attr), value) {
            warn!("{}", e);
        }
    }

    /// One-time setup: USB identity strings. Idempotent.
    pub fn init_values(&self) -> Result<()> {
        self.require_root()?;

        self.setup_write("idVendor", &sysfs::normalize_hex_id(&self.identity.vendor_id));
        self.setup_write(
            "idProduct",
            &sysfs::normalize_hex_id(&self.identity.product_id),
        );
        self.setup_write("iManufacturer", &self.identity.manufacturer);
        self.setup_write("iProduct", &self.identity.product);
        self.setup_write("iSerial", &self.identity.serial);
        Ok(())
    }

    /// The `enable` attribute doubles as the UDC switch.
    pub fn set_udc(&self, enable: bool) -> Result<()> {
        debug!("ANDROID enable - {}", if enable { "1" } else { "0" });
        sysfs::write_attr(&self.root.join("enable"), if enable { "1" } else { "0" })
    }

    /// Switch the gadget to `function` and re-enable it.
    pub fn set_function(&self, function: &str) -> Result<()> {
        self.require_root()?;
        debug!("ANDROID set_function({})", function);

        sysfs::write_attr(&self.root.join("enable"), "0")?;
        sysfs::write_attr(&self.root.join("functions"), function)?;
        sysfs::write_attr(&self.root.join("enable"), "1")?;
        Ok(())
    }

    /// Minimal charging-only configuration with the gadget enabled.
    pub fn set_charging_mode(&self) -> Result<()> {
        self.set_product_id(&self.identity.charging_product_id)?;
        self.set_function("mass_storage")
    }

    pub fn set_product_id(&self, id: &str) -> Result<()> {
        self.require_root()?;
        sysfs::write_attr(&self.root.join("idProduct"), &sysfs::normalize_hex_id(id))
    }

    pub fn set_vendor_id(&self, id: &str) -> Result<()> {
        self.require_root()?;
        sysfs::write_attr(&self.root.join("idVendor"), &sysfs::normalize_hex_id(id))
    }
}
