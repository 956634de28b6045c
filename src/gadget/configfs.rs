//! ConfigFS gadget backend
//!
//! Drives a composite gadget assembled under `/config/usb_gadget/g1`.
//! Functions are registered as directories under `functions/` and enabled
//! by symlinking them into the active configuration `configs/b.1`; the
//! gadget attaches to the bus when the UDC attribute holds a controller
//! name and detaches when it holds the empty string.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use tracing::{debug, warn};

use super::sysfs;
use crate::config::GadgetIdentity;
use crate::error::{Error, Result};
use crate::system::SystemActions;

/// Default gadget root probed at startup
pub const CONFIGFS_GADGET: &str = "/config/usb_gadget/g1";

/// Class directory listing the available USB device controllers
pub const UDC_CLASS_DIR: &str = "/sys/class/udc";

const FUNCTION_MASS_STORAGE: &str = "mass_storage.usb0";
const FUNCTION_RNDIS: &str = "rndis_bam.rndis";
const FUNCTION_MTP: &str = "ffs.mtp";

const MTP_EP0_PATH: &str = "/dev/mtp/ep0";

/// The MTP daemon must write its descriptors to the control endpoint
/// before the UDC can be enabled
const MTP_SETTLE: Duration = Duration::from_millis(1500);

pub struct ConfigFsGadget {
    root: PathBuf,
    udc_class: PathBuf,
    udc_name: OnceLock<String>,
    identity: GadgetIdentity,
    system: Arc<dyn SystemActions>,
}

impl ConfigFsGadget {
    pub fn new(identity: GadgetIdentity, system: Arc<dyn SystemActions>) -> Self {
        Self::with_roots(
            PathBuf::from(CONFIGFS_GADGET),
            PathBuf::from(UDC_CLASS_DIR),
            identity,
            system,
        )
    }

    pub fn with_roots(
        root: PathBuf,
        udc_class: PathBuf,
        identity: GadgetIdentity,
        system: Arc<dyn SystemActions>,
    ) -> Self {
        Self {
            root,
            udc_class,
            udc_name: OnceLock::new(),
            identity,
            system,
        }
    }

    pub fn in_use(&self) -> bool {
        self.root.exists()
    }

    fn config_dir(&self) -> PathBuf {
        self.root.join("configs/b.1")
    }

    fn function_dir(&self, function: &str) -> PathBuf {
        self.root.join("functions").join(function)
    }

    /// Map the short names used in mode configuration to the function
    /// directories this gadget uses.
    fn map_function(function: &str) -> &str {
        match function {
            "mass_storage" => FUNCTION_MASS_STORAGE,
            "rndis" => FUNCTION_RNDIS,
            "mtp" => FUNCTION_MTP,
            // accepted for existing configuration files
            "ffs" => FUNCTION_MTP,
            other => other,
        }
    }

    /// Controller name written to the UDC attribute to attach the gadget.
    ///
    /// Discovered once: the first non-dotfile symlink under the UDC class
    /// directory. Empty when the kernel exposes no controller.
    fn udc_enable_value(&self) -> &str {
        self.udc_name.get_or_init(|| {
            let entries = match std::fs::read_dir(&self.udc_class) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("{}: no UDC class directory: {}", self.udc_class.display(), e);
                    return String::new();
                }
            };

            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let is_symlink = entry
                    .file_type()
                    .map(|t| t.is_symlink())
                    .unwrap_or(false);
                if !is_symlink {
                    continue;
                }
                debug!("UDC controller: {}", name);
                return name;
            }

            warn!("no UDC controller found under {}", self.udc_class.display());
            String::new()
        })
    }

    fn write_udc(&self, value: &str) -> Result<()> {
        let path = self.root.join("UDC");
        // The kernel rejects redundant writes; check first
        let current = sysfs::read_attr(&path)?;
        if current != value {
            sysfs::write_attr(&path, value)?;
        }
        Ok(())
    }

    pub fn set_udc(&self, enable: bool) -> Result<()> {
        debug!("UDC - {}", if enable { "ENABLE" } else { "DISABLE" });
        let value = if enable {
            self.udc_enable_value().to_string()
        } else {
            String::new()
        };
        self.write_udc(&value)
    }

    fn register_function(&self, function: &str) -> Result<PathBuf> {
        let path = self.function_dir(function);
        sysfs::ensure_dir(&path)?;
        debug!("function {} is registered", function);
        Ok(path)
    }

    fn enable_function(&self, function: &str) -> Result<()> {
        let fpath = self.register_function(function)?;
        let cpath = self.config_dir().join(function);
        sysfs::replace_symlink(&fpath, &cpath)?;
        debug!("function {} is enabled", function);
        Ok(())
    }

    fn disable_all_functions(&self) -> Result<()> {
        let config_dir = self.config_dir();
        let mut failed = false;

        for entry in std::fs::read_dir(&config_dir)? {
            let entry = entry?;
            let is_symlink = entry
                .file_type()
                .map(|t| t.is_symlink())
                .unwrap_or(false);
            if !is_symlink {
                continue;
            }
            if let Err(e) = sysfs::remove_symlink(&entry.path()) {
                warn!("disabling {:?} failed: {}", entry.file_name(), e);
                failed = true;
            }
        }

        if failed {
            return Err(Error::TransitionFailed(
                "could not disable all gadget functions".to_string(),
            ));
        }
        debug!("all functions are disabled");
        Ok(())
    }

    /// Best-effort attribute write used during one-time setup
    fn setup_write(&self, path: &Path, value: &str) {
        if let Err(e) = sysfs::write_attr(path, value) {
            warn!("{}", e);
        }
    }

    /// One-time gadget setup: identity strings and the function set every
    /// supported mode draws from. Leaves the UDC disabled; it is enabled
    /// on cable connect.
    pub fn init_values(&self) -> Result<()> {
        if !self.in_use() {
            return Err(Error::ConfigAbsent(format!(
                "{}: gadget root absent",
                self.root.display()
            )));
        }

        if let Err(e) = self.set_udc(false) {
            warn!("disabling UDC during setup failed: {}", e);
        }

        self.setup_write(
            &self.root.join("idVendor"),
            &sysfs::normalize_hex_id(&self.identity.vendor_id),
        );
        self.setup_write(
            &self.root.join("idProduct"),
            &sysfs::normalize_hex_id(&self.identity.product_id),
        );

        let strings = self.root.join("strings/0x409");
        if let Err(e) = std::fs::create_dir_all(&strings) {
            warn!("{}: creating strings directory failed: {}", strings.display(), e);
        }
        self.setup_write(&strings.join("manufacturer"), &self.identity.manufacturer);
        self.setup_write(&strings.join("product"), &self.identity.product);
        self.setup_write(&strings.join("serialnumber"), &self.identity.serial);

        // charging_only draws on mass storage
        if let Err(e) = self.register_function(FUNCTION_MASS_STORAGE) {
            warn!("{}", e);
        }

        // mtp_mode needs FunctionFS mounted before the daemon can attach
        if let Err(e) = self.register_function(FUNCTION_MTP) {
            warn!("{}", e);
        }
        if !Path::new(MTP_EP0_PATH).exists() {
            if let Err(e) = self.system.mount_mtp_functionfs() {
                warn!("mounting mtp functionfs failed: {}", e);
            }
        }

        // developer_mode uses RNDIS networking
        if let Err(e) = self.register_function(FUNCTION_RNDIS) {
            warn!("{}", e);
        }
        if let Some(mac) = &self.identity.rndis_mac {
            self.setup_write(&self.function_dir(FUNCTION_RNDIS).join("ethaddr"), mac);
        }
        // Required for RNDIS discovery on Windows hosts
        self.setup_write(&self.function_dir(FUNCTION_RNDIS).join("wceis"), "1");

        Ok(())
    }

    /// Switch the active configuration to `function`.
    ///
    /// Leaves the UDC disabled so the caller can adjust attributes before
    /// attaching to the bus.
    pub fn set_function(&self, function: &str) -> Result<()> {
        if !self.in_use() {
            return Err(Error::ConfigAbsent(format!(
                "{}: gadget root absent",
                self.root.display()
            )));
        }

        let function = Self::map_function(function);
        debug!("CONFIGFS set_function({})", function);

        // The MTP daemon holds the control endpoint; stop it before
        // switching to anything else.
        if function != FUNCTION_MTP {
            let _ = self.system.stop_mtp_service();
        }

        self.set_udc(false)?;
        self.disable_all_functions()?;
        self.enable_function(function)?;

        if function == FUNCTION_MTP {
            self.system.start_mtp_service()?;
            self.system.settle(MTP_SETTLE);
        }

        Ok(())
    }

    /// Minimal charging-only configuration with the UDC enabled.
    pub fn set_charging_mode(&self) -> Result<()> {
        self.set_function("mass_storage")?;
        self.set_product_id(&self.identity.charging_product_id)?;
        self.set_udc(true)?;
        Ok(())
    }

    pub fn set_product_id(&self, id: &str) -> Result<()> {
        if !self.in_use() {
            return Err(Error::ConfigAbsent(format!(
                "{}: gadget root absent",
                self.root.display()
            )));
        }
        sysfs::write_attr(&self.root.join("idProduct"), &sysfs::normalize_hex_id(id))
    }

    pub fn set_vendor_id(&self, id: &str) -> Result<()> {
        if !self.in_use() {
            return Err(Error::ConfigAbsent(format!(
                "{}: gadget root absent",
                self.root.display()
            )));
        }
        sysfs::write_attr(&self.root.join("idVendor"), &sysfs::normalize_hex_id(id))
    }
}
