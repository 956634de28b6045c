//! Gadget backends
//!
//! Two realizations of the same capability set: the ConfigFS composite
//! gadget and the legacy Android sysfs gadget. Which one is in use is
//! decided exactly once at startup by probing the filesystem roots, and
//! the choice never changes afterwards.

pub mod android;
pub mod configfs;
pub mod sysfs;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

pub use android::{AndroidGadget, ANDROID0_ROOT};
pub use configfs::{ConfigFsGadget, CONFIGFS_GADGET, UDC_CLASS_DIR};

use crate::config::GadgetIdentity;
use crate::error::{Error, Result};
use crate::system::SystemActions;

/// Which gadget mechanism the running kernel exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    ConfigFs,
    Android,
}

/// Backend dispatch, fixed at startup
pub enum GadgetBackend {
    ConfigFs(ConfigFsGadget),
    Android(AndroidGadget),
}

impl GadgetBackend {
    /// Probe the filesystem roots in order: ConfigFS first, then the
    /// Android gadget. No root at all fails daemon initialization.
    pub fn probe(identity: &GadgetIdentity, system: Arc<dyn SystemActions>) -> Result<Self> {
        if Path::new(CONFIGFS_GADGET).exists() {
            info!("CONFIGFS gadget detected");
            return Ok(Self::ConfigFs(ConfigFsGadget::new(identity.clone(), system)));
        }
        if Path::new(ANDROID0_ROOT).exists() {
            info!("ANDROID gadget detected");
            return Ok(Self::Android(AndroidGadget::new(identity.clone())));
        }
        Err(Error::Fatal(
            "no usb gadget backend found on this kernel".to_string(),
        ))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::ConfigFs(_) => BackendKind::ConfigFs,
            Self::Android(_) => BackendKind::Android,
        }
    }

    pub fn in_use(&self) -> bool {
        match self {
            Self::ConfigFs(g) => g.in_use(),
            Self::Android(g) => g.in_use(),
        }
    }

    pub fn init_values(&self) -> Result<()> {
        match self {
            Self::ConfigFs(g) => g.init_values(),
            Self::Android(g) => g.init_values(),
        }
    }

    pub fn set_udc(&self, enable: bool) -> Result<()> {
        match self {
            Self::ConfigFs(g) => g.set_udc(enable),
            Self::Android(g) => g.set_udc(enable),
        }
    }

    pub fn set_function(&self, function: &str) -> Result<()> {
        match self {
            Self::ConfigFs(g) => g.set_function(function),
            Self::Android(g) => g.set_function(function),
        }
    }

    pub fn set_charging_mode(&self) -> Result<()> {
        match self {
            Self::ConfigFs(g) => g.set_charging_mode(),
            Self::Android(g) => g.set_charging_mode(),
        }
    }

    pub fn set_product_id(&self, id: &str) -> Result<()> {
        match self {
            Self::ConfigFs(g) => g.set_product_id(id),
            Self::Android(g) => g.set_product_id(id),
        }
    }

    pub fn set_vendor_id(&self, id: &str) -> Result<()> {
        match self {
            Self::ConfigFs(g) => g.set_vendor_id(id),
            Self::Android(g) => g.set_vendor_id(id),
        }
    }
}
