//! Mode descriptors
//!
//! A `ModeDescriptor` is an immutable record describing how one mode is
//! realized on the hardware. The records are loaded at startup and never
//! change for the life of the process (short of an explicit reload).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ModeSettings;
use crate::error::Result;
use crate::modes;

/// How one mode is realized on the hardware
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeDescriptor {
    /// Canonical mode name
    pub name: String,
    /// Kernel module the mode depends on
    pub module: Option<String>,
    /// Primary attribute written when entering and reset when leaving
    pub sysfs_path: Option<PathBuf>,
    /// Value written to `sysfs_path`; doubles as the gadget function name
    pub sysfs_value: Option<String>,
    /// Value restored to `sysfs_path` when the mode is left
    pub sysfs_reset_value: Option<String>,
    pub softconnect_path: Option<PathBuf>,
    pub softconnect: Option<String>,
    pub softconnect_disconnect: Option<String>,
    /// Product id override, hex text
    pub id_product: Option<String>,
    /// Vendor id override, hex text
    pub id_vendor_override: Option<String>,
    /// Extra attribute writes applied in order before the function switch
    pub android_extra_sysfs_path: Option<PathBuf>,
    pub android_extra_sysfs_value: Option<String>,
    pub android_extra_sysfs_path2: Option<PathBuf>,
    pub android_extra_sysfs_value2: Option<String>,
    pub android_extra_sysfs_path3: Option<PathBuf>,
    pub android_extra_sysfs_value3: Option<String>,
    pub android_extra_sysfs_path4: Option<PathBuf>,
    pub android_extra_sysfs_value4: Option<String>,
    /// Bring up networking for this mode (handled by a collaborator)
    pub network: bool,
    pub network_interface: Option<String>,
    /// Launch synchronized applications on mode entry (collaborator)
    pub appsync: bool,
    /// The mode exposes mass storage
    pub mass_storage: bool,
    pub nat: bool,
    pub dhcp_server: bool,
}

impl ModeDescriptor {
    /// Gadget function to enact for this mode.
    pub fn function(&self) -> &str {
        if self.mass_storage {
            "mass_storage"
        } else if let Some(value) = self.sysfs_value.as_deref() {
            value
        } else if self.network {
            "rndis"
        } else {
            "mtp"
        }
    }

    /// Attribute writes applied, in order, before the function switch.
    pub fn extra_writes(&self) -> Vec<(&Path, &str)> {
        let pairs = [
            (&self.android_extra_sysfs_path, &self.android_extra_sysfs_value),
            (
                &self.android_extra_sysfs_path2,
                &self.android_extra_sysfs_value2,
            ),
            (
                &self.android_extra_sysfs_path3,
                &self.android_extra_sysfs_value3,
            ),
            (
                &self.android_extra_sysfs_path4,
                &self.android_extra_sysfs_value4,
            ),
        ];

        pairs
            .into_iter()
            .filter_map(|(path, value)| match (path, value) {
                (Some(p), Some(v)) => Some((p.as_path(), v.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Attribute writes restoring the hardware when this mode is left.
    pub fn reset_writes(&self) -> Vec<(&Path, &str)> {
        let mut writes = Vec::new();
        if let (Some(path), Some(value)) = (&self.sysfs_path, &self.sysfs_reset_value) {
            writes.push((path.as_path(), value.as_str()));
        }
        if let (Some(path), Some(value)) = (&self.softconnect_path, &self.softconnect_disconnect) {
            writes.push((path.as_path(), value.as_str()));
        }
        writes
    }

    /// Attribute write attaching the gadget on kernels using softconnect.
    pub fn softconnect_write(&self) -> Option<(&Path, &str)> {
        match (&self.softconnect_path, &self.softconnect) {
            (Some(path), Some(value)) => Some((path.as_path(), value.as_str())),
            _ => None,
        }
    }
}

/// Ordered collection of mode descriptors loaded at startup
#[derive(Debug, Default)]
pub struct ModeRegistry {
    modes: Vec<ModeDescriptor>,
}

impl ModeRegistry {
    pub fn new(modes: Vec<ModeDescriptor>) -> Self {
        let modes = modes
            .into_iter()
            .filter(|m| {
                if m.name.is_empty() {
                    warn!("dropping mode descriptor without a name");
                    false
                } else if modes::is_reserved(&m.name) {
                    warn!("dropping descriptor for reserved mode name {}", m.name);
                    false
                } else {
                    true
                }
            })
            .collect();
        Self { modes }
    }

    /// Load every `*.json` descriptor under `dir`, ordered by file name.
    /// A missing directory yields an empty registry.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("mode directory {} does not exist", dir.display());
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        paths.sort();

        let mut modes = Vec::with_capacity(paths.len());
        for path in paths {
            let text = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<ModeDescriptor>(&text) {
                Ok(descriptor) => {
                    debug!("loaded mode {} from {}", descriptor.name, path.display());
                    modes.push(descriptor);
                }
                Err(e) => warn!("skipping malformed descriptor {}: {}", path.display(), e),
            }
        }

        Ok(Self::new(modes))
    }

    pub fn get(&self, name: &str) -> Option<&ModeDescriptor> {
        self.modes.iter().find(|m| m.name == name)
    }

    /// First descriptor in load order; diagnostic setups configure exactly one.
    pub fn first(&self) -> Option<&ModeDescriptor> {
        self.modes.first()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    /// All mode names not hidden by the settings.
    pub fn supported_modes(&self, settings: &ModeSettings) -> Vec<String> {
        self.modes
            .iter()
            .filter(|m| !settings.is_hidden(&m.name))
            .map(|m| m.name.clone())
            .collect()
    }

    /// Modes a user may actually select: not hidden and whitelisted.
    pub fn available_modes(&self, settings: &ModeSettings) -> Vec<String> {
        self.modes
            .iter()
            .filter(|m| !settings.is_hidden(&m.name) && settings.in_whitelist(&m.name))
            .map(|m| m.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(name: &str) -> ModeDescriptor {
        ModeDescriptor {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_function_derivation() {
        let mut desc = descriptor("mtp_mode");
        assert_eq!(desc.function(), "mtp");

        desc.sysfs_value = Some("rndis".to_string());
        assert_eq!(desc.function(), "rndis");

        desc.mass_storage = true;
        assert_eq!(desc.function(), "mass_storage");
    }

    #[test]
    fn test_extra_writes_ordered() {
        let mut desc = descriptor("developer_mode");
        desc.android_extra_sysfs_path = Some(PathBuf::from("/a"));
        desc.android_extra_sysfs_value = Some("1".to_string());
        desc.android_extra_sysfs_path3 = Some(PathBuf::from("/c"));
        desc.android_extra_sysfs_value3 = Some("3".to_string());
        // path2 without a value contributes nothing
        desc.android_extra_sysfs_path2 = Some(PathBuf::from("/b"));

        let writes = desc.extra_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], (Path::new("/a"), "1"));
        assert_eq!(writes[1], (Path::new("/c"), "3"));
    }

    #[test]
    fn test_registry_filters_reserved_names() {
        let registry = ModeRegistry::new(vec![
            descriptor("mtp_mode"),
            descriptor("busy"),
            descriptor(""),
        ]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("mtp_mode").is_some());
        assert!(registry.get("busy").is_none());
    }

    #[test]
    fn test_registry_from_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("10-mtp.json"),
            r#"{"name": "mtp_mode", "sysfs_value": "mtp"}"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("20-dev.json"),
            r#"{"name": "developer_mode", "sysfs_value": "rndis", "network": true}"#,
        )
        .unwrap();
        std::fs::write(tmp.path().join("30-bad.json"), "{ not json").unwrap();
        std::fs::write(tmp.path().join("README"), "ignored").unwrap();

        let registry = ModeRegistry::from_dir(tmp.path()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.first().unwrap().name, "mtp_mode");
        assert!(registry.get("developer_mode").unwrap().network);
    }

    #[test]
    fn test_registry_missing_dir_is_empty() {
        let registry = ModeRegistry::from_dir(Path::new("/nonexistent/modes.d")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_available_modes_respects_filters() {
        let registry = ModeRegistry::new(vec![
            descriptor("mtp_mode"),
            descriptor("developer_mode"),
            descriptor("mass_storage"),
        ]);
        let mut settings = ModeSettings::default();
        settings.hide_mode("mass_storage");
        settings.set_whitelist(vec!["mtp_mode".to_string(), "mass_storage".to_string()]);

        assert_eq!(
            registry.supported_modes(&settings),
            vec!["mtp_mode", "developer_mode"]
        );
        assert_eq!(registry.available_modes(&settings), vec!["mtp_mode"]);
    }
}
