//! Power-supply device discovery
//!
//! The configured sysfs path is tried first; when it is absent the
//! `power_supply` class is enumerated and each device is scored by how
//! much it looks like the cable-carrying supply.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::state::PowerSupplyProps;
use crate::error::{Error, Result};

/// Default class directory for power-supply devices
pub const POWER_SUPPLY_CLASS: &str = "/sys/class/power_supply";

/// A discovered power-supply device with its initial properties
#[derive(Debug, Clone)]
pub struct PowerSupplyDevice {
    pub name: String,
    pub syspath: PathBuf,
    pub props: PowerSupplyProps,
}

/// Read a device's current properties from its `uevent` file.
pub fn read_device(syspath: &Path) -> Result<PowerSupplyDevice> {
    let name = syspath
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Config(format!("{}: not a device path", syspath.display())))?;

    let text = std::fs::read_to_string(syspath.join("uevent"))?;
    Ok(PowerSupplyDevice {
        name,
        syspath: syspath.to_path_buf(),
        props: PowerSupplyProps::parse_uevent(&text),
    })
}

/// Score a device by how likely it is to reflect the USB cable.
///
/// Batteries are disqualified outright; otherwise names containing `usb`
/// or `charger` and the presence of the interesting properties add weight.
pub fn score_device(name: &str, props: &PowerSupplyProps) -> i32 {
    if name.contains("battery") || name.contains("BAT") {
        return 0;
    }

    let mut score = 0;
    if name.contains("usb") {
        score += 10;
    }
    if name.contains("charger") {
        score += 5;
    }
    if props.contains("POWER_SUPPLY_PRESENT") {
        score += 5;
    }
    if props.contains("POWER_SUPPLY_ONLINE") {
        score += 10;
    }
    if props.contains("POWER_SUPPLY_TYPE") {
        score += 10;
    }
    score
}

/// Find the power-supply device to observe.
///
/// `configured` wins when it exists; otherwise the highest-scoring device
/// under `class_dir` is picked. No candidate with a positive score is an
/// initialization failure.
pub fn discover(class_dir: &Path, configured: Option<&Path>) -> Result<PowerSupplyDevice> {
    if let Some(path) = configured {
        if path.exists() {
            let device = read_device(path)?;
            info!("using configured power supply {}", device.name);
            return Ok(device);
        }
        debug!(
            "configured power supply {} absent, guessing instead",
            path.display()
        );
    }

    let mut best: Option<(i32, PowerSupplyDevice)> = None;

    for entry in std::fs::read_dir(class_dir)? {
        let entry = entry?;
        let Ok(device) = read_device(&entry.path()) else {
            continue;
        };

        let score = score_device(&device.name, &device.props);
        debug!("power supply candidate {} scored {}", device.name, score);

        if score > best.as_ref().map(|(s, _)| *s).unwrap_or(0) {
            best = Some((score, device));
        }
    }

    match best {
        Some((score, device)) => {
            info!("selected power supply {} (score {})", device.name, score);
            Ok(device)
        }
        None => Err(Error::Fatal(
            "unable to find a power supply device".to_string(),
        )),
    }
}
