//! Host system escape hatches
//!
//! The mode-switch core is otherwise side-effect free outside the gadget
//! filesystem trees; the few places where it has to reach into the wider
//! system (mounting FunctionFS, starting the MTP service, kernel wakelocks)
//! go through the `SystemActions` trait so tests can stub them out.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

const MTP_FUNCTIONFS_DIR: &str = "/dev/mtp";
const MTP_SERVICE: &str = "mtp-server.service";

const WAKE_LOCK_PATH: &str = "/sys/power/wake_lock";
const WAKE_UNLOCK_PATH: &str = "/sys/power/wake_unlock";

/// Actions the daemon performs outside its own gadget trees
pub trait SystemActions: Send + Sync {
    /// Mount FunctionFS for the MTP function at `/dev/mtp`.
    fn mount_mtp_functionfs(&self) -> Result<()>;

    /// Start the userspace MTP service.
    fn start_mtp_service(&self) -> Result<()>;

    /// Stop the userspace MTP service.
    fn stop_mtp_service(&self) -> Result<()>;

    /// Block the calling thread while hardware settles.
    fn settle(&self, delay: Duration);

    /// Keep the device awake while an event is being processed.
    fn acquire_wakelock(&self, tag: &str);

    /// Release a previously acquired wakelock.
    fn release_wakelock(&self, tag: &str);
}

/// Production implementation backed by the running system
pub struct HostSystem;

impl HostSystem {
    pub fn new() -> Self {
        Self
    }

    fn run(program: &str, args: &[&str]) -> Result<()> {
        debug!("EXEC {} {}", program, args.join(" "));
        let status = Command::new(program).args(args).status()?;
        if !status.success() {
            return Err(Error::TransitionFailed(format!(
                "{} exited with {}",
                program, status
            )));
        }
        Ok(())
    }

    fn write_wakelock(path: &str, tag: &str) {
        // Not all kernels expose the wakelock interface; failure only
        // means the device may suspend while we work.
        if let Err(e) = std::fs::write(path, tag) {
            debug!("wakelock write {} failed: {}", path, e);
        }
    }
}

impl Default for HostSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemActions for HostSystem {
    fn mount_mtp_functionfs(&self) -> Result<()> {
        if !Path::new(MTP_FUNCTIONFS_DIR).exists() {
            std::fs::create_dir_all(MTP_FUNCTIONFS_DIR)?;
        }
        Self::run(
            "/bin/mount",
            &[
                "-o",
                "uid=100000,gid=100000",
                "-t",
                "functionfs",
                "mtp",
                MTP_FUNCTIONFS_DIR,
            ],
        )
    }

    fn start_mtp_service(&self) -> Result<()> {
        Self::run("systemctl", &["--user", "start", MTP_SERVICE])
    }

    fn stop_mtp_service(&self) -> Result<()> {
        if let Err(e) = Self::run("systemctl", &["--user", "stop", MTP_SERVICE]) {
            warn!("stopping {} failed: {}", MTP_SERVICE, e);
        }
        Ok(())
    }

    fn settle(&self, delay: Duration) {
        std::thread::sleep(delay);
    }

    fn acquire_wakelock(&self, tag: &str) {
        Self::write_wakelock(WAKE_LOCK_PATH, tag);
    }

    fn release_wakelock(&self, tag: &str) {
        Self::write_wakelock(WAKE_UNLOCK_PATH, tag);
    }
}

/// Inert implementation for tests and for hosts without the MTP helpers
pub struct NoopSystem;

impl SystemActions for NoopSystem {
    fn mount_mtp_functionfs(&self) -> Result<()> {
        Ok(())
    }

    fn start_mtp_service(&self) -> Result<()> {
        Ok(())
    }

    fn stop_mtp_service(&self) -> Result<()> {
        Ok(())
    }

    fn settle(&self, _delay: Duration) {}

    fn acquire_wakelock(&self, _tag: &str) {}

    fn release_wakelock(&self, _tag: &str) {}
}
