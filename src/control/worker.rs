//! Gadget worker thread
//!
//! Backend writes can block for hundreds of milliseconds (symlink churn,
//! UDC enable, MTP daemon startup), so they run on a dedicated thread fed
//! by a request channel. Queued requests are coalesced: whatever arrived
//! last is what the hardware ends up in, and intermediate targets are
//! never realized. A switch that has started always runs to completion.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ModeDescriptor, ModeRegistry};
use crate::error::Result;
use crate::gadget::{sysfs, GadgetBackend};
use crate::modes::{MODE_ASK, MODE_CHARGER, MODE_CHARGING_FALLBACK, MODE_UNDEFINED};

/// Completion report sent back to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSwitched {
    /// The request this report answers
    pub requested: String,
    /// The mode the hardware actually reached
    pub achieved: String,
}

/// Controller-side handle posting requests to the worker
#[derive(Clone)]
pub struct WorkerHandle {
    pub(crate) tx: mpsc::UnboundedSender<String>,
}

impl WorkerHandle {
    pub fn request_mode(&self, mode: &str) {
        if self.tx.send(mode.to_string()).is_err() {
            warn!("gadget worker is gone, dropping request for {}", mode);
        }
    }
}

/// Spawn the worker thread.
pub fn spawn(
    backend: Arc<GadgetBackend>,
    registry: Arc<ModeRegistry>,
) -> Result<(
    WorkerHandle,
    mpsc::UnboundedReceiver<ModeSwitched>,
    JoinHandle<()>,
)> {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    let worker = ModeWorker {
        backend,
        registry,
        previous: None,
    };
    let join = std::thread::Builder::new()
        .name("gadget-worker".to_string())
        .spawn(move || worker.run(req_rx, done_tx))?;

    Ok((WorkerHandle { tx: req_tx }, done_rx, join))
}

/// Collapse queued requests down to the most recent one.
fn coalesce(rx: &mut mpsc::UnboundedReceiver<String>, first: String) -> String {
    let mut request = first;
    while let Ok(newer) = rx.try_recv() {
        debug!("superseding queued request {} with {}", request, newer);
        request = newer;
    }
    request
}

struct ModeWorker {
    backend: Arc<GadgetBackend>,
    registry: Arc<ModeRegistry>,
    /// Descriptor of the mode currently on the hardware, for resets
    previous: Option<ModeDescriptor>,
}

impl ModeWorker {
    fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<String>,
        done: mpsc::UnboundedSender<ModeSwitched>,
    ) {
        while let Some(first) = rx.blocking_recv() {
            let requested = coalesce(&mut rx, first);
            info!("switching hardware to {}", requested);
            let achieved = self.apply(&requested);
            info!("hardware reached {}", achieved);
            if done.send(ModeSwitched { requested, achieved }).is_err() {
                break;
            }
        }
        debug!("gadget worker exiting");
    }

    fn apply(&mut self, mode: &str) -> String {
        match mode {
            // No cable: charging-only configuration, detached from the bus
            MODE_UNDEFINED => {
                self.previous = None;
                if let Err(e) = self.backend.set_function("mass_storage") {
                    warn!("charging configuration failed: {}", e);
                }
                if let Err(e) = self.backend.set_udc(false) {
                    warn!("disabling UDC failed: {}", e);
                }
                MODE_UNDEFINED.to_string()
            }
            MODE_CHARGER | MODE_CHARGING_FALLBACK => self.enter_charging(mode),
            // Charge while the dialog service asks the user
            MODE_ASK => {
                self.previous = None;
                match self.backend.set_charging_mode() {
                    Ok(()) => MODE_ASK.to_string(),
                    Err(e) => {
                        warn!("charging configuration for ask failed: {}", e);
                        let _ = self.backend.set_udc(false);
                        MODE_UNDEFINED.to_string()
                    }
                }
            }
            name => self.enter_dynamic(name),
        }
    }

    fn enter_charging(&mut self, mode: &str) -> String {
        self.previous = None;
        match self.backend.set_charging_mode() {
            Ok(()) => mode.to_string(),
            Err(e) => {
                warn!("charging configuration failed: {}", e);
                let _ = self.backend.set_udc(false);
                MODE_UNDEFINED.to_string()
            }
        }
    }

    fn enter_dynamic(&mut self, name: &str) -> String {
        let Some(descriptor) = self.registry.get(name).cloned() else {
            warn!("no descriptor for mode {}, using charging fallback", name);
            return self.enter_charging(MODE_CHARGING_FALLBACK);
        };

        match self.apply_descriptor(&descriptor) {
            Ok(()) => {
                self.previous = Some(descriptor);
                name.to_string()
            }
            Err(e) => {
                warn!("switching to {} failed: {}", name, e);
                self.enter_charging(MODE_CHARGING_FALLBACK)
            }
        }
    }

    fn apply_descriptor(&mut self, descriptor: &ModeDescriptor) -> Result<()> {
        self.backend.set_udc(false)?;

        if let Some(previous) = self.previous.take() {
            for (path, value) in previous.reset_writes() {
                sysfs::write_attr(path, value)?;
            }
        }

        for (path, value) in descriptor.extra_writes() {
            sysfs::write_attr(path, value)?;
        }

        if let Some(id) = &descriptor.id_product {
            self.backend.set_product_id(id)?;
        }
        if let Some(id) = &descriptor.id_vendor_override {
            self.backend.set_vendor_id(id)?;
        }

        self.backend.set_function(descriptor.function())?;

        if let Some((path, value)) = descriptor.softconnect_write() {
            sysfs::write_attr(path, value)?;
        }

        self.backend.set_udc(true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GadgetIdentity;
    use crate::gadget::ConfigFsGadget;
    use crate::system::NoopSystem;
    use tempfile::TempDir;

    fn fake_backend(tmp: &TempDir) -> Arc<GadgetBackend> {
        let root = tmp.path().join("usb_gadget/g1");
        let udc_class = tmp.path().join("udc");
        std::fs::create_dir_all(root.join("configs/b.1")).unwrap();
        std::fs::create_dir_all(root.join("functions")).unwrap();
        std::fs::create_dir_all(&udc_class).unwrap();
        std::fs::write(root.join("UDC"), "").unwrap();
        std::fs::write(root.join("idVendor"), "").unwrap();
        std::fs::write(root.join("idProduct"), "").unwrap();
        std::os::unix::fs::symlink("hw", udc_class.join("dummy_udc")).unwrap();

        Arc::new(GadgetBackend::ConfigFs(ConfigFsGadget::with_roots(
            root,
            udc_class,
            GadgetIdentity::default(),
            Arc::new(NoopSystem),
        )))
    }

    fn udc_value(tmp: &TempDir) -> String {
        std::fs::read_to_string(tmp.path().join("usb_gadget/g1/UDC"))
            .unwrap()
            .trim()
            .to_string()
    }

    fn mtp_descriptor() -> ModeDescriptor {
        ModeDescriptor {
            name: "mtp_mode".to_string(),
            sysfs_value: Some("mtp".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_requests_coalesce_to_latest() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send("m2".to_string()).unwrap();
        tx.send("m3".to_string()).unwrap();

        let request = coalesce(&mut rx, "m1".to_string());
        assert_eq!(request, "m3");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_queued_requests_produce_one_completion() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(ModeRegistry::new(vec![mtp_descriptor()]));
        let worker = ModeWorker {
            backend: fake_backend(&tmp),
            registry,
            previous: None,
        };

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        req_tx.send(MODE_CHARGER.to_string()).unwrap();
        req_tx.send(MODE_CHARGING_FALLBACK.to_string()).unwrap();
        req_tx.send("mtp_mode".to_string()).unwrap();
        drop(req_tx);

        worker.run(req_rx, done_tx);

        let event = done_rx.try_recv().unwrap();
        assert_eq!(event.requested, "mtp_mode");
        assert_eq!(event.achieved, "mtp_mode");
        assert!(done_rx.try_recv().is_err());
        assert_eq!(udc_value(&tmp), "dummy_udc");
    }

    #[test]
    fn test_charging_modes_enable_udc() {
        let tmp = TempDir::new().unwrap();
        let mut worker = ModeWorker {
            backend: fake_backend(&tmp),
            registry: Arc::new(ModeRegistry::default()),
            previous: None,
        };

        assert_eq!(worker.apply(MODE_CHARGER), MODE_CHARGER);
        assert_eq!(udc_value(&tmp), "dummy_udc");
    }

    #[test]
    fn test_undefined_detaches_gadget() {
        let tmp = TempDir::new().unwrap();
        let mut worker = ModeWorker {
            backend: fake_backend(&tmp),
            registry: Arc::new(ModeRegistry::default()),
            previous: None,
        };

        assert_eq!(worker.apply(MODE_CHARGER), MODE_CHARGER);
        assert_eq!(worker.apply(MODE_UNDEFINED), MODE_UNDEFINED);
        assert_eq!(udc_value(&tmp), "");
    }

    #[test]
    fn test_unknown_mode_falls_back_to_charging() {
        let tmp = TempDir::new().unwrap();
        let mut worker = ModeWorker {
            backend: fake_backend(&tmp),
            registry: Arc::new(ModeRegistry::default()),
            previous: None,
        };

        assert_eq!(worker.apply("no_such_mode"), MODE_CHARGING_FALLBACK);
        assert_eq!(udc_value(&tmp), "dummy_udc");
    }

    #[test]
    fn test_failed_switch_falls_back_to_charging() {
        let tmp = TempDir::new().unwrap();
        let backend = fake_backend(&tmp);
        // A regular file where the mtp enable symlink belongs makes
        // set_function("mtp") fail
        std::fs::write(
            tmp.path().join("usb_gadget/g1/configs/b.1/ffs.mtp"),
            "blocked",
        )
        .unwrap();

        let mut worker = ModeWorker {
            backend,
            registry: Arc::new(ModeRegistry::new(vec![mtp_descriptor()])),
            previous: None,
        };

        assert_eq!(worker.apply("mtp_mode"), MODE_CHARGING_FALLBACK);
        // Fallback re-attached the gadget in the charging configuration
        assert_eq!(udc_value(&tmp), "dummy_udc");
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("usb_gadget/g1/idProduct"))
                .unwrap()
                .trim(),
            "0x0afe"
        );
    }

    #[test]
    fn test_descriptor_id_override_applied() {
        let tmp = TempDir::new().unwrap();
        let mut descriptor = mtp_descriptor();
        descriptor.id_product = Some("0A02".to_string());

        let mut worker = ModeWorker {
            backend: fake_backend(&tmp),
            registry: Arc::new(ModeRegistry::new(vec![descriptor])),
            previous: None,
        };

        assert_eq!(worker.apply("mtp_mode"), "mtp_mode");
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("usb_gadget/g1/idProduct"))
                .unwrap()
                .trim(),
            "0x0a02"
        );
    }

    #[test]
    fn test_previous_mode_reset_applied() {
        let tmp = TempDir::new().unwrap();
        let reset_attr = tmp.path().join("extra_attr");
        std::fs::write(&reset_attr, "").unwrap();

        let mut first = mtp_descriptor();
        first.sysfs_path = Some(reset_attr.clone());
        first.sysfs_reset_value = Some("off".to_string());
        let second = ModeDescriptor {
            name: "mass_storage".to_string(),
            mass_storage: true,
            ..Default::default()
        };

        let mut worker = ModeWorker {
            backend: fake_backend(&tmp),
            registry: Arc::new(ModeRegistry::new(vec![first, second])),
            previous: None,
        };

        assert_eq!(worker.apply("mtp_mode"), "mtp_mode");
        assert_eq!(worker.apply("mass_storage"), "mass_storage");
        assert_eq!(
            std::fs::read_to_string(&reset_attr).unwrap().trim(),
            "off"
        );
    }
}
