//! Kernel event bridge
//!
//! Watches the power-supply subsystem through a udev monitor socket on a
//! dedicated OS thread: the udev handles contain raw pointers that must not
//! cross threads, and hotplug events are rare enough that blocking I/O is
//! the simplest correct shape. Property maps are copied into owned values
//! before being handed to the async side.
//!
//! A wakelock is held for the duration of each event so the device cannot
//! suspend between the kernel report and the mode decision.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::state::PowerSupplyProps;
use crate::error::{Error, Result};
use crate::system::SystemActions;

const WAKELOCK_TAG: &str = "usbgadgetd_event";

/// Poll timeout; bounds how long shutdown detection can lag
const POLL_INTERVAL_MS: u16 = 1000;

/// Spawn the monitor thread.
///
/// Events for `sysname` are forwarded to `tx`; dropping the receiver stops
/// the thread. The thread closing `tx` on its own signals source death to
/// the observer.
pub fn spawn(
    subsystem: String,
    sysname: String,
    tx: mpsc::Sender<PowerSupplyProps>,
    system: Arc<dyn SystemActions>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("cable-monitor".to_string())
        .spawn(move || {
            if let Err(e) = run(&subsystem, &sysname, &tx, system.as_ref()) {
                error!("cable monitor stopped: {}", e);
            }
        })
}

fn listen(subsystem: &str) -> Result<udev::MonitorSocket> {
    let socket = udev::MonitorBuilder::new()?
        .match_subsystem(subsystem)?
        .listen()?;
    Ok(socket)
}

fn run(
    subsystem: &str,
    sysname: &str,
    tx: &mpsc::Sender<PowerSupplyProps>,
    system: &dyn SystemActions,
) -> Result<()> {
    let mut socket = listen(subsystem)?;
    let mut restarted = false;

    loop {
        if tx.is_closed() {
            debug!("cable monitor exiting, receiver gone");
            return Ok(());
        }

        match wait_readable(&socket) {
            Ok(false) => continue,
            Ok(true) => {
                for event in socket.iter() {
                    if !handle_event(&event, sysname, tx, system) {
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                // The source gets one restart; a second failure is fatal.
                if restarted {
                    return Err(Error::Fatal(format!(
                        "udev monitor failed after restart: {}",
                        e
                    )));
                }
                warn!("udev monitor failed ({}), restarting it", e);
                restarted = true;
                socket = listen(subsystem)?;
            }
        }
    }
}

fn wait_readable(socket: &udev::MonitorSocket) -> Result<bool> {
    // MonitorSocket only hands out a raw fd; it stays open for the
    // lifetime of `socket`, which outlives this borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

    let ready = poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS))
        .map_err(|e| Error::Io(std::io::Error::from(e)))?;
    if ready == 0 {
        return Ok(false);
    }

    let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
        return Err(Error::Fatal("udev monitor socket error".to_string()));
    }

    Ok(revents.contains(PollFlags::POLLIN))
}

/// Returns false once the receiving side is gone.
fn handle_event(
    event: &udev::Event,
    sysname: &str,
    tx: &mpsc::Sender<PowerSupplyProps>,
    system: &dyn SystemActions,
) -> bool {
    if event.event_type() != udev::EventType::Change {
        return true;
    }
    if event.sysname().to_string_lossy() != sysname {
        return true;
    }

    system.acquire_wakelock(WAKELOCK_TAG);

    let mut props = PowerSupplyProps::new();
    for entry in event.properties() {
        if let (Some(name), Some(value)) = (entry.name().to_str(), entry.value().to_str()) {
            props.insert(name, value);
        }
    }

    debug!("power supply change event for {}", sysname);
    let delivered = tx.blocking_send(props).is_ok();

    system.release_wakelock(WAKELOCK_TAG);
    delivered
}
