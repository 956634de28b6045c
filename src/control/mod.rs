//! Mode control
//!
//! The control loop is the single place where controller state mutates.
//! It multiplexes the debounced cable stream, inbound bridge requests and
//! worker completions; completions are drained first so a finished switch
//! is always accounted for before the next decision is made.

pub mod controller;
pub mod worker;

pub use controller::{ControllerState, ModeController};
pub use worker::{ModeSwitched, WorkerHandle};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::cable::CableState;
use crate::error::{Error, Result};
use crate::policy::UserId;

/// Inbound requests from the bus bridge and the session tracker
pub enum ControlRequest {
    /// `request_mode(name, uid)`; the reply carries a policy rejection back
    /// to the bridge
    RequestMode {
        mode: String,
        uid: u32,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// The seat user changed
    UserChanged(UserId),
    /// Device lock or acting-dead state changed
    LockState { unlocked: bool, acting_dead: bool },
}

/// Run the control loop until shutdown.
///
/// Returns `Ok(())` when the request channel closes (orderly shutdown) and
/// an error when an event source dies or a fatal condition is hit.
pub async fn run_control_loop(
    mut controller: ModeController,
    mut cable_rx: mpsc::Receiver<CableState>,
    mut requests: mpsc::Receiver<ControlRequest>,
    mut completions: mpsc::UnboundedReceiver<ModeSwitched>,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            completion = completions.recv() => {
                match completion {
                    Some(event) => controller.mode_switched(&event.requested, &event.achieved),
                    None => return Err(Error::Fatal("gadget worker stopped".to_string())),
                }
            }

            state = cable_rx.recv() => {
                match state {
                    Some(state) => controller.set_cable_state(state)?,
                    None => return Err(Error::Fatal("cable observer stopped".to_string())),
                }
            }

            request = requests.recv() => {
                match request {
                    Some(request) => handle_request(&mut controller, request)?,
                    None => {
                        info!("control request channel closed, shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn handle_request(controller: &mut ModeController, request: ControlRequest) -> Result<()> {
    match request {
        ControlRequest::RequestMode { mode, uid, reply } => {
            let result = controller.request_mode(&mode, uid);
            if let Err(e) = &result {
                warn!("mode request for {} rejected: {}", mode, e);
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
            Ok(())
        }
        ControlRequest::UserChanged(user) => controller.user_changed(user),
        ControlRequest::LockState {
            unlocked,
            acting_dead,
        } => controller.set_lock_state(unlocked, acting_dead),
    }
}
