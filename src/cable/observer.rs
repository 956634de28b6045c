//! Debounced cable-state observer
//!
//! Raw per-event classifications become the active cable state immediately,
//! with one exception: a transition into `PcConnected` from a known prior
//! state is held back for [`CABLE_DEBOUNCE`]. Some dedicated chargers
//! briefly present themselves as a PC on first contact; the delay swallows
//! the misdetection before anything downstream reacts to it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::state::{CableState, PowerSupplyProps};
use crate::error::{Error, Result};

/// Delay before a reported PC connection becomes active
pub const CABLE_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Folds classified power-supply events into a debounced cable state
pub struct CableObserver {
    /// Latest state derived from events
    reported: CableState,
    /// State considered active downstream
    active: CableState,
    /// Pending promotion of `reported` to `active`
    deadline: Option<Instant>,
    out: mpsc::Sender<CableState>,
}

impl CableObserver {
    pub fn new(out: mpsc::Sender<CableState>) -> Self {
        Self {
            reported: CableState::Unknown,
            active: CableState::Unknown,
            deadline: None,
            out,
        }
    }

    /// Consume events until the source ends. Returns an error when the
    /// event source dies while the controller still listens.
    pub async fn run(mut self, mut events: mpsc::Receiver<PowerSupplyProps>) -> Result<()> {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(props) => {
                            if !self.handle_event(props).await {
                                return Ok(());
                            }
                        }
                        None => {
                            return Err(Error::Fatal(
                                "power supply event source stopped".to_string(),
                            ));
                        }
                    }
                }
                // unwrap is guarded by the branch condition
                _ = async move {
                    tokio::time::sleep_until(deadline.unwrap()).await
                }, if deadline.is_some() => {
                    debug!("trigger delayed transfer to: {}", self.reported);
                    self.deadline = None;
                    if !self.apply(self.reported).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns false once the receiving side is gone.
    async fn handle_event(&mut self, props: PowerSupplyProps) -> bool {
        let state = props.classify(self.active.is_connected());
        self.note_reported(state).await
    }

    async fn note_reported(&mut self, curr: CableState) -> bool {
        let prev = self.reported;
        if prev == curr {
            return true;
        }
        self.reported = curr;
        debug!("reported cable state: {} -> {}", prev, curr);

        if curr == CableState::PcConnected && prev != CableState::Unknown {
            if self.deadline.is_none() {
                debug!("schedule delayed transfer to: {}", curr);
                self.deadline = Some(Instant::now() + CABLE_DEBOUNCE);
            }
            true
        } else {
            self.apply(curr).await
        }
    }

    async fn apply(&mut self, state: CableState) -> bool {
        if self.deadline.take().is_some() {
            debug!("cancel delayed transfer to: {}", self.reported);
        }

        if self.active == state {
            return true;
        }

        info!("cable_state: {} -> {}", self.active, state);
        self.active = state;
        self.out.send(state).await.is_ok()
    }
}
