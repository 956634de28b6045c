//! Signal bus towards the IPC bridge
//!
//! The controller publishes state-change signals here; the bus bridge (an
//! external collaborator) subscribes and puts them on the wire. Signals are
//! fire-and-forget notifications; with no subscriber they are dropped.

pub mod types;

pub use types::{UsbSignal, EVENT_CONNECTED_DIALOG_SHOW};

use tokio::sync::broadcast;

const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// Broadcast bus carrying [`UsbSignal`] values to any number of subscribers
pub struct SignalBus {
    tx: broadcast::Sender<UsbSignal>,
}

impl SignalBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish a signal to all subscribers.
    pub fn publish(&self, signal: UsbSignal) {
        // send only fails with no subscribers, which is fine
        let _ = self.tx.send(signal);
    }

    /// Subscribe to all future signals. Slow subscribers receive a `Lagged`
    /// error and miss signals rather than blocking the controller.
    pub fn subscribe(&self) -> broadcast::Receiver<UsbSignal> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();

        bus.publish(UsbSignal::CurrentState {
            mode: "charger".to_string(),
        });

        let signal = rx.recv().await.unwrap();
        assert_eq!(
            signal,
            UsbSignal::CurrentState {
                mode: "charger".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = SignalBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(UsbSignal::SupportedModes {
            modes: vec!["mtp_mode".to_string()],
        });

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = SignalBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(UsbSignal::TargetState {
            mode: "undefined".to_string(),
        });
    }
}
