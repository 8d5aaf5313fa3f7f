//! Shutdown signaling
//!
//! Broadcast-based signal used to tear down the background liveness
//! monitor when the service stops.

use tokio::sync::broadcast;

/// One-way shutdown signal with any number of subscribers
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Fire the signal; subscribers observe it on their next receive
    pub fn signal(&self) {
        let _ = self.tx.send(());
    }

    /// Create a receiver for this signal
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
