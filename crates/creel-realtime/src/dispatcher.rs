use tokio::sync::broadcast;

use creel_types::events::RealtimeEvent;

/// Fan-out hub for realtime events. Every open session and WebSocket
/// connection subscribes; delivery is best-effort and at-least-once
/// tolerant (consumers dedup by message id), so a lagging receiver only
/// loses events for itself.
#[derive(Clone)]
pub struct Dispatcher {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// The raw sender, handed to the engine so appends publish directly.
    pub fn sender(&self) -> broadcast::Sender<RealtimeEvent> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RealtimeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
