use tokio::sync::broadcast;

use courier_types::events::PanelEvent;

/// Fan-out of normalized panel events to connected WebSocket clients.
/// The underlying channel is owned by the device registry — every device
/// actor publishes into it — so the dispatcher is just the subscription
/// surface for connections.
#[derive(Clone)]
pub struct Dispatcher {
    tx: broadcast::Sender<PanelEvent>,
}

impl Dispatcher {
    pub fn new(tx: broadcast::Sender<PanelEvent>) -> Self {
        Self { tx }
    }

    /// Subscribe to panel events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: PanelEvent) {
        let _ = self.tx.send(event);
    }
}
