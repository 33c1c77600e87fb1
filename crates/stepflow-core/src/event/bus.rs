//! Broadcast bus carrying [`FlowEvent`]s from the engine to any number of
//! observers. Publishing with nobody listening is a no-op.

use stepflow_types::event::FlowEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for run and step lifecycle events.
///
/// Cloning the bus clones the sender, so the interpreter can hand copies to
/// spawned branches.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: FlowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
