use tokio::sync::broadcast;

use crate::types::JobEvent;

/// Events buffered per subscriber before the slowest one starts lagging.
pub const JOB_EVENT_CAPACITY: usize = 256;

/// Fan-out of [`JobEvent`]s to every subscriber.
///
/// Events are published only after the state they describe is committed,
/// so a subscriber never sees a job state the store does not have.
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers received the event. Zero is fine: the
    /// job log is optional.
    pub fn publish(&self, event: JobEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(JOB_EVENT_CAPACITY)
    }
}
