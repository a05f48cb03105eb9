//! Event recording.

use std::sync::Arc;
use std::time::Duration;

use cmap_pool::{PoolEvent, PoolEventHandler};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Pool event handler that keeps every event it sees.
///
/// Register it with [`PoolBuilder::event_handler`](cmap_pool::PoolBuilder::event_handler)
/// to capture `connectionPoolCreated` as well.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<PoolEvent>>,
    notify: Notify,
}

impl EventRecorder {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }

    /// Event type tags recorded so far, in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(PoolEvent::event_type).collect()
    }

    /// Number of events of one type.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Wait until at least `count` events of `event_type` were recorded.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for(&self, event_type: &str, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count(event_type) >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl PoolEventHandler for EventRecorder {
    fn handle(&self, event: &PoolEvent) {
        self.events.lock().push(event.clone());
        self.notify.notify_waiters();
    }
}
