use crate::watcher::BlockEvent;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// Single-slot hand-off between the watcher and the sync worker.
///
/// Holds at most one pending [`BlockEvent`]. Offering a new event while one
/// is pending replaces it, so the worker always applies the newest head.
#[derive(Debug, Default)]
pub struct RestartSlot {
    pending: Mutex<Option<BlockEvent>>,
    notify: Notify,
}

impl RestartSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `event`, returning the pending event it superseded.
    pub fn offer(&self, event: BlockEvent) -> Option<BlockEvent> {
        let superseded = self.lock().replace(event);
        self.notify.notify_one();
        superseded
    }

    /// Takes the pending event without waiting.
    pub fn take(&self) -> Option<BlockEvent> {
        self.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    /// Waits for and takes the pending event.
    pub async fn next(&self) -> BlockEvent {
        loop {
            if let Some(event) = self.take() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<BlockEvent>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
