use std::time::Instant;

/// A new head observed on the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    pub height: u64,
    /// Present for `newHeads` notifications; polling only learns the height.
    pub hash: Option<String>,
    pub observed_at: Instant,
    /// The head read when the watcher attached rather than a newly produced
    /// block.
    pub baseline: bool,
}

impl BlockEvent {
    pub fn new(height: u64, hash: Option<String>) -> Self {
        Self {
            height,
            hash,
            observed_at: Instant::now(),
            baseline: false,
        }
    }

    /// Event for the head read at subscribe time.
    pub fn baseline(height: u64) -> Self {
        Self {
            baseline: true,
            ..Self::new(height, None)
        }
    }
}

/// Why a watcher stream finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherExit {
    /// Stopped through [`crate::watcher::WatcherHandle::stop`] or the shutdown token.
    Stopped,
    /// The remote closed the stream or the watcher task died.
    Disconnected { reason: String },
}
