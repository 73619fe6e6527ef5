//! Fire-and-forget snapshot broadcast to observers.
//!
//! Each subscriber gets its own bounded crossbeam channel. A full channel
//! drops the snapshot for that subscriber only; a disconnected one is
//! removed. Publishing never blocks the round.

use crate::core::snapshot::Snapshot;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::Arc;

/// Delivery counts for one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub delivered: usize,
    pub dropped: usize,
    pub disconnected: usize,
}

#[derive(Debug, Default)]
pub struct SnapshotBroadcaster {
    subscribers: Vec<Sender<Arc<Snapshot>>>,
    total_dropped: u64,
}

impl SnapshotBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer with a buffer of `capacity` snapshots.
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<Arc<Snapshot>> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    pub fn publish(&mut self, snapshot: Arc<Snapshot>) -> PublishStats {
        let mut stats = PublishStats::default();
        self.subscribers
            .retain(|tx| match tx.try_send(Arc::clone(&snapshot)) {
                Ok(()) => {
                    stats.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    stats.dropped += 1;
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    stats.disconnected += 1;
                    false
                }
            });
        self.total_dropped += stats.dropped as u64;
        if stats.dropped > 0 {
            log::debug!(
                "snapshot {} dropped for {} slow subscriber(s)",
                snapshot.step,
                stats.dropped
            );
        }
        stats
    }
}
