//! Sync events and subscriptions
//!
//! Collaborators (UI, CLI) subscribe a callback and receive every event the
//! sync layer emits. Callbacks run on the emitting thread, outside any lock.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::models::SyncData;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The companion replica wrote new data
    CompanionChanged { data: Box<SyncData> },
    /// The companion file could not be read or parsed
    CompanionError { error: String },
    UploadCompleted { checksum: String },
    DownloadCompleted { checksum: String },
    /// Divergent snapshots that need a resolution strategy
    ConflictDetected {
        local: Box<SyncData>,
        remote: Box<SyncData>,
    },
    ConflictResolved { checksum: String },
    SyncFailed { error: String },
    /// OAuth tokens were refreshed and persisted
    TokensRefreshed,
    SettingsChanged,
    AutoSyncStarted { interval_minutes: u64 },
    AutoSyncStopped,
}

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of event callbacks. Clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<(SubscriptionId, Callback)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if the id was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn emit(&self, event: SyncEvent) {
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let id = bus.subscribe(move |event| {
            if matches!(event, SyncEvent::SettingsChanged) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.emit(SyncEvent::SettingsChanged);
        bus.emit(SyncEvent::AutoSyncStopped);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(SyncEvent::SettingsChanged);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_subscribe_without_deadlock() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        bus.emit(SyncEvent::TokensRefreshed);
        assert_eq!(bus.subscriber_count(), 2);
    }
}
