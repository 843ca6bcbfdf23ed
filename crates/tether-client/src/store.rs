//! # Message Store
//!
//! Per-view change logs plus a live fan-out to the view hosts that listen on
//! them. Every non-empty envelope that arrives from the transport is appended
//! to the log of its `(entity, id, view)` key, kept ordered by change id, and
//! then delivered to every listener of that key.
//!
//! Subscribing replays the stored envelopes newer than the requested version
//! before any live envelope can reach the listener: registration and replay
//! happen under one lock. Delivery only enqueues; the store drives each
//! listener's drain after releasing the lock, so projections never run while
//! the store is locked.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tether_core::{ChangeEnvelope, ChangeId, ViewKey};

/// How an envelope reached a listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Replayed from the stored log when the listener subscribed
    Replay(ChangeEnvelope),
    /// Arrived after the listener subscribed
    Live(ChangeEnvelope),
}

impl Delivery {
    /// Delivered envelope.
    pub fn envelope(&self) -> &ChangeEnvelope {
        match self {
            Self::Replay(envelope) | Self::Live(envelope) => envelope,
        }
    }

    /// Take the envelope.
    pub fn into_envelope(self) -> ChangeEnvelope {
        match self {
            Self::Replay(envelope) | Self::Live(envelope) => envelope,
        }
    }

    /// True for live deliveries.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }
}

/// Receiver side of a change log subscription.
pub trait ChangeSink: Send + Sync {
    /// Enqueue a delivery. Called with the store locked; must not block or
    /// call back into the store.
    fn deliver(&self, delivery: Delivery);

    /// Process everything enqueued so far.
    fn drain(self: Arc<Self>) -> BoxFuture<'static, ()>;
}

/// Handle returned by [`MessageStore::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSubscription {
    key: ViewKey,
    id: u64,
}

impl StoreSubscription {
    /// Change log this subscription listens on.
    pub fn key(&self) -> &ViewKey {
        &self.key
    }
}

struct Listener {
    id: u64,
    sink: Weak<dyn ChangeSink>,
}

#[derive(Default)]
struct StoreState {
    logs: HashMap<ViewKey, VecDeque<ChangeEnvelope>>,
    listeners: HashMap<ViewKey, Vec<Listener>>,
    next_id: u64,
}

/// In-memory change logs with live fan-out.
pub struct MessageStore {
    state: Mutex<StoreState>,
    max_history: usize,
}

impl MessageStore {
    /// Create a store keeping at most `max_history` envelopes per view.
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            max_history: max_history.max(1),
        }
    }

    /// Append an envelope to its log. Sync markers and duplicates are not stored.
    pub fn append(&self, envelope: &ChangeEnvelope) -> bool {
        let mut state = self.state.lock();
        self.append_locked(&mut state, envelope)
    }

    fn append_locked(&self, state: &mut StoreState, envelope: &ChangeEnvelope) -> bool {
        if envelope.is_sync_marker() {
            return false;
        }
        let log = state.logs.entry(envelope.view_key()).or_default();
        let position = log.partition_point(|stored| stored.change_id < envelope.change_id);
        if log
            .get(position)
            .is_some_and(|stored| stored.change_id == envelope.change_id)
        {
            return false;
        }
        log.insert(position, envelope.clone());
        while log.len() > self.max_history {
            log.pop_front();
        }
        true
    }

    /// Stored envelopes with a change id greater than `after`, oldest first.
    pub fn changes_after(&self, key: &ViewKey, after: &ChangeId) -> Vec<ChangeEnvelope> {
        let state = self.state.lock();
        state
            .logs
            .get(key)
            .map(|log| {
                log.iter()
                    .filter(|envelope| envelope.change_id > *after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Newest stored version for `key`.
    pub fn latest_change_id(&self, key: &ViewKey) -> Option<ChangeId> {
        let state = self.state.lock();
        state
            .logs
            .get(key)
            .and_then(|log| log.back())
            .map(|envelope| envelope.change_id.clone())
    }

    /// Drop stored envelopes with a change id at or below `up_to`.
    pub fn remove_changes(&self, key: &ViewKey, up_to: &ChangeId) -> usize {
        let mut state = self.state.lock();
        let Some(log) = state.logs.get_mut(key) else {
            return 0;
        };
        let before = log.len();
        log.retain(|envelope| envelope.change_id > *up_to);
        let removed = before - log.len();
        if log.is_empty() {
            state.logs.remove(key);
        }
        removed
    }

    /// Number of stored envelopes for `key`.
    pub fn history_len(&self, key: &ViewKey) -> usize {
        self.state.lock().logs.get(key).map_or(0, VecDeque::len)
    }

    /// Register `sink` on `key`, replaying stored envelopes newer than `after`.
    pub fn subscribe(
        &self,
        key: ViewKey,
        after: &ChangeId,
        sink: Weak<dyn ChangeSink>,
    ) -> StoreSubscription {
        let mut state = self.state.lock();
        if let (Some(log), Some(listener)) = (state.logs.get(&key), sink.upgrade()) {
            for envelope in log.iter().filter(|envelope| envelope.change_id > *after) {
                listener.deliver(Delivery::Replay(envelope.clone()));
            }
        }
        state.next_id += 1;
        let id = state.next_id;
        state
            .listeners
            .entry(key.clone())
            .or_default()
            .push(Listener { id, sink });
        tracing::trace!(key = %key, listener = id, "Change log subscribed");
        StoreSubscription { key, id }
    }

    /// Remove a listener.
    pub fn unsubscribe(&self, subscription: &StoreSubscription) {
        let mut state = self.state.lock();
        if let Some(listeners) = state.listeners.get_mut(&subscription.key) {
            listeners.retain(|listener| listener.id != subscription.id);
            if listeners.is_empty() {
                state.listeners.remove(&subscription.key);
            }
        }
    }

    /// Live listeners on `key`.
    pub fn listener_count(&self, key: &ViewKey) -> usize {
        let state = self.state.lock();
        state.listeners.get(key).map_or(0, |listeners| {
            listeners
                .iter()
                .filter(|listener| listener.sink.strong_count() > 0)
                .count()
        })
    }

    /// Store `envelope` and deliver it to every listener of its key.
    pub async fn publish(&self, envelope: ChangeEnvelope) {
        let key = envelope.view_key();
        let sinks: Vec<Arc<dyn ChangeSink>> = {
            let mut state = self.state.lock();
            self.append_locked(&mut state, &envelope);
            let sinks = match state.listeners.get_mut(&key) {
                Some(listeners) => {
                    listeners.retain(|listener| listener.sink.strong_count() > 0);
                    listeners
                        .iter()
                        .filter_map(|listener| listener.sink.upgrade())
                        .collect()
                }
                None => Vec::new(),
            };
            for sink in &sinks {
                sink.deliver(Delivery::Live(envelope.clone()));
            }
            sinks
        };
        tracing::trace!(
            key = %key,
            change_id = %envelope.change_id,
            listeners = sinks.len(),
            "Envelope published"
        );
        for sink in sinks {
            sink.drain().await;
        }
    }

    /// Forget every log and listener.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.logs.clear();
        state.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tether_core::{ActorId, Change};

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<Delivery>>,
        drained: Mutex<usize>,
    }

    impl ChangeSink for RecordingSink {
        fn deliver(&self, delivery: Delivery) {
            self.received.lock().push(delivery);
        }

        fn drain(self: Arc<Self>) -> BoxFuture<'static, ()> {
            async move {
                *self.drained.lock() += 1;
            }
            .boxed()
        }
    }

    fn key() -> ViewKey {
        ViewKey::new("User", ActorId::new("u1"), "name")
    }

    fn envelope(change_id: &str, value: &str) -> ChangeEnvelope {
        ChangeEnvelope::single(
            "User",
            ActorId::new("u1"),
            "name",
            change_id.parse().unwrap(),
            Change::ValueChanged {
                value: serde_json::json!(value),
            },
        )
    }

    fn cid(s: &str) -> ChangeId {
        s.parse().unwrap()
    }

    #[test]
    fn log_stays_ordered_and_rejects_duplicates() {
        let store = MessageStore::new(10);
        assert!(store.append(&envelope("3", "c")));
        assert!(store.append(&envelope("1", "a")));
        assert!(store.append(&envelope("2", "b")));
        assert!(!store.append(&envelope("2", "b")));

        let ids: Vec<String> = store
            .changes_after(&key(), &ChangeId::min())
            .iter()
            .map(|e| e.change_id.to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(store.latest_change_id(&key()), Some(cid("3")));
    }

    #[test]
    fn history_cap_evicts_oldest() {
        let store = MessageStore::new(2);
        for id in ["1", "2", "3"] {
            store.append(&envelope(id, id));
        }
        assert_eq!(store.history_len(&key()), 2);
        assert_eq!(store.changes_after(&key(), &ChangeId::min())[0].change_id, cid("2"));
    }

    #[test]
    fn remove_changes_trims_up_to_version() {
        let store = MessageStore::new(10);
        for id in ["1", "2", "3"] {
            store.append(&envelope(id, id));
        }
        assert_eq!(store.remove_changes(&key(), &cid("2")), 2);
        assert_eq!(store.history_len(&key()), 1);
        assert_eq!(store.remove_changes(&key(), &cid("9")), 1);
        assert_eq!(store.latest_change_id(&key()), None);
    }

    #[test]
    fn sync_markers_are_not_stored() {
        let store = MessageStore::new(10);
        let sub = tether_core::ActorViewSub::new("User", ActorId::new("u1"), "name");
        assert!(!store.append(&ChangeEnvelope::sync_marker(&sub, cid("4"), "local")));
        assert_eq!(store.history_len(&key()), 0);
    }

    #[test]
    fn subscribe_replays_newer_history() {
        let store = MessageStore::new(10);
        for id in ["1", "2", "3"] {
            store.append(&envelope(id, id));
        }
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn ChangeSink> = Arc::downgrade(&sink) as Weak<dyn ChangeSink>;
        store.subscribe(key(), &cid("1"), weak);

        let received = sink.received.lock();
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|d| !d.is_live()));
        assert_eq!(received[0].envelope().change_id, cid("2"));
    }

    #[tokio::test]
    async fn publish_delivers_live_and_drains() {
        let store = MessageStore::new(10);
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn ChangeSink> = Arc::downgrade(&sink) as Weak<dyn ChangeSink>;
        let subscription = store.subscribe(key(), &ChangeId::min(), weak);

        store.publish(envelope("5", "e")).await;
        assert_eq!(sink.received.lock().len(), 1);
        assert!(sink.received.lock()[0].is_live());
        assert_eq!(*sink.drained.lock(), 1);
        assert_eq!(store.history_len(&key()), 1);

        store.unsubscribe(&subscription);
        assert_eq!(store.listener_count(&key()), 0);
        store.publish(envelope("6", "f")).await;
        assert_eq!(sink.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn dropped_sinks_are_pruned() {
        let store = MessageStore::new(10);
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn ChangeSink> = Arc::downgrade(&sink) as Weak<dyn ChangeSink>;
        store.subscribe(key(), &ChangeId::min(), weak);
        drop(sink);

        assert_eq!(store.listener_count(&key()), 0);
        store.publish(envelope("1", "a")).await;
    }
}
