//! Subscription reference counting
//!
//! Many hosts can need the same `(entity, id, view)` at once. The transport is
//! asked to subscribe a key only when its count leaves zero and to
//! unsubscribe only when it returns there.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tether_core::{ActorViewSub, ViewKey};

/// Outcome of [`SubscriptionRegistry::acquire`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Acquired {
    /// Keys that went from zero to one; the transport must subscribe them
    pub first: Vec<ActorViewSub>,
    /// Keys that were already live before this batch
    pub shared: Vec<ActorViewSub>,
}

/// Outcome of [`SubscriptionRegistry::release`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Released {
    /// Keys that reached zero; the transport must unsubscribe them
    pub dropped: Vec<ActorViewSub>,
    /// Every entry that was actually decremented
    pub decremented: Vec<ActorViewSub>,
}

/// Live subscription counts keyed by view.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    counts: Mutex<HashMap<ViewKey, usize>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more holder for every entry of `subs`.
    ///
    /// A key listed several times in one batch counts once per entry but is
    /// reported in `first` or `shared` at most once.
    pub fn acquire(&self, subs: &[ActorViewSub]) -> Acquired {
        let mut counts = self.counts.lock();
        let mut acquired = Acquired::default();
        let mut seen = BTreeSet::new();
        for sub in subs {
            let key = sub.view_key();
            let count = counts.entry(key.clone()).or_insert(0);
            *count += 1;
            if !seen.insert(key) {
                continue;
            }
            if *count == 1 {
                acquired.first.push(sub.clone());
            } else {
                acquired.shared.push(sub.clone());
            }
        }
        acquired
    }

    /// Drop one holder for every entry of `subs`.
    pub fn release(&self, subs: &[ActorViewSub]) -> Released {
        let mut counts = self.counts.lock();
        let mut released = Released::default();
        let mut dropped = BTreeSet::new();
        for sub in subs {
            let key = sub.view_key();
            let Some(count) = counts.get_mut(&key) else {
                tracing::warn!(key = %key, "Unsubscribe for untracked view ignored");
                continue;
            };
            *count -= 1;
            released.decremented.push(sub.clone());
            if *count == 0 {
                counts.remove(&key);
                if dropped.insert(key) {
                    released.dropped.push(sub.clone());
                }
            }
        }
        released
    }

    /// Undo a [`release`](Self::release) whose transport call failed.
    pub fn restore(&self, released: &Released) {
        let mut counts = self.counts.lock();
        for sub in &released.decremented {
            *counts.entry(sub.view_key()).or_insert(0) += 1;
        }
    }

    /// Undo an [`acquire`](Self::acquire) whose transport call failed.
    pub fn rollback(&self, subs: &[ActorViewSub]) {
        let mut counts = self.counts.lock();
        for sub in subs {
            let key = sub.view_key();
            if let Some(count) = counts.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(&key);
                }
            }
        }
    }

    /// Current holders of `sub`'s view.
    pub fn count(&self, sub: &ActorViewSub) -> usize {
        self.counts.lock().get(&sub.view_key()).copied().unwrap_or(0)
    }

    /// Number of views with at least one holder.
    pub fn tracked(&self) -> usize {
        self.counts.lock().len()
    }

    /// Forget every count.
    pub fn clear(&self) {
        self.counts.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ActorId;

    fn sub(id: &str, view: &str) -> ActorViewSub {
        ActorViewSub::new("User", ActorId::new(id), view)
    }

    #[test]
    fn only_first_holder_reaches_transport() {
        let registry = SubscriptionRegistry::new();
        let first = registry.acquire(&[sub("u1", "name")]);
        assert_eq!(first.first, vec![sub("u1", "name")]);

        let second = registry.acquire(&[sub("u1", "name"), sub("u2", "name")]);
        assert_eq!(second.first, vec![sub("u2", "name")]);
        assert_eq!(second.shared, vec![sub("u1", "name")]);
        assert_eq!(registry.count(&sub("u1", "name")), 2);
    }

    #[test]
    fn duplicate_keys_in_one_batch_are_reported_once() {
        let registry = SubscriptionRegistry::new();
        let acquired = registry.acquire(&[sub("u1", "name"), sub("u1", "name")]);
        assert_eq!(acquired.first.len(), 1);
        assert!(acquired.shared.is_empty());
        assert_eq!(registry.count(&sub("u1", "name")), 2);
    }

    #[test]
    fn only_last_holder_drops_subscription() {
        let registry = SubscriptionRegistry::new();
        registry.acquire(&[sub("u1", "name")]);
        registry.acquire(&[sub("u1", "name")]);

        assert!(registry.release(&[sub("u1", "name")]).dropped.is_empty());
        let released = registry.release(&[sub("u1", "name")]);
        assert_eq!(released.dropped, vec![sub("u1", "name")]);
        assert_eq!(registry.tracked(), 0);
    }

    #[test]
    fn untracked_release_is_ignored() {
        let registry = SubscriptionRegistry::new();
        let released = registry.release(&[sub("u1", "name")]);
        assert!(released.dropped.is_empty());
        assert!(released.decremented.is_empty());
        assert_eq!(registry.count(&sub("u1", "name")), 0);
    }

    #[test]
    fn restore_and_rollback_undo_counts() {
        let registry = SubscriptionRegistry::new();
        registry.acquire(&[sub("u1", "name")]);
        let released = registry.release(&[sub("u1", "name")]);
        registry.restore(&released);
        assert_eq!(registry.count(&sub("u1", "name")), 1);

        registry.acquire(&[sub("u2", "name")]);
        registry.rollback(&[sub("u2", "name")]);
        assert_eq!(registry.count(&sub("u2", "name")), 0);
        assert_eq!(registry.tracked(), 1);
    }
}
