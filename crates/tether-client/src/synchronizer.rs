//! Query/unsubscribe synchronization
//!
//! Between a query-and-subscribe request leaving and its reference counts
//! being recorded, the server already holds subscriptions the registry does
//! not know about. An unsubscribe computed in that window could drop a key
//! the in-flight query is about to count. Releases therefore wait for every
//! in-flight query that touches any of their `entity/view` keys.
//!
//! Queries are identified structurally: registering a definition equal to
//! one already in flight joins that entry, and completing either resolves it.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use tether_core::QueryDef;
use tokio::sync::watch;

/// Registration handle for an in-flight query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTicket {
    id: u64,
}

struct InFlight {
    id: u64,
    query: QueryDef,
    keys: BTreeSet<String>,
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct SyncState {
    in_flight: Vec<InFlight>,
    next_id: u64,
}

/// Tracks in-flight queries so releases can wait for them.
#[derive(Default)]
pub struct QuerySynchronizer {
    state: Mutex<SyncState>,
}

impl QuerySynchronizer {
    /// Create an idle synchronizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `query` as in flight.
    pub fn register_query(&self, query: &QueryDef) -> QueryTicket {
        let mut state = self.state.lock();
        if let Some(existing) = state.in_flight.iter().find(|entry| entry.query == *query) {
            return QueryTicket { id: existing.id };
        }
        state.next_id += 1;
        let id = state.next_id;
        let (done, _) = watch::channel(false);
        state.in_flight.push(InFlight {
            id,
            query: query.clone(),
            keys: query.view_keys(),
            done,
        });
        tracing::trace!(entity = %query.entity_name, ticket = id, "Query registered");
        QueryTicket { id }
    }

    /// Wait until every in-flight query sharing a view key with `query` resolves.
    pub async fn wait_for_query(&self, query: &QueryDef) {
        let keys = query.view_keys();
        let waiters: Vec<watch::Receiver<bool>> = {
            let state = self.state.lock();
            state
                .in_flight
                .iter()
                .filter(|entry| entry.keys.iter().any(|key| keys.contains(key)))
                .map(|entry| entry.done.subscribe())
                .collect()
        };
        if !waiters.is_empty() {
            tracing::debug!(
                entity = %query.entity_name,
                pending = waiters.len(),
                "Release waiting for in-flight queries"
            );
        }
        for mut waiter in waiters {
            // A closed channel means the entry was resolved and dropped.
            let _ = waiter.wait_for(|done| *done).await;
        }
    }

    /// Resolve the in-flight entry structurally equal to `query`.
    pub fn complete_query(&self, query: &QueryDef) -> bool {
        let mut state = self.state.lock();
        let Some(position) = state.in_flight.iter().position(|entry| entry.query == *query) else {
            return false;
        };
        let entry = state.in_flight.remove(position);
        entry.done.send_replace(true);
        true
    }

    /// Resolve `ticket` after its query failed or was abandoned.
    pub fn cleanup_query(&self, query: &QueryDef, ticket: QueryTicket) -> bool {
        let mut state = self.state.lock();
        let Some(position) = state.in_flight.iter().position(|entry| entry.id == ticket.id) else {
            return false;
        };
        let entry = state.in_flight.remove(position);
        entry.done.send_replace(true);
        tracing::trace!(entity = %query.entity_name, ticket = ticket.id, "Query cleaned up");
        true
    }

    /// Number of unresolved queries.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
