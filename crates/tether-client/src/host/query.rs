//! Query hosts

use super::view::{ViewHost, ViewHostInner};
use super::watch::{WatchCallback, WatchId, WatchPath, Watchers};
use super::QueryState;
use crate::system::SystemCore;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tether_core::{
    ActorId, ActorViewSub, QueryDef, QueryResult, Result, TetherError, ViewQueryKind,
    ViewQueryResult,
};
use tokio::sync::watch;

/// Who a query host reports readiness and changes to.
pub(crate) enum HostParent {
    /// Root and edge-attribute hosts report to nobody
    None,
    /// Child of a reference or list view
    View(Weak<ViewHostInner>),
}

#[derive(Default)]
struct QueryStatus {
    actor_id: Option<ActorId>,
    pending_views: BTreeSet<String>,
    stopped: bool,
}

pub(crate) struct QueryHostInner {
    query: Arc<QueryDef>,
    query_key: String,
    system: Arc<SystemCore>,
    parent: HostParent,
    children: Mutex<BTreeMap<String, ViewHost>>,
    status: Mutex<QueryStatus>,
    state: watch::Sender<QueryState>,
    watchers: Watchers,
}

/// Binds a [`QueryDef`] to one entity and hosts its views.
#[derive(Clone)]
pub struct QueryHost {
    inner: Arc<QueryHostInner>,
}

impl fmt::Debug for QueryHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHost")
            .field("entity", &self.inner.query.entity_name)
            .field("actor_id", &self.actor_id())
            .field("state", &self.state())
            .finish()
    }
}

impl QueryHost {
    pub(crate) fn new(system: Arc<SystemCore>, query: Arc<QueryDef>, parent: HostParent) -> Self {
        let inner = Arc::new_cyclic(|me: &Weak<QueryHostInner>| {
            let children = query
                .views
                .iter()
                .map(|(name, def)| {
                    let view = ViewHost::new(&system, &query.entity_name, name, def, me.clone());
                    (name.clone(), view)
                })
                .collect();
            let (state, _) = watch::channel(QueryState::Created);
            QueryHostInner {
                query_key: uuid::Uuid::new_v4().to_string(),
                query,
                system,
                parent,
                children: Mutex::new(children),
                status: Mutex::new(QueryStatus::default()),
                state,
                watchers: Watchers::default(),
            }
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<QueryHostInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<QueryHostInner> {
        Arc::downgrade(&self.inner)
    }

    /// Query this host runs.
    pub fn query(&self) -> &QueryDef {
        &self.inner.query
    }

    /// Key identifying this host's subscriptions to the transport.
    pub fn query_key(&self) -> &str {
        &self.inner.query_key
    }

    /// Entity the host is bound to.
    pub fn actor_id(&self) -> Option<ActorId> {
        self.inner.status.lock().actor_id.clone()
    }

    /// Current load state.
    pub fn state(&self) -> QueryState {
        self.inner.state.borrow().clone()
    }

    /// Receiver observing load state transitions.
    pub fn state_changes(&self) -> watch::Receiver<QueryState> {
        self.inner.state.subscribe()
    }

    /// Wait until the host leaves `Created`.
    pub async fn wait_until_settled(&self) -> QueryState {
        let mut changes = self.state_changes();
        let settled = changes
            .wait_for(QueryState::is_settled)
            .await
            .map(|state| state.clone());
        settled.unwrap_or(QueryState::Stopped)
    }

    /// View host for `name`.
    pub fn view(&self, name: &str) -> Result<ViewHost> {
        self.inner.children.lock().get(name).cloned().ok_or_else(|| {
            TetherError::protocol_mismatch(format!(
                "query on {} has no view '{name}'",
                self.inner.query.entity_name
            ))
        })
    }

    /// Every view host, ordered by name.
    pub fn views(&self) -> Vec<ViewHost> {
        self.inner.children.lock().values().cloned().collect()
    }

    /// True after [`stop`](Self::stop).
    pub fn is_stopped(&self) -> bool {
        self.inner.status.lock().stopped
    }

    /// Fetch, subscribe and bind to `actor_id`.
    ///
    /// Fetch failures move the host to [`QueryState::Error`] and still return
    /// `Ok`; a result that does not match the query returns the mismatch.
    pub fn run(&self, actor_id: impl Into<ActorId>) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let actor_id = actor_id.into();
        async move { this.run_bound(actor_id).await }.boxed()
    }

    async fn run_bound(&self, actor_id: ActorId) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let query = self.inner.query.clone();
        if query.is_empty() {
            return self.attach(&actor_id, &QueryResult::empty());
        }

        let system = self.inner.system.clone();
        let previous = self.subscriptions();
        let ticket = system.synchronizer.register_query(&query);
        tracing::debug!(entity = %query.entity_name, actor = %actor_id, "Running query");
        let fetched = system
            .connection
            .query_and_subscribe(&self.inner.query_key, &actor_id, &query)
            .await;
        let result = match fetched {
            Ok(result) => result,
            Err(err) => {
                system.synchronizer.cleanup_query(&query, ticket);
                tracing::error!(
                    entity = %query.entity_name,
                    actor = %actor_id,
                    error = %err,
                    "Query failed"
                );
                self.set_state(QueryState::Error(err));
                return Ok(());
            }
        };

        if self.is_stopped() {
            tracing::debug!(entity = %query.entity_name, actor = %actor_id, "Host stopped mid-query");
            let opened = implied_subscriptions(&query, &actor_id, &result);
            system
                .abandon_query(&self.inner.query_key, &query, &opened, &[])
                .await;
            return Ok(());
        }
        if let Err(err) = self.attach(&actor_id, &result) {
            tracing::error!(
                entity = %query.entity_name,
                actor = %actor_id,
                error = %err,
                "Query result does not match its definition"
            );
            self.detach();
            let opened = implied_subscriptions(&query, &actor_id, &result);
            system
                .abandon_query(&self.inner.query_key, &query, &opened, &previous)
                .await;
            self.set_state(QueryState::Error(err.clone()));
            return Err(err);
        }

        let subs = self.subscriptions();
        system.finalize_query_subscriptions(&query, &subs).await;
        if !previous.is_empty() {
            // The new binding holds its counts before the old one lets go.
            system
                .release_query(&self.inner.query_key, &query, &previous)
                .await;
        }
        self.drain_tree().await;
        Ok(())
    }

    /// Bind to `actor_id` using a pre-fetched result.
    pub fn attach(&self, actor_id: &ActorId, result: &QueryResult) -> Result<()> {
        if self.is_stopped() {
            return Err(TetherError::Stopped);
        }
        let children: Vec<ViewHost> = self.views();
        let mut bound = Vec::with_capacity(result.views.len());
        for (name, view_result) in &result.views {
            let view = children
                .iter()
                .find(|view| view.name() == name)
                .cloned()
                .ok_or_else(|| {
                    TetherError::protocol_mismatch(format!(
                        "result for {} carries unrequested view '{name}'",
                        self.inner.query.entity_name
                    ))
                })?;
            bound.push((view, view_result));
        }

        for view in &children {
            if view.actor_id().is_some_and(|current| current != *actor_id) {
                view.detach();
            }
        }
        {
            let mut status = self.inner.status.lock();
            status.actor_id = Some(actor_id.clone());
            status.pending_views = bound.iter().map(|(view, _)| view.name().to_string()).collect();
        }
        self.set_state(QueryState::Created);

        for (view, view_result) in bound {
            if let Err(err) = view.attach(actor_id, view_result) {
                self.detach();
                return Err(err);
            }
        }

        let ready = self.inner.status.lock().pending_views.is_empty();
        if ready {
            self.mark_loaded();
        }
        Ok(())
    }

    /// Unbind from the current entity. The host can be run or attached again.
    pub fn detach(&self) {
        for view in self.views() {
            view.detach();
        }
        let stopped = {
            let mut status = self.inner.status.lock();
            status.actor_id = None;
            status.pending_views.clear();
            status.stopped
        };
        if !stopped {
            self.set_state(QueryState::Created);
        }
    }

    /// Tear the host down for good.
    pub fn stop(&self) {
        {
            let mut status = self.inner.status.lock();
            if status.stopped {
                return;
            }
            status.stopped = true;
            status.actor_id = None;
            status.pending_views.clear();
        }
        let children = std::mem::take(&mut *self.inner.children.lock());
        for view in children.values() {
            view.stop();
        }
        self.inner.watchers.clear();
        self.set_state(QueryState::Stopped);
        tracing::debug!(entity = %self.inner.query.entity_name, "Query host stopped");
    }

    /// Stop this host and drop the subscriptions it held.
    ///
    /// A query still in flight for this host sees the stop when it returns
    /// and releases what the server subscribed for it.
    pub fn release(&self) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            let subs = this.subscriptions();
            this.stop();
            if subs.is_empty() {
                return;
            }
            let inner = &this.inner;
            inner
                .system
                .release_query(&inner.query_key, &inner.query, &subs)
                .await;
        }
        .boxed()
    }

    pub(crate) async fn release_subscriptions(&self) {
        let subs = self.subscriptions();
        if subs.is_empty() {
            return;
        }
        self.inner
            .system
            .release_query(&self.inner.query_key, &self.inner.query, &subs)
            .await;
    }

    /// Subscriptions held by this host and its descendants, one entry per
    /// subscribed view host.
    pub fn subscriptions(&self) -> Vec<ActorViewSub> {
        self.views()
            .iter()
            .flat_map(ViewHost::subscriptions)
            .collect()
    }

    /// Run `callback` whenever a change lands on or below `path`.
    pub fn watch<F>(&self, path: impl Into<WatchPath>, callback: F) -> WatchId
    where
        F: Fn(&WatchPath) + Send + Sync + 'static,
    {
        let callback: WatchCallback = Arc::new(callback);
        self.inner.watchers.add(path.into(), callback)
    }

    /// Remove a watcher.
    pub fn unwatch(&self, id: WatchId) -> bool {
        self.inner.watchers.remove(id)
    }

    pub(crate) fn report_view(&self, name: &str) {
        let ready = {
            let mut status = self.inner.status.lock();
            if status.stopped || status.actor_id.is_none() {
                return;
            }
            status.pending_views.remove(name) && status.pending_views.is_empty()
        };
        if ready {
            self.mark_loaded();
        }
    }

    fn mark_loaded(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if matches!(state, QueryState::Created) {
                *state = QueryState::Loaded;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }
        let actor_id = self.actor_id();
        tracing::debug!(
            entity = %self.inner.query.entity_name,
            actor = ?actor_id,
            "Query loaded"
        );
        if let (HostParent::View(parent), Some(actor_id)) = (&self.inner.parent, actor_id) {
            if let Some(parent) = parent.upgrade() {
                ViewHost::from_inner(parent).child_loaded(&actor_id);
            }
        }
    }

    fn set_state(&self, next: QueryState) {
        self.inner.state.send_if_modified(|state| {
            if *state == next || matches!(state, QueryState::Stopped) {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    pub(crate) fn drain_tree(&self) -> BoxFuture<'static, ()> {
        let views = self.views();
        async move {
            for view in views {
                view.drain_tree().await;
            }
        }
        .boxed()
    }

    pub(crate) fn notify_changed(&self, path: WatchPath) {
        self.inner.watchers.notify(&path);
        let HostParent::View(parent) = &self.inner.parent else {
            return;
        };
        if let (Some(parent), Some(actor_id)) = (parent.upgrade(), self.actor_id()) {
            ViewHost::from_inner(parent).child_changed(&actor_id, path);
        }
    }
}

/// Subscriptions the server opened for `result`, derived from the query
/// alone. Used when no host tree exists to collect them from.
fn implied_subscriptions(
    query: &QueryDef,
    actor_id: &ActorId,
    result: &QueryResult,
) -> Vec<ActorViewSub> {
    let mut subs = Vec::new();
    for (name, view_result) in &result.views {
        let Some(def) = query.view(name) else {
            continue;
        };
        if def.subscribe {
            let sub = ActorViewSub::new(query.entity_name.as_str(), actor_id.clone(), name.as_str());
            subs.push(match view_result {
                ViewQueryResult::List(list) => sub.with_page(list.page_id.as_str()),
                _ => sub,
            });
        }
        let attrs_query = def.attrs_query(&query.entity_name, name);
        match (&def.kind, view_result) {
            (ViewQueryKind::Ref { query: target_query, .. }, ViewQueryResult::Ref(reference)) => {
                let Some(target) = &reference.value else {
                    continue;
                };
                if let Some(target_result) = &reference.query {
                    subs.extend(implied_subscriptions(target_query, target, target_result));
                }
                if let (Some(attrs_query), Some(attrs)) = (&attrs_query, &reference.attrs) {
                    subs.extend(implied_subscriptions(attrs_query, &actor_id.composite(target), attrs));
                }
            }
            (ViewQueryKind::List { query: item_query, .. }, ViewQueryResult::List(list)) => {
                for (item, item_result) in list.value.iter().zip(&list.items) {
                    subs.extend(implied_subscriptions(item_query, &item.value, item_result));
                }
                let Some(attrs_query) = &attrs_query else {
                    continue;
                };
                for item in &list.value {
                    if let Some(attrs) = list.attrs.get(&item.value) {
                        subs.extend(implied_subscriptions(
                            attrs_query,
                            &actor_id.composite(&item.value),
                            attrs,
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    subs
}
