//! View hosts
//!
//! A view host caches the current value of one view of one entity and keeps
//! it current by projecting the envelopes the message store delivers.
//! Deliveries land in an inbox and are projected strictly one at a time, in
//! arrival order, even when projecting one needs to await network work.
//!
//! Every attach starts a new epoch. Work that was started under an older
//! epoch re-checks it after each await and discards its result if the host
//! was detached in the meantime.

use super::attributes::AttributesHost;
use super::query::{HostParent, QueryHost, QueryHostInner};
use super::watch::WatchPath;
use super::{ChangeEvent, ChangeHandler, HandlerId};
use crate::store::{ChangeSink, Delivery, StoreSubscription};
use crate::system::SystemCore;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_core::{
    ActorId, ActorViewSub, ChangeId, ChangeKind, ListItem, QueryDef, QueryResult, Result,
    TetherError, ViewKey, ViewQueryDef, ViewQueryKind, ViewQueryResult, ViewValue,
};

#[derive(Default)]
pub(super) struct ViewState {
    actor_id: Option<ActorId>,
    value: Option<ViewValue>,
    change_id: Option<ChangeId>,
    epoch: u64,
    subscription: Option<StoreSubscription>,
    inbox: VecDeque<Delivery>,
    draining: bool,
    initial_projected: bool,
    reported: bool,
    expected_children: BTreeSet<ActorId>,
    loaded_children: BTreeSet<ActorId>,
}

pub(super) struct RefEdge {
    pub(super) child: QueryHost,
    pub(super) attributes: AttributesHost,
}

#[derive(Default)]
pub(super) struct ListPage {
    pub(super) page_id: Option<String>,
    pub(super) hosts: BTreeMap<ActorId, QueryHost>,
    pub(super) attributes: BTreeMap<ActorId, AttributesHost>,
}

pub(super) struct ListEdge {
    pub(super) item_query: Arc<QueryDef>,
    pub(super) attrs_query: Option<Arc<QueryDef>>,
    pub(super) page: Mutex<ListPage>,
}

impl ListEdge {
    pub(super) fn snapshot(&self) -> (Vec<QueryHost>, Vec<AttributesHost>) {
        let page = self.page.lock();
        (
            page.hosts.values().cloned().collect(),
            page.attributes.values().cloned().collect(),
        )
    }
}

pub(super) enum ViewEdge {
    Leaf,
    Ref(RefEdge),
    List(ListEdge),
}

pub(crate) struct ViewHostInner {
    pub(super) name: String,
    pub(super) entity_name: String,
    pub(super) def: ViewQueryDef,
    pub(super) system: Arc<SystemCore>,
    pub(super) edge: ViewEdge,
    parent: Weak<QueryHostInner>,
    state: Mutex<ViewState>,
    handlers: Mutex<BTreeMap<HandlerId, (ChangeKind, ChangeHandler)>>,
    next_handler: AtomicU64,
}

/// Hosts one view of a bound entity.
#[derive(Clone)]
pub struct ViewHost {
    pub(super) inner: Arc<ViewHostInner>,
}

impl fmt::Debug for ViewHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewHost")
            .field("entity", &self.inner.entity_name)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.def.kind_name())
            .field("actor_id", &self.actor_id())
            .finish()
    }
}

impl ViewHost {
    pub(crate) fn new(
        system: &Arc<SystemCore>,
        entity_name: &str,
        name: &str,
        def: &ViewQueryDef,
        parent: Weak<QueryHostInner>,
    ) -> Self {
        let attrs_query = def.attrs_query(entity_name, name).map(Arc::new);
        let inner = Arc::new_cyclic(|me: &Weak<ViewHostInner>| {
            let edge = match &def.kind {
                ViewQueryKind::Value | ViewQueryKind::Counter => ViewEdge::Leaf,
                ViewQueryKind::Ref { query, .. } => ViewEdge::Ref(RefEdge {
                    child: QueryHost::new(
                        system.clone(),
                        Arc::new(query.clone()),
                        HostParent::View(me.clone()),
                    ),
                    attributes: AttributesHost::new(system, attrs_query),
                }),
                ViewQueryKind::List { query, .. } => ViewEdge::List(ListEdge {
                    item_query: Arc::new(query.clone()),
                    attrs_query,
                    page: Mutex::new(ListPage::default()),
                }),
            };
            ViewHostInner {
                name: name.to_string(),
                entity_name: entity_name.to_string(),
                def: def.clone(),
                system: system.clone(),
                edge,
                parent,
                state: Mutex::new(ViewState::default()),
                handlers: Mutex::new(BTreeMap::new()),
                next_handler: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ViewHostInner>) -> Self {
        Self { inner }
    }

    /// View name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Entity type the view belongs to.
    pub fn entity_name(&self) -> &str {
        &self.inner.entity_name
    }

    /// Definition this host was built from.
    pub fn definition(&self) -> &ViewQueryDef {
        &self.inner.def
    }

    /// Bound entity.
    pub fn actor_id(&self) -> Option<ActorId> {
        self.inner.state.lock().actor_id.clone()
    }

    /// True while bound to an entity.
    pub fn is_attached(&self) -> bool {
        self.inner.state.lock().actor_id.is_some()
    }

    /// Cached value.
    pub fn value(&self) -> Option<ViewValue> {
        self.inner.state.lock().value.clone()
    }

    /// Version of the cached value.
    pub fn change_id(&self) -> Option<ChangeId> {
        self.inner.state.lock().change_id.clone()
    }

    /// Current count of a counter view.
    pub fn count(&self) -> Result<Option<i64>> {
        self.expect_kind("counter", matches!(self.inner.def.kind, ViewQueryKind::Counter))?;
        Ok(self.value().and_then(|value| value.as_counter()))
    }

    /// Target of a reference view.
    pub fn ref_target(&self) -> Result<Option<ActorId>> {
        self.ref_edge()?;
        Ok(self
            .value()
            .and_then(|value| value.as_ref_target().cloned()))
    }

    /// Query host of the referenced entity.
    pub fn ref_host(&self) -> Result<QueryHost> {
        Ok(self.ref_edge()?.child.clone())
    }

    /// Attributes on the reference edge.
    pub fn attributes(&self) -> Result<AttributesHost> {
        Ok(self.ref_edge()?.attributes.clone())
    }

    /// Cached items of a list view.
    pub fn list_items(&self) -> Result<Vec<ListItem>> {
        self.list_edge()?;
        Ok(self
            .value()
            .and_then(|value| value.as_list().map(<[ListItem]>::to_vec))
            .unwrap_or_default())
    }

    /// Item at `index` of a list view.
    pub fn list_item(&self, index: usize) -> Result<ListItem> {
        let items = self.list_items()?;
        let len = items.len();
        items
            .into_iter()
            .nth(index)
            .ok_or_else(|| TetherError::index_out_of_bounds(index, len))
    }

    /// Query host of list item `id`.
    pub fn item_host(&self, id: &ActorId) -> Result<Option<QueryHost>> {
        Ok(self.list_edge()?.page.lock().hosts.get(id).cloned())
    }

    /// Attributes on the edge to list item `id`.
    pub fn item_attributes(&self, id: &ActorId) -> Result<Option<AttributesHost>> {
        Ok(self.list_edge()?.page.lock().attributes.get(id).cloned())
    }

    /// Page a list view is bound to.
    pub fn page_id(&self) -> Option<String> {
        match &self.inner.edge {
            ViewEdge::List(edge) => edge.page.lock().page_id.clone(),
            _ => None,
        }
    }

    fn expect_kind(&self, expected: &str, matches: bool) -> Result<()> {
        if matches {
            Ok(())
        } else {
            Err(TetherError::view_kind_mismatch(
                self.inner.name.as_str(),
                expected,
                self.inner.def.kind_name(),
            ))
        }
    }

    fn ref_edge(&self) -> Result<&RefEdge> {
        match &self.inner.edge {
            ViewEdge::Ref(edge) => Ok(edge),
            _ => Err(TetherError::view_kind_mismatch(
                self.inner.name.as_str(),
                "ref",
                self.inner.def.kind_name(),
            )),
        }
    }

    fn list_edge(&self) -> Result<&ListEdge> {
        match &self.inner.edge {
            ViewEdge::List(edge) => Ok(edge),
            _ => Err(TetherError::view_kind_mismatch(
                self.inner.name.as_str(),
                "list",
                self.inner.def.kind_name(),
            )),
        }
    }

    /// Run `handler` after every applied change of `kind`.
    pub fn add_change_handler<F>(&self, kind: ChangeKind, handler: F) -> HandlerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = HandlerId::new(self.inner.next_handler.fetch_add(1, Ordering::Relaxed) + 1);
        let handler: ChangeHandler = Arc::new(handler);
        self.inner.handlers.lock().insert(id, (kind, handler));
        id
    }

    /// Remove a change handler.
    pub fn remove_change_handler(&self, id: HandlerId) -> bool {
        self.inner.handlers.lock().remove(&id).is_some()
    }

    /// Subscriptions held by this view and everything below it.
    pub fn subscriptions(&self) -> Vec<ActorViewSub> {
        let Some(actor_id) = self.actor_id() else {
            return Vec::new();
        };
        let mut subs = Vec::new();
        if self.inner.def.subscribe {
            let mut sub = ActorViewSub::new(
                self.inner.entity_name.as_str(),
                actor_id,
                self.inner.name.as_str(),
            );
            sub.page_id = self.page_id();
            subs.push(sub);
        }
        match &self.inner.edge {
            ViewEdge::Leaf => {}
            ViewEdge::Ref(edge) => {
                subs.extend(edge.child.subscriptions());
                subs.extend(edge.attributes.subscriptions());
            }
            ViewEdge::List(edge) => {
                let (hosts, attributes) = edge.snapshot();
                subs.extend(hosts.iter().flat_map(QueryHost::subscriptions));
                subs.extend(attributes.iter().flat_map(AttributesHost::subscriptions));
            }
        }
        subs
    }

    pub(crate) fn attach(&self, actor_id: &ActorId, result: &ViewQueryResult) -> Result<()> {
        let value = self.initial_value(result)?;
        if self.is_attached() {
            self.detach();
        }
        let change_id = result.change_id().clone();
        let expected_children = self.initial_children(result);
        let epoch = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.actor_id = Some(actor_id.clone());
            state.value = Some(value);
            state.change_id = Some(change_id.clone());
            state.inbox.clear();
            state.initial_projected = !self.inner.def.subscribe;
            state.reported = false;
            state.expected_children = expected_children;
            state.loaded_children.clear();
            state.epoch
        };

        if let Err(err) = self.attach_edge(actor_id, result) {
            self.detach();
            return Err(err);
        }
        if self.inner.def.subscribe {
            self.subscribe_store(actor_id, &change_id, epoch);
        }
        tracing::trace!(
            entity = %self.inner.entity_name,
            actor = %actor_id,
            view = %self.inner.name,
            change_id = %change_id,
            "View attached"
        );
        self.check_ready();
        Ok(())
    }

    fn initial_value(&self, result: &ViewQueryResult) -> Result<ViewValue> {
        let name = &self.inner.name;
        match (&self.inner.def.kind, result) {
            (ViewQueryKind::Value, ViewQueryResult::Value(result)) => {
                Ok(ViewValue::Value(result.value.clone()))
            }
            (ViewQueryKind::Counter, ViewQueryResult::Value(result)) => {
                if result.value.is_null() {
                    return Ok(ViewValue::Counter(0));
                }
                result.value.as_i64().map(ViewValue::Counter).ok_or_else(|| {
                    TetherError::protocol_mismatch(format!(
                        "counter view '{name}' holds a non-integer value"
                    ))
                })
            }
            (ViewQueryKind::Ref { .. }, ViewQueryResult::Ref(result)) => {
                Ok(ViewValue::Ref(result.value.clone()))
            }
            (ViewQueryKind::List { query, .. }, ViewQueryResult::List(result)) => {
                if !query.is_empty() && result.items.len() != result.value.len() {
                    return Err(TetherError::protocol_mismatch(format!(
                        "list view '{name}' has {} items but {} item results",
                        result.value.len(),
                        result.items.len()
                    )));
                }
                let mut keys = BTreeSet::new();
                if let Some(duplicate) = result.value.iter().find(|item| !keys.insert(&item.key)) {
                    return Err(TetherError::protocol_mismatch(format!(
                        "list view '{name}' repeats key '{}'",
                        duplicate.key
                    )));
                }
                Ok(ViewValue::List(result.value.clone()))
            }
            _ => Err(TetherError::view_kind_mismatch(
                name.as_str(),
                self.inner.def.kind_name(),
                result.kind_name(),
            )),
        }
    }

    fn initial_children(&self, result: &ViewQueryResult) -> BTreeSet<ActorId> {
        match (&self.inner.edge, result) {
            (ViewEdge::Ref(edge), ViewQueryResult::Ref(result))
                if !edge.child.query().is_empty() =>
            {
                result.value.iter().cloned().collect()
            }
            (ViewEdge::List(edge), ViewQueryResult::List(result)) if !edge.item_query.is_empty() => {
                result.value.iter().map(|item| item.value.clone()).collect()
            }
            _ => BTreeSet::new(),
        }
    }

    fn attach_edge(&self, actor_id: &ActorId, result: &ViewQueryResult) -> Result<()> {
        let empty = QueryResult::empty();
        match (&self.inner.edge, result) {
            (ViewEdge::Ref(edge), ViewQueryResult::Ref(result)) => {
                let Some(target) = &result.value else {
                    return Ok(());
                };
                let child_result = match &result.query {
                    Some(query) => query,
                    None if edge.child.query().is_empty() => &empty,
                    None => {
                        return Err(TetherError::protocol_mismatch(format!(
                            "reference view '{}' result lacks the referenced entity's views",
                            self.inner.name
                        )))
                    }
                };
                edge.child.attach(target, child_result)?;
                edge.attributes.attach(&actor_id.composite(target), result.attrs.as_ref())
            }
            (ViewEdge::List(edge), ViewQueryResult::List(result)) => {
                edge.page.lock().page_id = Some(result.page_id.clone());
                for (index, item) in result.value.iter().enumerate() {
                    let host = self.item_query_host(edge);
                    let attributes = AttributesHost::new(&self.inner.system, edge.attrs_query.clone());
                    {
                        let mut page = edge.page.lock();
                        page.hosts.insert(item.value.clone(), host.clone());
                        page.attributes.insert(item.value.clone(), attributes.clone());
                    }
                    host.attach(&item.value, result.items.get(index).unwrap_or(&empty))?;
                    attributes.attach(&actor_id.composite(&item.value), result.attrs.get(&item.value))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub(super) fn item_query_host(&self, edge: &ListEdge) -> QueryHost {
        QueryHost::new(
            self.inner.system.clone(),
            edge.item_query.clone(),
            HostParent::View(Arc::downgrade(&self.inner)),
        )
    }

    fn subscribe_store(&self, actor_id: &ActorId, change_id: &ChangeId, epoch: u64) {
        let store = &self.inner.system.store;
        let key = ViewKey::new(
            self.inner.entity_name.as_str(),
            actor_id.clone(),
            self.inner.name.as_str(),
        );
        if store
            .latest_change_id(&key)
            .is_some_and(|latest| *change_id > latest)
        {
            let trimmed = store.remove_changes(&key, change_id);
            tracing::debug!(key = %key, trimmed, "Trimmed history behind fetched version");
        }
        let weak: Weak<ViewHostInner> = Arc::downgrade(&self.inner);
        let sink: Weak<dyn ChangeSink> = weak;
        let subscription = store.subscribe(key, change_id, sink);
        let orphaned = {
            let mut state = self.inner.state.lock();
            if state.epoch == epoch {
                state.subscription = Some(subscription);
                None
            } else {
                Some(subscription)
            }
        };
        if let Some(subscription) = orphaned {
            store.unsubscribe(&subscription);
        }
    }

    pub(crate) fn detach(&self) {
        let subscription = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.actor_id = None;
            state.value = None;
            state.change_id = None;
            state.inbox.clear();
            state.initial_projected = false;
            state.reported = false;
            state.expected_children.clear();
            state.loaded_children.clear();
            state.subscription.take()
        };
        if let Some(subscription) = subscription {
            self.inner.system.store.unsubscribe(&subscription);
        }
        match &self.inner.edge {
            ViewEdge::Leaf => {}
            ViewEdge::Ref(edge) => {
                edge.child.detach();
                edge.attributes.detach();
            }
            ViewEdge::List(edge) => {
                let page = std::mem::take(&mut *edge.page.lock());
                for host in page.hosts.values() {
                    host.stop();
                }
                for attributes in page.attributes.values() {
                    attributes.shutdown();
                }
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.detach();
        self.inner.handlers.lock().clear();
        if let ViewEdge::Ref(edge) = &self.inner.edge {
            edge.child.stop();
            edge.attributes.shutdown();
        }
    }

    pub(super) fn is_current(&self, epoch: u64) -> bool {
        self.inner.state.lock().epoch == epoch
    }

    fn parent(&self) -> Option<QueryHost> {
        self.inner.parent.upgrade().map(QueryHost::from_inner)
    }

    fn drain_inbox(self) -> BoxFuture<'static, ()> {
        async move {
            {
                let mut state = self.inner.state.lock();
                if state.draining {
                    return;
                }
                state.draining = true;
            }
            loop {
                let next = {
                    let mut state = self.inner.state.lock();
                    match state.inbox.pop_front() {
                        Some(delivery) => Some((delivery, state.epoch)),
                        None => {
                            state.draining = false;
                            None
                        }
                    }
                };
                let Some((delivery, epoch)) = next else {
                    break;
                };
                self.handle_delivery(delivery, epoch).await;
            }
        }
        .boxed()
    }

    pub(crate) fn drain_tree(&self) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            this.clone().drain_inbox().await;
            match &this.inner.edge {
                ViewEdge::Leaf => {}
                ViewEdge::Ref(edge) => {
                    edge.child.drain_tree().await;
                    edge.attributes.drain().await;
                }
                ViewEdge::List(edge) => {
                    let (hosts, attributes) = edge.snapshot();
                    for host in hosts {
                        host.drain_tree().await;
                    }
                    for attributes in attributes {
                        attributes.drain().await;
                    }
                }
            }
        }
        .boxed()
    }

    async fn handle_delivery(&self, delivery: Delivery, epoch: u64) {
        let live = delivery.is_live();
        let envelope = delivery.into_envelope();
        let (actor_id, current, mut value) = {
            let state = self.inner.state.lock();
            if state.epoch != epoch {
                return;
            }
            match (&state.actor_id, &state.value) {
                (Some(actor_id), Some(value)) => {
                    (actor_id.clone(), state.change_id.clone(), value.clone())
                }
                _ => return,
            }
        };

        if envelope.key != actor_id {
            tracing::error!(
                view = %self.inner.name,
                bound = %actor_id,
                key = %envelope.key,
                "Envelope routed to a view bound to another entity"
            );
            return;
        }
        if envelope.is_sync_marker() {
            if live {
                self.initial_changes_projected(epoch);
            }
            return;
        }
        if let Some(current) = current.as_ref().filter(|current| envelope.change_id <= **current) {
            tracing::warn!(
                view = %self.inner.name,
                actor = %actor_id,
                change_id = %envelope.change_id,
                current = %current,
                "Stale envelope dropped"
            );
            if live {
                self.initial_changes_projected(epoch);
            }
            return;
        }

        let mut applied = Vec::new();
        for change in envelope.effective_changes() {
            match self.project(&actor_id, change, &value, epoch).await {
                Ok(None) => {}
                Ok(Some(next)) => {
                    applied.push(ChangeEvent {
                        actor_id: actor_id.clone(),
                        view_name: self.inner.name.clone(),
                        change: change.clone(),
                        previous: value,
                        next: next.clone(),
                    });
                    value = next;
                }
                Err(err) => {
                    tracing::error!(
                        view = %self.inner.name,
                        actor = %actor_id,
                        change = %change.kind(),
                        error = %err,
                        "Change cannot be projected"
                    );
                    break;
                }
            }
        }

        let committed = {
            let mut state = self.inner.state.lock();
            if state.epoch == epoch {
                state.value = Some(value);
                state.change_id = Some(envelope.change_id.clone());
                true
            } else {
                false
            }
        };
        if !committed {
            tracing::debug!(view = %self.inner.name, "View detached during projection");
            return;
        }
        tracing::trace!(
            view = %self.inner.name,
            actor = %actor_id,
            change_id = %envelope.change_id,
            "Envelope projected"
        );
        for event in &applied {
            self.fire_handlers(event);
        }
        if !applied.is_empty() {
            self.notify_changed();
        }
        if live {
            self.initial_changes_projected(epoch);
        }
    }

    fn fire_handlers(&self, event: &ChangeEvent) {
        let kind = event.change.kind();
        let handlers: Vec<ChangeHandler> = self
            .inner
            .handlers
            .lock()
            .values()
            .filter(|(registered, _)| *registered == kind)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn notify_changed(&self) {
        if let Some(parent) = self.parent() {
            parent.notify_changed(WatchPath::new([self.inner.name.as_str()]));
        }
    }

    pub(crate) fn child_changed(&self, child: &ActorId, path: WatchPath) {
        let path = match &self.inner.edge {
            ViewEdge::Leaf => return,
            ViewEdge::Ref(_) => path.under([self.inner.name.as_str()]),
            ViewEdge::List(_) => path.under([self.inner.name.as_str(), child.as_str()]),
        };
        if let Some(parent) = self.parent() {
            parent.notify_changed(path);
        }
    }

    fn initial_changes_projected(&self, epoch: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.initial_projected = true;
        }
        self.check_ready();
    }

    pub(crate) fn child_loaded(&self, child: &ActorId) {
        {
            let mut state = self.inner.state.lock();
            if !state.expected_children.contains(child) {
                return;
            }
            state.loaded_children.insert(child.clone());
        }
        self.check_ready();
    }

    pub(super) fn expect_child(&self, child: &ActorId, epoch: u64) {
        let mut state = self.inner.state.lock();
        if state.epoch == epoch && !state.reported {
            state.expected_children.insert(child.clone());
        }
    }

    pub(super) fn forget_child(&self, child: &ActorId) {
        let mut state = self.inner.state.lock();
        state.expected_children.remove(child);
        state.loaded_children.remove(child);
    }

    pub(super) fn check_ready(&self) {
        let ready = {
            let mut state = self.inner.state.lock();
            let waiting = state.reported
                || !state.initial_projected
                || state.actor_id.is_none()
                || !state.expected_children.is_subset(&state.loaded_children);
            if !waiting {
                state.reported = true;
            }
            !waiting
        };
        if ready {
            tracing::trace!(view = %self.inner.name, "View ready");
            if let Some(parent) = self.parent() {
                parent.report_view(&self.inner.name);
            }
        }
    }
}

impl ChangeSink for ViewHostInner {
    fn deliver(&self, delivery: Delivery) {
        let mut state = self.state.lock();
        if state.actor_id.is_some() {
            state.inbox.push_back(delivery);
        }
    }

    fn drain(self: Arc<Self>) -> BoxFuture<'static, ()> {
        ViewHost::from_inner(self).drain_inbox()
    }
}
