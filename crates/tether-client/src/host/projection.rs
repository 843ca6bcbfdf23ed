//! Change projection
//!
//! Folds one delta into a view's cached value. Reference and list changes
//! also create, run, release and stop the child hosts behind the value, so
//! projecting them awaits network work.

use super::attributes::AttributesHost;
use super::view::{ListEdge, ViewEdge, ViewHost};
use futures::future::{BoxFuture, FutureExt};
use tether_core::{ActorId, Change, ListItem, Result, TetherError, ViewQueryKind, ViewValue};

impl ViewHost {
    /// Project `change` onto `previous`. `None` means the change was ignored
    /// and the value stands as it was.
    pub(super) fn project(
        &self,
        actor_id: &ActorId,
        change: &Change,
        previous: &ViewValue,
        epoch: u64,
    ) -> BoxFuture<'static, Result<Option<ViewValue>>> {
        let this = self.clone();
        let actor_id = actor_id.clone();
        let change = change.clone();
        let previous = previous.clone();
        async move { this.project_change(&actor_id, &change, previous, epoch).await }.boxed()
    }

    async fn project_change(
        &self,
        actor_id: &ActorId,
        change: &Change,
        previous: ViewValue,
        epoch: u64,
    ) -> Result<Option<ViewValue>> {
        let next = match (&self.inner.def.kind, change) {
            (ViewQueryKind::Value, Change::ValueChanged { value }) => ViewValue::Value(value.clone()),
            (ViewQueryKind::Counter, Change::Incremented { by }) => {
                ViewValue::Counter(self.counter_of(&previous)?.saturating_add(*by))
            }
            (ViewQueryKind::Counter, Change::Decremented { by }) => {
                ViewValue::Counter(self.counter_of(&previous)?.saturating_sub(*by))
            }
            (ViewQueryKind::Counter, Change::Reset { value }) => ViewValue::Counter(*value),
            (ViewQueryKind::Ref { .. }, Change::RefChanged { value }) => {
                let old = previous.as_ref_target().cloned();
                self.retarget(actor_id, old, value.clone(), epoch).await;
                ViewValue::Ref(value.clone())
            }
            (ViewQueryKind::List { .. }, change) if change.page_id().is_some() => {
                return self.project_list(actor_id, change, previous, epoch).await;
            }
            (_, change) => return Err(self.mismatch(&change.kind().to_string())),
        };
        Ok(Some(next))
    }

    fn mismatch(&self, expected: &str) -> TetherError {
        TetherError::view_kind_mismatch(self.name(), expected, self.inner.def.kind_name())
    }

    fn counter_of(&self, value: &ViewValue) -> Result<i64> {
        value.as_counter().ok_or_else(|| self.mismatch("counter"))
    }

    async fn retarget(
        &self,
        actor_id: &ActorId,
        old: Option<ActorId>,
        new: Option<ActorId>,
        epoch: u64,
    ) {
        let ViewEdge::Ref(edge) = &self.inner.edge else {
            return;
        };
        if old == new {
            return;
        }
        if let Some(old) = &old {
            self.forget_child(old);
            edge.attributes.stop().await;
            edge.child.release_subscriptions().await;
            edge.child.detach();
            tracing::debug!(view = %self.name(), from = %old, "Reference target released");
        }
        let Some(new) = new else {
            self.check_ready();
            return;
        };

        if !edge.child.query().is_empty() {
            self.expect_child(&new, epoch);
        }
        edge.attributes.start(&actor_id.composite(&new)).await;
        if let Err(err) = edge.child.run(new.clone()).await {
            tracing::error!(view = %self.name(), to = %new, error = %err, "Reference target failed to load");
        }
        if !self.is_current(epoch) && edge.child.actor_id().as_ref() == Some(&new) {
            edge.attributes.stop().await;
            edge.child.release_subscriptions().await;
            edge.child.detach();
        }
    }

    async fn project_list(
        &self,
        actor_id: &ActorId,
        change: &Change,
        previous: ViewValue,
        epoch: u64,
    ) -> Result<Option<ViewValue>> {
        let ViewEdge::List(edge) = &self.inner.edge else {
            return Err(self.mismatch("list"));
        };
        let mut items = previous
            .as_list()
            .map(<[ListItem]>::to_vec)
            .ok_or_else(|| self.mismatch("list"))?;
        let page_id = edge.page.lock().page_id.clone();
        if change.page_id() != page_id.as_deref() {
            tracing::debug!(
                view = %self.name(),
                page = ?change.page_id(),
                bound = ?page_id,
                "Change for another page ignored"
            );
            return Ok(None);
        }

        let applied = match change {
            Change::PageItemAdded { key, value, .. } => {
                self.add_item(edge, actor_id, &mut items, key, value, epoch).await
            }
            Change::PageItemRemoved { key, .. } => self.remove_item(edge, &mut items, key).await,
            Change::PageCleared { .. } => {
                self.clear_items(edge, &mut items).await;
                true
            }
            _ => false,
        };
        Ok(applied.then_some(ViewValue::List(items)))
    }

    async fn add_item(
        &self,
        edge: &ListEdge,
        actor_id: &ActorId,
        items: &mut Vec<ListItem>,
        key: &str,
        value: &ActorId,
        epoch: u64,
    ) -> bool {
        if items.iter().any(|item| item.key == key || item.value == *value) {
            tracing::warn!(view = %self.name(), key, item = %value, "Duplicate list item ignored");
            return false;
        }

        let host = self.item_query_host(edge);
        let attributes = AttributesHost::new(&self.inner.system, edge.attrs_query.clone());
        if !edge.item_query.is_empty() {
            self.expect_child(value, epoch);
        }
        attributes.start(&actor_id.composite(value)).await;
        if let Err(err) = host.run(value.clone()).await {
            tracing::error!(view = %self.name(), item = %value, error = %err, "List item failed to load");
        }
        if !self.is_current(epoch) {
            host.release().await;
            attributes.stop().await;
            attributes.shutdown();
            return false;
        }

        {
            let mut page = edge.page.lock();
            page.hosts.insert(value.clone(), host);
            page.attributes.insert(value.clone(), attributes);
        }
        let item = ListItem::new(key, value.clone());
        let prepend = items.first().is_some_and(|first| item.key < first.key);
        if prepend {
            items.insert(0, item);
        } else {
            items.push(item);
        }
        true
    }

    async fn remove_item(&self, edge: &ListEdge, items: &mut Vec<ListItem>, key: &str) -> bool {
        let Some(position) = items.iter().position(|item| item.key == key) else {
            tracing::debug!(view = %self.name(), key, "Removal of unknown list key ignored");
            return false;
        };
        let removed = items.remove(position);
        let (host, attributes) = {
            let mut page = edge.page.lock();
            (
                page.hosts.remove(&removed.value),
                page.attributes.remove(&removed.value),
            )
        };
        self.forget_child(&removed.value);
        if let Some(host) = host {
            host.release().await;
        }
        if let Some(attributes) = attributes {
            attributes.stop().await;
            attributes.shutdown();
        }
        self.check_ready();
        true
    }

    async fn clear_items(&self, edge: &ListEdge, items: &mut Vec<ListItem>) {
        let (hosts, attributes) = {
            let mut page = edge.page.lock();
            (
                std::mem::take(&mut page.hosts),
                std::mem::take(&mut page.attributes),
            )
        };
        for item in items.drain(..) {
            self.forget_child(&item.value);
        }
        for host in hosts.into_values() {
            host.release().await;
        }
        for attributes in attributes.into_values() {
            attributes.stop().await;
            attributes.shutdown();
        }
        self.check_ready();
    }
}
