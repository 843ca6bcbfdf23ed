//! Result and notification builders

use std::collections::BTreeMap;
use tether_core::{
    ActorId, ActorViewSub, Change, ChangeEnvelope, ChangeId, ListItem, ListQueryResult,
    Notification, QueryResult, RefQueryResult, ValueQueryResult, ViewQueryResult,
};

/// Single-segment change id.
pub fn cid(n: u64) -> ChangeId {
    ChangeId::from_segments(vec![n])
}

/// Subscription key for a non-paginated view.
pub fn sub(entity_name: &str, id: &str, view: &str) -> ActorViewSub {
    ActorViewSub::new(entity_name, ActorId::new(id), view)
}

/// Initial state of a value view.
pub fn value(value: serde_json::Value, change_id: u64) -> ViewQueryResult {
    ViewQueryResult::Value(ValueQueryResult {
        value,
        change_id: cid(change_id),
    })
}

/// Initial state of a counter view.
pub fn counter(count: i64, change_id: u64) -> ViewQueryResult {
    value(serde_json::Value::from(count), change_id)
}

/// Initial state of a reference view.
pub fn reference(target: Option<&str>, change_id: u64, query: Option<QueryResult>) -> ViewQueryResult {
    ViewQueryResult::Ref(RefQueryResult {
        value: target.map(ActorId::new),
        change_id: cid(change_id),
        attrs: None,
        query,
    })
}

/// Initial state of one list page; `items` are `(key, entity)` pairs.
pub fn list(
    items: &[(&str, &str)],
    change_id: u64,
    page_id: &str,
    item_results: Vec<QueryResult>,
) -> ViewQueryResult {
    ViewQueryResult::List(ListQueryResult {
        value: items
            .iter()
            .map(|(key, id)| ListItem::new(*key, *id))
            .collect(),
        change_id: cid(change_id),
        attrs: BTreeMap::new(),
        items: item_results,
        page_id: page_id.to_string(),
    })
}

/// Push carrying one change.
pub fn changed(entity_name: &str, id: &str, view: &str, change_id: u64, change: Change) -> Notification {
    Notification::ViewChanged {
        envelope: ChangeEnvelope::single(entity_name, ActorId::new(id), view, cid(change_id), change)
            .from_source("server"),
    }
}

/// Push telling a view its subscription caught up.
pub fn synced(entity_name: &str, id: &str, view: &str, change_id: u64) -> Notification {
    Notification::ViewChanged {
        envelope: ChangeEnvelope::sync_marker(&sub(entity_name, id, view), cid(change_id), "server"),
    }
}

/// Value change.
pub fn set(value: serde_json::Value) -> Change {
    Change::ValueChanged { value }
}

/// List insertion on `page_id`.
pub fn item_added(page_id: &str, key: &str, id: &str) -> Change {
    Change::PageItemAdded {
        page_id: page_id.to_string(),
        key: key.to_string(),
        value: ActorId::new(id),
    }
}

/// List removal on `page_id`.
pub fn item_removed(page_id: &str, key: &str) -> Change {
    Change::PageItemRemoved {
        page_id: page_id.to_string(),
        key: key.to_string(),
    }
}
