//! Cached view values

use crate::identifiers::ActorId;
use serde::{Deserialize, Serialize};

/// One entry of a list view: a sortable cursor and the referenced entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    /// Externally meaningful, sortable cursor
    pub key: String,
    /// Referenced entity
    pub value: ActorId,
}

impl ListItem {
    /// Build a list item.
    pub fn new(key: impl Into<String>, value: impl Into<ActorId>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Value cached by a view host; the variant follows the view kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ViewValue {
    /// Value view
    Value(serde_json::Value),
    /// Counter view
    Counter(i64),
    /// Reference view; `None` when the reference is unset
    Ref(Option<ActorId>),
    /// List view, ordered by key
    List(Vec<ListItem>),
}

impl ViewValue {
    /// JSON payload of a value view.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Current count of a counter view.
    pub fn as_counter(&self) -> Option<i64> {
        match self {
            Self::Counter(count) => Some(*count),
            _ => None,
        }
    }

    /// Target of a reference view.
    pub fn as_ref_target(&self) -> Option<&ActorId> {
        match self {
            Self::Ref(target) => target.as_ref(),
            _ => None,
        }
    }

    /// Items of a list view.
    pub fn as_list(&self) -> Option<&[ListItem]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}
