//! Query results
//!
//! The server answers a [`QueryDef`](super::QueryDef) with a tree of the same
//! shape: one entry per requested view, each carrying the initial value and
//! the change id it was read at. Reference and list entries embed the results
//! of their nested queries.

use crate::change_id::ChangeId;
use crate::errors::Result;
use crate::identifiers::ActorId;
use crate::value::ListItem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of one query against one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Per-view results by view name
    #[serde(default)]
    pub views: BTreeMap<String, ViewQueryResult>,
}

impl QueryResult {
    /// Result with no views, the answer to an empty query.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a view result.
    pub fn with_view(mut self, name: impl Into<String>, view: ViewQueryResult) -> Self {
        self.views.insert(name.into(), view);
        self
    }

    /// Look up a view result.
    pub fn view(&self, name: &str) -> Option<&ViewQueryResult> {
        self.views.get(name)
    }

    /// Encode for the wire.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the wire.
    pub fn from_wire(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Result for one view, shaped by the view kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewQueryResult {
    /// Value and counter views
    Value(ValueQueryResult),
    /// Reference views
    Ref(RefQueryResult),
    /// List views
    List(ListQueryResult),
}

impl ViewQueryResult {
    /// Version the result was read at.
    pub fn change_id(&self) -> &ChangeId {
        match self {
            Self::Value(result) => &result.change_id,
            Self::Ref(result) => &result.change_id,
            Self::List(result) => &result.change_id,
        }
    }

    /// Short kind name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Ref(_) => "ref",
            Self::List(_) => "list",
        }
    }
}

/// Initial state of a value or counter view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueQueryResult {
    /// Current value
    pub value: serde_json::Value,
    /// Version of `value`
    pub change_id: ChangeId,
}

/// Initial state of a reference view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefQueryResult {
    /// Referenced entity, if set
    pub value: Option<ActorId>,
    /// Version of `value`
    pub change_id: ChangeId,
    /// Edge attributes, when requested and the reference is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<QueryResult>,
    /// Nested query result for the referenced entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryResult>,
}

/// Initial state of one page of a list view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQueryResult {
    /// Items ordered by key
    pub value: Vec<ListItem>,
    /// Version of `value`
    pub change_id: ChangeId,
    /// Edge attributes per item entity
    #[serde(default)]
    pub attrs: BTreeMap<ActorId, QueryResult>,
    /// Nested query results, parallel to `value`
    #[serde(default)]
    pub items: Vec<QueryResult>,
    /// Page this result is authoritative for
    pub page_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_decodes_from_wire() {
        let raw = r#"{
            "views": {
                "name": {"type": "value", "value": "Ada", "changeId": "4"},
                "manager": {"type": "ref", "value": "u9", "changeId": "2:1",
                            "query": {"views": {}}},
                "friends": {"type": "list", "value": [{"key": "a", "value": "u2"}],
                            "changeId": "7", "items": [{"views": {}}], "pageId": "p1"}
            }
        }"#;
        let result = QueryResult::from_wire(raw).unwrap();
        assert_eq!(result.views.len(), 3);
        assert_eq!(result.view("name").unwrap().kind_name(), "value");

        let Some(ViewQueryResult::Ref(manager)) = result.view("manager") else {
            panic!("manager should be a ref result");
        };
        assert_eq!(manager.value, Some(ActorId::new("u9")));
        assert_eq!(manager.change_id.to_string(), "2:1");

        let Some(ViewQueryResult::List(friends)) = result.view("friends") else {
            panic!("friends should be a list result");
        };
        assert_eq!(friends.page_id, "p1");
        assert_eq!(friends.value[0], ListItem::new("a", "u2"));
        assert!(friends.attrs.is_empty());
    }
}
