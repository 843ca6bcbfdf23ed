//! Query definitions
//!
//! A [`QueryDef`] is an immutable tree naming the views a consumer needs on one
//! entity type. Reference and list views embed the query to run against the
//! entities they point at, so a single definition describes an arbitrarily
//! deep entity graph.

use crate::errors::Result;
use crate::identifiers::edge_entity_name;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Declarative request for views of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDef {
    /// Entity type the views belong to
    pub entity_name: String,
    /// Requested views by name
    #[serde(default)]
    pub views: BTreeMap<String, ViewQueryDef>,
}

impl QueryDef {
    /// Start an empty query for `entity_name`.
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            views: BTreeMap::new(),
        }
    }

    /// Add a view definition.
    pub fn with_view(mut self, name: impl Into<String>, view: ViewQueryDef) -> Self {
        self.views.insert(name.into(), view);
        self
    }

    /// Add a plain value view.
    pub fn value(self, name: impl Into<String>) -> Self {
        self.with_view(name, ViewQueryDef::value())
    }

    /// Add a counter view.
    pub fn counter(self, name: impl Into<String>) -> Self {
        self.with_view(name, ViewQueryDef::counter())
    }

    /// Add a reference view resolving `query` on the referenced entity.
    pub fn reference(self, name: impl Into<String>, query: QueryDef) -> Self {
        self.with_view(name, ViewQueryDef::reference(query))
    }

    /// Add a list view resolving `query` on every item.
    pub fn list(self, name: impl Into<String>, query: QueryDef) -> Self {
        self.with_view(name, ViewQueryDef::list(query))
    }

    /// Look up a view definition.
    pub fn view(&self, name: &str) -> Option<&ViewQueryDef> {
        self.views.get(name)
    }

    /// A query with no views needs no fetch and is ready as soon as it is bound.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Every `entity/view` key reachable from this query, including edge
    /// attributes and nested reference/list queries.
    pub fn view_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        self.collect_view_keys(&mut keys);
        keys
    }

    fn collect_view_keys(&self, keys: &mut BTreeSet<String>) {
        for (name, view) in &self.views {
            keys.insert(format!("{}/{}", self.entity_name, name));
            if let Some(attrs) = view.attrs_query(&self.entity_name, name) {
                attrs.collect_view_keys(keys);
            }
            if let Some(query) = view.sub_query() {
                query.collect_view_keys(keys);
            }
        }
    }

    /// Two queries intersect when they share any `entity/view` key.
    pub fn intersects(&self, other: &QueryDef) -> bool {
        let mine = self.view_keys();
        other.view_keys().iter().any(|key| mine.contains(key))
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

/// Pagination anchor for list views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PageCursor {
    /// Items strictly after this key
    StartAfter(String),
    /// Items strictly before this key
    EndBefore(String),
}

/// What a single view resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewQueryKind {
    /// Opaque value replaced wholesale on change
    Value,
    /// Integer with increment/decrement/reset changes
    Counter,
    /// Reference to another entity
    Ref {
        /// Query run against the referenced entity
        query: QueryDef,
        /// Attribute views living on the edge
        #[serde(default)]
        attrs: Vec<String>,
    },
    /// Ordered, paginated list of entity references
    List {
        /// Query run against every item
        query: QueryDef,
        /// Attribute views living on each item edge
        #[serde(default)]
        attrs: Vec<String>,
        /// Page anchor
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<PageCursor>,
        /// Page size; negative selects the last N items
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<i64>,
    },
}

fn default_subscribe() -> bool {
    true
}

/// One view entry in a [`QueryDef`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewQueryDef {
    /// View kind and its nested definitions
    pub kind: ViewQueryKind,
    /// `false` fetches the view once and never subscribes to it
    #[serde(default = "default_subscribe")]
    pub subscribe: bool,
}

impl ViewQueryDef {
    fn of(kind: ViewQueryKind) -> Self {
        Self {
            kind,
            subscribe: true,
        }
    }

    /// Value view.
    pub fn value() -> Self {
        Self::of(ViewQueryKind::Value)
    }

    /// Counter view.
    pub fn counter() -> Self {
        Self::of(ViewQueryKind::Counter)
    }

    /// Reference view.
    pub fn reference(query: QueryDef) -> Self {
        Self::of(ViewQueryKind::Ref {
            query,
            attrs: Vec::new(),
        })
    }

    /// List view.
    pub fn list(query: QueryDef) -> Self {
        Self::of(ViewQueryKind::List {
            query,
            attrs: Vec::new(),
            cursor: None,
            limit: None,
        })
    }

    /// Fetch without a live subscription.
    pub fn without_subscription(mut self) -> Self {
        self.subscribe = false;
        self
    }

    /// Request edge attributes. No effect on value and counter views.
    pub fn with_attrs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match &mut self.kind {
            ViewQueryKind::Ref { attrs, .. } | ViewQueryKind::List { attrs, .. } => {
                attrs.extend(names.into_iter().map(Into::into));
            }
            ViewQueryKind::Value | ViewQueryKind::Counter => {}
        }
        self
    }

    /// Page size for list views; negative takes the last `|n|` items.
    pub fn limit(mut self, n: i64) -> Self {
        if let ViewQueryKind::List { limit, .. } = &mut self.kind {
            *limit = Some(n);
        }
        self
    }

    /// Start the page after `key`.
    pub fn start_after(mut self, key: impl Into<String>) -> Self {
        if let ViewQueryKind::List { cursor, .. } = &mut self.kind {
            *cursor = Some(PageCursor::StartAfter(key.into()));
        }
        self
    }

    /// End the page before `key`.
    pub fn end_before(mut self, key: impl Into<String>) -> Self {
        if let ViewQueryKind::List { cursor, .. } = &mut self.kind {
            *cursor = Some(PageCursor::EndBefore(key.into()));
        }
        self
    }

    /// Short kind name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ViewQueryKind::Value => "value",
            ViewQueryKind::Counter => "counter",
            ViewQueryKind::Ref { .. } => "ref",
            ViewQueryKind::List { .. } => "list",
        }
    }

    /// Query applied to referenced entities, for ref and list views.
    pub fn sub_query(&self) -> Option<&QueryDef> {
        match &self.kind {
            ViewQueryKind::Ref { query, .. } | ViewQueryKind::List { query, .. } => Some(query),
            ViewQueryKind::Value | ViewQueryKind::Counter => None,
        }
    }

    /// Edge attribute names.
    pub fn attrs(&self) -> &[String] {
        match &self.kind {
            ViewQueryKind::Ref { attrs, .. } | ViewQueryKind::List { attrs, .. } => attrs,
            ViewQueryKind::Value | ViewQueryKind::Counter => &[],
        }
    }

    /// True when the pagination limit asks for the last items.
    pub fn is_reverse(&self) -> bool {
        matches!(self.kind, ViewQueryKind::List { limit: Some(n), .. } if n < 0)
    }

    /// Query over the edge entity holding this view's attributes, if any were requested.
    pub fn attrs_query(&self, owner_entity: &str, view_name: &str) -> Option<QueryDef> {
        let attrs = self.attrs();
        if attrs.is_empty() {
            return None;
        }
        let edge = edge_entity_name(owner_entity, view_name);
        Some(
            attrs
                .iter()
                .fold(QueryDef::new(edge), |query, name| query.value(name.as_str())),
        )
    }
}
