//! Entity and view identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a server-side entity (an "actor").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// Wrap a raw entity id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Composite id of the edge between `self` and `target`.
    ///
    /// Attributes living on a reference or list-item edge are keyed by this id.
    pub fn composite(&self, target: &ActorId) -> ActorId {
        ActorId(format!("{}:{}", self.0, target.0))
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ActorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Entity type name used for attributes on the edge `owner.view`.
pub fn edge_entity_name(owner_entity: &str, view_name: &str) -> String {
    format!("{owner_entity}.{view_name}")
}

/// One live view subscription as understood by the transport.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorViewSub {
    /// Entity type name
    pub entity_name: String,
    /// Entity id
    pub id: ActorId,
    /// View name
    pub view_name: String,
    /// Pagination page, for list views only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
}

impl ActorViewSub {
    /// Subscription to a non-paginated view.
    pub fn new(entity_name: impl Into<String>, id: ActorId, view_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            view_name: view_name.into(),
            page_id: None,
        }
    }

    /// Attach a pagination page.
    pub fn with_page(mut self, page_id: impl Into<String>) -> Self {
        self.page_id = Some(page_id.into());
        self
    }

    /// Key used for reference counting and change routing.
    pub fn view_key(&self) -> ViewKey {
        ViewKey::new(self.entity_name.clone(), self.id.clone(), self.view_name.clone())
    }
}

/// Addresses one (entity, id, view) change log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewKey {
    /// Entity type name
    pub entity_name: String,
    /// Entity id
    pub id: ActorId,
    /// View name
    pub view_name: String,
}

impl ViewKey {
    /// Build a key from its parts.
    pub fn new(entity_name: impl Into<String>, id: ActorId, view_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            view_name: view_name.into(),
        }
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.entity_name, self.id, self.view_name)
    }
}
