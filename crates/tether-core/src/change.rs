//! Change deltas and the envelopes that deliver them
//!
//! An envelope carries one or more ordered deltas for a single
//! `(entity, id, view)` triple, stamped with the change id reached after the
//! last delta. Live envelopes from the server carry exactly one change; the
//! history sent when a subscription starts may carry many. Envelopes with no
//! changes at all are sync markers: they carry no data and only tell a view
//! that its subscription has caught up.

use crate::change_id::ChangeId;
use crate::errors::Result;
use crate::identifiers::{ActorId, ActorViewSub, ViewKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One domain delta applied to a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Change {
    /// Value view replaced
    ValueChanged {
        /// New value
        value: serde_json::Value,
    },
    /// Counter incremented
    Incremented {
        /// Amount added
        by: i64,
    },
    /// Counter decremented
    Decremented {
        /// Amount subtracted
        by: i64,
    },
    /// Counter overwritten
    Reset {
        /// New count
        value: i64,
    },
    /// Reference retargeted or cleared
    RefChanged {
        /// New target
        value: Option<ActorId>,
    },
    /// Item added to a list page
    #[serde(rename_all = "camelCase")]
    PageItemAdded {
        /// Page the item belongs to
        page_id: String,
        /// Sort key
        key: String,
        /// Referenced entity
        value: ActorId,
    },
    /// Item removed from a list page
    #[serde(rename_all = "camelCase")]
    PageItemRemoved {
        /// Page the item belonged to
        page_id: String,
        /// Sort key of the removed item
        key: String,
    },
    /// All items of a page removed
    #[serde(rename_all = "camelCase")]
    PageCleared {
        /// Page that was cleared
        page_id: String,
    },
}

impl Change {
    /// Discriminant used to register change handlers.
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::ValueChanged { .. } => ChangeKind::ValueChanged,
            Self::Incremented { .. } => ChangeKind::Incremented,
            Self::Decremented { .. } => ChangeKind::Decremented,
            Self::Reset { .. } => ChangeKind::Reset,
            Self::RefChanged { .. } => ChangeKind::RefChanged,
            Self::PageItemAdded { .. } => ChangeKind::PageItemAdded,
            Self::PageItemRemoved { .. } => ChangeKind::PageItemRemoved,
            Self::PageCleared { .. } => ChangeKind::PageCleared,
        }
    }

    /// Page a list change applies to.
    pub fn page_id(&self) -> Option<&str> {
        match self {
            Self::PageItemAdded { page_id, .. }
            | Self::PageItemRemoved { page_id, .. }
            | Self::PageCleared { page_id } => Some(page_id),
            _ => None,
        }
    }
}

/// Change discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    /// [`Change::ValueChanged`]
    ValueChanged,
    /// [`Change::Incremented`]
    Incremented,
    /// [`Change::Decremented`]
    Decremented,
    /// [`Change::Reset`]
    Reset,
    /// [`Change::RefChanged`]
    RefChanged,
    /// [`Change::PageItemAdded`]
    PageItemAdded,
    /// [`Change::PageItemRemoved`]
    PageItemRemoved,
    /// [`Change::PageCleared`]
    PageCleared,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ValueChanged => "valueChanged",
            Self::Incremented => "incremented",
            Self::Decremented => "decremented",
            Self::Reset => "reset",
            Self::RefChanged => "refChanged",
            Self::PageItemAdded => "pageItemAdded",
            Self::PageItemRemoved => "pageItemRemoved",
            Self::PageCleared => "pageCleared",
        };
        f.write_str(name)
    }
}

/// Delivery unit of changes for one view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEnvelope {
    /// Originator of the changes
    pub source_id: String,
    /// Owning entity id, or composite id for edge attributes
    pub key: ActorId,
    /// Entity type name
    pub entity_name: String,
    /// View name
    pub name: String,
    /// Version reached after applying `changes`
    pub change_id: ChangeId,
    /// Ordered deltas
    #[serde(default)]
    pub changes: Vec<Change>,
    /// Apply only the last change instead of every change in order
    #[serde(default)]
    pub is_overwriting: bool,
}

impl ChangeEnvelope {
    /// Envelope carrying a single live change.
    pub fn single(
        entity_name: impl Into<String>,
        key: ActorId,
        name: impl Into<String>,
        change_id: ChangeId,
        change: Change,
    ) -> Self {
        Self {
            source_id: String::new(),
            key,
            entity_name: entity_name.into(),
            name: name.into(),
            change_id,
            changes: vec![change],
            is_overwriting: false,
        }
    }

    /// Empty envelope that only signals a caught-up subscription.
    pub fn sync_marker(sub: &ActorViewSub, change_id: ChangeId, source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            key: sub.id.clone(),
            entity_name: sub.entity_name.clone(),
            name: sub.view_name.clone(),
            change_id,
            changes: Vec::new(),
            is_overwriting: false,
        }
    }

    /// Set the originator.
    pub fn from_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    /// True for envelopes without changes.
    pub fn is_sync_marker(&self) -> bool {
        self.changes.is_empty()
    }

    /// Change log this envelope belongs to.
    pub fn view_key(&self) -> ViewKey {
        ViewKey::new(self.entity_name.clone(), self.key.clone(), self.name.clone())
    }

    /// Changes that must be projected, honouring `is_overwriting`.
    pub fn effective_changes(&self) -> &[Change] {
        match (self.is_overwriting, self.changes.split_last()) {
            (true, Some((last, _))) => std::slice::from_ref(last),
            _ => &self.changes,
        }
    }

    /// Decode from the wire.
    pub fn from_wire(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(changes: Vec<Change>, is_overwriting: bool) -> ChangeEnvelope {
        ChangeEnvelope {
            source_id: "server".into(),
            key: "u1".into(),
            entity_name: "User".into(),
            name: "visits".into(),
            change_id: "3".parse().unwrap(),
            changes,
            is_overwriting,
        }
    }

    #[test]
    fn overwriting_keeps_only_last_change() {
        let changes = vec![Change::Incremented { by: 1 }, Change::Reset { value: 10 }];
        let env = envelope(changes.clone(), true);
        assert_eq!(env.effective_changes(), &changes[1..]);

        let env = envelope(changes.clone(), false);
        assert_eq!(env.effective_changes(), &changes[..]);
    }

    #[test]
    fn sync_marker_has_no_changes() {
        let sub = ActorViewSub::new("User", "u1".into(), "name");
        let marker = ChangeEnvelope::sync_marker(&sub, ChangeId::min(), "local");
        assert!(marker.is_sync_marker());
        assert_eq!(marker.view_key(), sub.view_key());
        assert!(marker.effective_changes().is_empty());
    }

    #[test]
    fn envelope_decodes_from_wire() {
        let raw = r#"{"sourceId":"s1","key":"u1","entityName":"User","name":"friends",
            "changeId":"9:1","changes":[{"type":"pageItemAdded","pageId":"p","key":"b","value":"u3"}]}"#;
        let env = ChangeEnvelope::from_wire(raw).unwrap();
        assert!(!env.is_overwriting);
        assert_eq!(env.changes[0].kind(), ChangeKind::PageItemAdded);
        assert_eq!(env.changes[0].page_id(), Some("p"));
    }
}
