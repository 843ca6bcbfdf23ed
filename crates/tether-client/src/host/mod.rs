//! # Query and View Hosts
//!
//! A [`QueryHost`] binds a [`QueryDef`](tether_core::QueryDef) to one entity
//! and owns a [`ViewHost`] per requested view. Reference and list views own
//! child query hosts for the entities they point at, so a bound root host
//! mirrors the entity graph its query describes.
//!
//! ## Loading
//!
//! A query host is `Loaded` once every view it owns reports ready. A view is
//! ready after it has projected its first live delivery (the server's initial
//! envelope or a synthesized sync marker) and every child it waits on has
//! loaded. Views fetched without a subscription are ready as soon as their
//! children are.
//!
//! ## Lifecycle
//!
//! - `run` fetches and subscribes, then attaches the result
//! - `attach` binds to a pre-fetched result without network I/O
//! - `detach` unbinds but keeps the host reusable
//! - `stop` is terminal

mod attributes;
mod projection;
mod query;
mod view;
mod watch;

pub use attributes::AttributesHost;
pub use query::QueryHost;
pub use view::ViewHost;
pub use watch::{WatchCallback, WatchId, WatchPath};

pub(crate) use query::{HostParent, QueryHostInner};

use std::sync::Arc;
use tether_core::{ActorId, Change, TetherError, ViewValue};

/// Load state of a [`QueryHost`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueryState {
    /// Not bound, or bound and still loading
    #[default]
    Created,
    /// Every view has reported ready
    Loaded,
    /// The last fetch or attach failed
    Error(TetherError),
    /// Terminal; the host can no longer be used
    Stopped,
}

impl QueryState {
    /// True once the state can no longer move on its own.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Created)
    }
}

/// Delta applied to a view, handed to change handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Entity the view belongs to
    pub actor_id: ActorId,
    /// View name
    pub view_name: String,
    /// Applied change
    pub change: Change,
    /// Value before the change
    pub previous: ViewValue,
    /// Value after the change
    pub next: ViewValue,
}

/// Callback run after a change of a given kind is applied.
pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Registration handle for a [`ChangeHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}
