//! Edge attribute hosts
//!
//! Attributes describe a relationship rather than either endpoint, such as
//! the date a friendship started. They live on a synthetic edge entity named
//! `owner.view` whose id is the composite `owner:target`, and are hosted by a
//! plain query host over that entity. Every operation is a no-op when the view
//! requested no attributes.

use super::query::{HostParent, QueryHost};
use crate::system::SystemCore;
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_core::{ActorId, ActorViewSub, QueryDef, QueryResult, Result, TetherError};

/// Hosts the attribute views of one reference or list-item edge.
#[derive(Debug, Clone)]
pub struct AttributesHost {
    host: Option<QueryHost>,
}

impl AttributesHost {
    pub(crate) fn new(system: &Arc<SystemCore>, query: Option<Arc<QueryDef>>) -> Self {
        Self {
            host: query.map(|query| QueryHost::new(system.clone(), query, HostParent::None)),
        }
    }

    /// True when no attributes were requested.
    pub fn is_empty(&self) -> bool {
        self.host.is_none()
    }

    /// Underlying query host over the edge entity.
    pub fn host(&self) -> Option<&QueryHost> {
        self.host.as_ref()
    }

    /// Composite id of the bound edge.
    pub fn edge_id(&self) -> Option<ActorId> {
        self.host.as_ref().and_then(QueryHost::actor_id)
    }

    /// Current value of attribute `name`.
    pub fn value(&self, name: &str) -> Option<serde_json::Value> {
        let view = self.host.as_ref()?.view(name).ok()?;
        view.value()?.as_json().cloned()
    }

    /// Every attribute with a value.
    pub fn values(&self) -> BTreeMap<String, serde_json::Value> {
        let Some(host) = &self.host else {
            return BTreeMap::new();
        };
        host.views()
            .into_iter()
            .filter_map(|view| {
                let value = view.value()?.as_json().cloned()?;
                Some((view.name().to_string(), value))
            })
            .collect()
    }

    pub(crate) fn attach(&self, edge_id: &ActorId, result: Option<&QueryResult>) -> Result<()> {
        let Some(host) = &self.host else {
            return Ok(());
        };
        let result = result.ok_or_else(|| {
            TetherError::protocol_mismatch(format!(
                "result lacks attributes for edge {edge_id} of {}",
                host.query().entity_name
            ))
        })?;
        host.attach(edge_id, result)
    }

    pub(crate) async fn start(&self, edge_id: &ActorId) {
        let Some(host) = &self.host else {
            return;
        };
        if let Err(err) = host.run(edge_id.clone()).await {
            tracing::error!(edge = %edge_id, error = %err, "Edge attributes failed to load");
        }
    }

    pub(crate) async fn stop(&self) {
        let Some(host) = &self.host else {
            return;
        };
        if host.actor_id().is_some() {
            host.release_subscriptions().await;
            host.detach();
        }
    }

    pub(crate) fn detach(&self) {
        if let Some(host) = &self.host {
            host.detach();
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Some(host) = &self.host {
            host.stop();
        }
    }

    pub(crate) fn subscriptions(&self) -> Vec<ActorViewSub> {
        self.host
            .as_ref()
            .map(QueryHost::subscriptions)
            .unwrap_or_default()
    }

    pub(crate) fn drain(&self) -> BoxFuture<'static, ()> {
        match &self.host {
            Some(host) => host.drain_tree(),
            None => async {}.boxed(),
        }
    }
}
