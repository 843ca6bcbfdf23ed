//! Transport contract
//!
//! The engine never touches sockets. Everything it needs from the network is
//! expressed by [`Connection`]; inbound pushes arrive separately as
//! [`Notification`](crate::messages::Notification)s handed to the client.

use crate::errors::Result;
use crate::identifiers::{ActorId, ActorViewSub};
use crate::messages::{Command, FlowEvent, FlowResult, RemoteEvent};
use crate::query::{QueryDef, QueryResult};
use async_trait::async_trait;
use std::time::Duration;

/// Request/response side of the transport.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Fetch a query without subscribing.
    async fn query(&self, actor_id: &ActorId, name: &str, def: &QueryDef) -> Result<QueryResult>;

    /// Fetch a query and subscribe to every view it touches in one round trip.
    async fn query_and_subscribe(
        &self,
        query_key: &str,
        actor_id: &ActorId,
        def: &QueryDef,
    ) -> Result<QueryResult>;

    /// Start live subscriptions.
    async fn subscribe_views(&self, subs: &[ActorViewSub]) -> Result<()>;

    /// Stop live subscriptions.
    async fn unsubscribe_views(&self, query_key: &str, subs: &[ActorViewSub]) -> Result<()>;

    /// Fire-and-forget entity command.
    async fn send(&self, entity_name: &str, id: &ActorId, command: &Command) -> Result<()>;

    /// Entity command awaiting the resulting event.
    async fn call(
        &self,
        entity_name: &str,
        id: &ActorId,
        command: &Command,
        timeout: Duration,
    ) -> Result<RemoteEvent>;

    /// Trigger a server-side business process.
    async fn dispatch_event(&self, event: &FlowEvent, timeout: Duration) -> Result<FlowResult>;
}
