//! # System
//!
//! Top-level coordinator of a client session. Owns the transport handle, the
//! message store, subscription reference counts and the query synchronizer,
//! and hands out root query hosts that share them.
//!
//! Inbound traffic enters through [`System::handle_notification`]; the
//! transport adapter calls it for every push it decodes.

use crate::errors::CommandError;
use crate::host::{HostParent, QueryHost, QueryHostInner};
use crate::refcount::SubscriptionRegistry;
use crate::store::MessageStore;
use crate::synchronizer::QuerySynchronizer;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_core::{
    ActorId, ActorViewSub, ChangeEnvelope, ClientConfig, Command, Connection, ConnectionState,
    FlowEvent, FlowResult, Notification, QueryDef, QueryResult, RemoteEvent, Result,
};
use tokio::sync::watch;

pub(crate) struct SystemCore {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) store: MessageStore,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) synchronizer: QuerySynchronizer,
    pub(crate) config: ClientConfig,
    roots: Mutex<Vec<Weak<QueryHostInner>>>,
    connection_state: watch::Sender<ConnectionState>,
}

impl SystemCore {
    /// Count `subs` for a query that just returned, then unblock releases
    /// waiting on it and tell already-live views they are caught up.
    pub(crate) async fn finalize_query_subscriptions(&self, query: &QueryDef, subs: &[ActorViewSub]) {
        let acquired = self.registry.acquire(subs);
        self.synchronizer.complete_query(query);
        tracing::debug!(
            entity = %query.entity_name,
            new = acquired.first.len(),
            shared = acquired.shared.len(),
            "Query subscriptions recorded"
        );
        self.publish_sync_markers(&acquired.shared).await;
    }

    pub(crate) async fn subscribe_views(&self, subs: &[ActorViewSub]) -> Result<()> {
        let acquired = self.registry.acquire(subs);
        if !acquired.first.is_empty() {
            tracing::debug!(count = acquired.first.len(), "Subscribing views");
            if let Err(err) = self.connection.subscribe_views(&acquired.first).await {
                self.registry.rollback(subs);
                tracing::warn!(error = %err, "Subscribe failed, counts rolled back");
                return Err(err);
            }
        }
        self.publish_sync_markers(&acquired.shared).await;
        Ok(())
    }

    pub(crate) async fn unsubscribe_views(&self, query_key: &str, subs: &[ActorViewSub]) -> Result<()> {
        let released = self.registry.release(subs);
        if released.dropped.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = released.dropped.len(), "Unsubscribing views");
        if let Err(err) = self.connection.unsubscribe_views(query_key, &released.dropped).await {
            self.registry.restore(&released);
            tracing::warn!(error = %err, "Unsubscribe failed, counts restored");
            return Err(err);
        }
        Ok(())
    }

    /// Count `opened` for a query whose host can no longer bind the result,
    /// then release it together with the already counted `held` so the
    /// server drops what it subscribed.
    pub(crate) async fn abandon_query(
        &self,
        query_key: &str,
        query: &QueryDef,
        opened: &[ActorViewSub],
        held: &[ActorViewSub],
    ) {
        self.registry.acquire(opened);
        self.synchronizer.complete_query(query);
        tracing::debug!(
            entity = %query.entity_name,
            opened = opened.len(),
            held = held.len(),
            "Abandoned query released"
        );
        let subs: Vec<ActorViewSub> = opened.iter().chain(held).cloned().collect();
        self.release_query(query_key, query, &subs).await;
    }

    /// Unsubscribe a host's views once no in-flight query can still count them.
    pub(crate) async fn release_query(&self, query_key: &str, query: &QueryDef, subs: &[ActorViewSub]) {
        self.synchronizer.wait_for_query(query).await;
        if let Err(err) = self.unsubscribe_views(query_key, subs).await {
            tracing::warn!(entity = %query.entity_name, error = %err, "Releasing query subscriptions failed");
        }
    }

    async fn publish_sync_markers(&self, subs: &[ActorViewSub]) {
        let mut seen = BTreeSet::new();
        for sub in subs {
            let key = sub.view_key();
            if !seen.insert(key.clone()) {
                continue;
            }
            let change_id = self.store.latest_change_id(&key).unwrap_or_default();
            let marker = ChangeEnvelope::sync_marker(sub, change_id, self.config.source_id.as_str());
            tracing::trace!(key = %key, "Synthesized sync marker");
            self.store.publish(marker).await;
        }
    }

    fn live_roots(&self) -> Vec<QueryHost> {
        let mut roots = self.roots.lock();
        roots.retain(|root| root.strong_count() > 0);
        roots
            .iter()
            .filter_map(Weak::upgrade)
            .map(QueryHost::from_inner)
            .filter(|root| !root.is_stopped())
            .collect()
    }
}

/// Client session: hands out query hosts and routes inbound notifications.
#[derive(Clone)]
pub struct System {
    core: Arc<SystemCore>,
}

impl System {
    /// Create a session over `connection`.
    pub fn new(connection: Arc<dyn Connection>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(connection, config))
    }

    /// Session over `connection` with default settings.
    pub fn with_defaults(connection: Arc<dyn Connection>) -> Self {
        Self::build(connection, ClientConfig::default())
    }

    fn build(connection: Arc<dyn Connection>, config: ClientConfig) -> Self {
        let (connection_state, _) = watch::channel(ConnectionState::Connecting);
        let core = SystemCore {
            connection,
            store: MessageStore::new(config.max_history_per_view),
            registry: SubscriptionRegistry::new(),
            synchronizer: QuerySynchronizer::new(),
            config,
            roots: Mutex::new(Vec::new()),
            connection_state,
        };
        Self {
            core: Arc::new(core),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    /// Change logs shared by every host.
    pub fn store(&self) -> &MessageStore {
        &self.core.store
    }

    /// In-flight query tracking.
    pub fn synchronizer(&self) -> &QuerySynchronizer {
        &self.core.synchronizer
    }

    /// Create an unbound root host for `query`.
    ///
    /// Root hosts are resubscribed after a reconnect for as long as the
    /// caller keeps them alive.
    pub fn root_host(&self, query: QueryDef) -> QueryHost {
        let host = QueryHost::new(self.core.clone(), Arc::new(query), HostParent::None);
        self.core.roots.lock().push(host.downgrade());
        host
    }

    /// Route one inbound notification.
    pub async fn handle_notification(&self, notification: Notification) {
        match notification {
            Notification::Welcome { user_id } => {
                tracing::debug!(user = %user_id, "Session authenticated");
                self.core
                    .connection_state
                    .send_replace(ConnectionState::Authenticated { user_id });
            }
            Notification::ViewChanged { envelope } => {
                tracing::trace!(
                    key = %envelope.view_key(),
                    change_id = %envelope.change_id,
                    "View changed"
                );
                self.core.store.publish(envelope).await;
            }
            Notification::Reconnected => self.resync().await,
        }
    }

    async fn resync(&self) {
        let roots = self.core.live_roots();
        tracing::debug!(roots = roots.len(), "Resubscribing after reconnect");
        for root in roots {
            let Some(actor_id) = root.actor_id() else {
                continue;
            };
            root.release_subscriptions().await;
            root.detach();
            if let Err(err) = root.run(actor_id.clone()).await {
                tracing::warn!(actor = %actor_id, error = %err, "Resubscribe failed");
            }
        }
    }

    /// Subscribe views outside any query host.
    pub async fn subscribe_views(&self, subs: &[ActorViewSub]) -> Result<()> {
        self.core.subscribe_views(subs).await
    }

    /// Release views subscribed with [`subscribe_views`](Self::subscribe_views).
    pub async fn unsubscribe_views(&self, query_key: &str, subs: &[ActorViewSub]) -> Result<()> {
        self.core.unsubscribe_views(query_key, subs).await
    }

    /// Holders currently counted for `sub`'s view.
    pub fn subscription_count(&self, sub: &ActorViewSub) -> usize {
        self.core.registry.count(sub)
    }

    /// One-off fetch without hosts or subscriptions.
    pub async fn query(&self, actor_id: &ActorId, name: &str, query: &QueryDef) -> Result<QueryResult> {
        self.core.connection.query(actor_id, name, query).await
    }

    /// Fire-and-forget command.
    pub async fn send(
        &self,
        entity_name: &str,
        id: &ActorId,
        command: &Command,
    ) -> std::result::Result<(), CommandError> {
        self.core
            .connection
            .send(entity_name, id, command)
            .await
            .map_err(CommandError::from)
    }

    /// Command awaiting the entity's answer.
    pub async fn call(
        &self,
        entity_name: &str,
        id: &ActorId,
        command: &Command,
    ) -> std::result::Result<RemoteEvent, CommandError> {
        let after = self.core.config.call_timeout();
        let call = self.core.connection.call(entity_name, id, command, after);
        with_timeout(&command.name, after, call).await
    }

    /// Start a server-side business process.
    pub async fn dispatch_event(
        &self,
        event: &FlowEvent,
    ) -> std::result::Result<FlowResult, CommandError> {
        let after = self.core.config.dispatch_timeout();
        let dispatch = self.core.connection.dispatch_event(event, after);
        with_timeout(&event.name, after, dispatch).await
    }

    /// Current connection status.
    pub fn connection_state(&self) -> ConnectionState {
        self.core.connection_state.borrow().clone()
    }

    /// Receiver observing connection status changes.
    pub fn connection_state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.core.connection_state.subscribe()
    }

    /// Authenticated user, once welcomed.
    pub fn user_id(&self) -> Option<String> {
        match &*self.core.connection_state.borrow() {
            ConnectionState::Authenticated { user_id } => Some(user_id.clone()),
            ConnectionState::Connecting => None,
        }
    }

    /// Stop every live root host and forget all local state.
    pub fn shutdown(&self) {
        let roots = self.core.live_roots();
        for root in &roots {
            root.stop();
        }
        self.core.roots.lock().clear();
        self.core.registry.clear();
        self.core.store.clear();
        tracing::debug!(roots = roots.len(), "System shut down");
    }
}

async fn with_timeout<T>(
    operation: &str,
    after: Duration,
    request: impl Future<Output = Result<T>>,
) -> std::result::Result<T, CommandError> {
    match tokio::time::timeout(after, request).await {
        Ok(outcome) => outcome.map_err(CommandError::from),
        Err(_) => {
            tracing::warn!(operation, ?after, "Command timed out");
            Err(CommandError::timeout(operation, after))
        }
    }
}
