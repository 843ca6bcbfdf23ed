//! Mock Transport
//!
//! Scriptable in-memory [`Connection`] for exercising the client without a
//! server. Query results are scripted per `(entity, id)`, every request is
//! recorded, failures can be injected per request family, and query
//! execution can be paused to hold queries in flight.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    ActorId, ActorViewSub, Command, Connection, FlowEvent, FlowResult, QueryDef, QueryResult,
    RemoteEvent, Result, TetherError,
};
use tokio::sync::watch;

/// One request received by [`MockConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCall {
    /// Fetch without subscription
    Query {
        /// Target entity type
        entity_name: String,
        /// Target entity
        actor_id: ActorId,
        /// Query name
        name: String,
    },
    /// Fetch and subscribe
    QueryAndSubscribe {
        /// Key of the requesting host
        query_key: String,
        /// Target entity type
        entity_name: String,
        /// Target entity
        actor_id: ActorId,
    },
    /// Explicit subscribe
    SubscribeViews(Vec<ActorViewSub>),
    /// Explicit unsubscribe
    UnsubscribeViews {
        /// Key of the releasing host
        query_key: String,
        /// Released views
        subs: Vec<ActorViewSub>,
    },
    /// Fire-and-forget command
    Send {
        /// Target entity type
        entity_name: String,
        /// Target entity
        id: ActorId,
        /// Sent command
        command: Command,
    },
    /// Command round trip
    Call {
        /// Target entity type
        entity_name: String,
        /// Target entity
        id: ActorId,
        /// Sent command
        command: Command,
    },
    /// Business process dispatch
    DispatchEvent(FlowEvent),
}

#[derive(Debug, Default, Clone, Copy)]
struct Failures {
    queries: bool,
    subscribe: bool,
    unsubscribe: bool,
}

/// In-memory transport with scripted answers.
pub struct MockConnection {
    results: Mutex<HashMap<(String, ActorId), QueryResult>>,
    calls: Mutex<Vec<ConnectionCall>>,
    failures: Mutex<Failures>,
    call_replies: Mutex<VecDeque<Result<RemoteEvent>>>,
    flow_replies: Mutex<VecDeque<Result<FlowResult>>>,
    reply_delay: Mutex<Option<Duration>>,
    gate: watch::Sender<bool>,
}

impl Default for MockConnection {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            results: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Failures::default()),
            call_replies: Mutex::new(VecDeque::new()),
            flow_replies: Mutex::new(VecDeque::new()),
            reply_delay: Mutex::new(None),
            gate,
        }
    }
}

impl MockConnection {
    /// Create a shareable mock.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer queries on `(entity_name, id)` with `result`.
    pub fn respond(&self, entity_name: &str, id: impl Into<ActorId>, result: QueryResult) {
        self.results
            .lock()
            .insert((entity_name.to_string(), id.into()), result);
    }

    /// Fail every query with a transport error.
    pub fn fail_queries(&self, fail: bool) {
        self.failures.lock().queries = fail;
    }

    /// Fail explicit subscribe requests.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.failures.lock().subscribe = fail;
    }

    /// Fail unsubscribe requests.
    pub fn fail_unsubscriptions(&self, fail: bool) {
        self.failures.lock().unsubscribe = fail;
    }

    /// Hold every query until [`resume_queries`](Self::resume_queries).
    pub fn pause_queries(&self) {
        self.gate.send_replace(false);
    }

    /// Release held queries.
    pub fn resume_queries(&self) {
        self.gate.send_replace(true);
    }

    /// Queue the answer to the next `call`.
    pub fn reply_to_call(&self, reply: Result<RemoteEvent>) {
        self.call_replies.lock().push_back(reply);
    }

    /// Queue the answer to the next `dispatch_event`.
    pub fn reply_to_dispatch(&self, reply: Result<FlowResult>) {
        self.flow_replies.lock().push_back(reply);
    }

    /// Delay `call` and `dispatch_event` answers.
    pub fn delay_replies(&self, delay: Duration) {
        *self.reply_delay.lock() = Some(delay);
    }

    /// Every recorded request, oldest first.
    pub fn calls(&self) -> Vec<ConnectionCall> {
        self.calls.lock().clone()
    }

    /// Forget recorded requests.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of query-and-subscribe requests.
    pub fn query_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, ConnectionCall::QueryAndSubscribe { .. }))
            .count()
    }

    /// Views of every explicit subscribe request.
    pub fn subscribe_calls(&self) -> Vec<Vec<ActorViewSub>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ConnectionCall::SubscribeViews(subs) => Some(subs.clone()),
                _ => None,
            })
            .collect()
    }

    /// Views of every unsubscribe request.
    pub fn unsubscribe_calls(&self) -> Vec<Vec<ActorViewSub>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ConnectionCall::UnsubscribeViews { subs, .. } => Some(subs.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ConnectionCall) {
        self.calls.lock().push(call);
    }

    async fn wait_for_gate(&self) {
        tokio::task::yield_now().await;
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }

    async fn delay(&self) {
        let delay = *self.reply_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn scripted(&self, def: &QueryDef, actor_id: &ActorId) -> Result<QueryResult> {
        if self.failures.lock().queries {
            return Err(TetherError::transport("query failed"));
        }
        self.results
            .lock()
            .get(&(def.entity_name.clone(), actor_id.clone()))
            .cloned()
            .ok_or_else(|| {
                TetherError::transport(format!(
                    "no scripted result for {}/{actor_id}",
                    def.entity_name
                ))
            })
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, actor_id: &ActorId, name: &str, def: &QueryDef) -> Result<QueryResult> {
        self.record(ConnectionCall::Query {
            entity_name: def.entity_name.clone(),
            actor_id: actor_id.clone(),
            name: name.to_string(),
        });
        self.wait_for_gate().await;
        self.scripted(def, actor_id)
    }

    async fn query_and_subscribe(
        &self,
        query_key: &str,
        actor_id: &ActorId,
        def: &QueryDef,
    ) -> Result<QueryResult> {
        self.record(ConnectionCall::QueryAndSubscribe {
            query_key: query_key.to_string(),
            entity_name: def.entity_name.clone(),
            actor_id: actor_id.clone(),
        });
        tracing::trace!(entity = %def.entity_name, actor = %actor_id, "Mock query");
        self.wait_for_gate().await;
        self.scripted(def, actor_id)
    }

    async fn subscribe_views(&self, subs: &[ActorViewSub]) -> Result<()> {
        self.record(ConnectionCall::SubscribeViews(subs.to_vec()));
        if self.failures.lock().subscribe {
            return Err(TetherError::transport("subscribe failed"));
        }
        Ok(())
    }

    async fn unsubscribe_views(&self, query_key: &str, subs: &[ActorViewSub]) -> Result<()> {
        self.record(ConnectionCall::UnsubscribeViews {
            query_key: query_key.to_string(),
            subs: subs.to_vec(),
        });
        if self.failures.lock().unsubscribe {
            return Err(TetherError::transport("unsubscribe failed"));
        }
        Ok(())
    }

    async fn send(&self, entity_name: &str, id: &ActorId, command: &Command) -> Result<()> {
        self.record(ConnectionCall::Send {
            entity_name: entity_name.to_string(),
            id: id.clone(),
            command: command.clone(),
        });
        Ok(())
    }

    async fn call(
        &self,
        entity_name: &str,
        id: &ActorId,
        command: &Command,
        _timeout: Duration,
    ) -> Result<RemoteEvent> {
        self.record(ConnectionCall::Call {
            entity_name: entity_name.to_string(),
            id: id.clone(),
            command: command.clone(),
        });
        self.delay().await;
        let scripted = self.call_replies.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(RemoteEvent {
                entity_name: entity_name.to_string(),
                id: id.clone(),
                name: command.name.clone(),
                payload: serde_json::Value::Null,
            })
        })
    }

    async fn dispatch_event(&self, event: &FlowEvent, _timeout: Duration) -> Result<FlowResult> {
        self.record(ConnectionCall::DispatchEvent(event.clone()));
        self.delay().await;
        let scripted = self.flow_replies.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(FlowResult {
                flow_id: format!("flow-{}", event.name),
                payload: serde_json::Value::Null,
            })
        })
    }
}
