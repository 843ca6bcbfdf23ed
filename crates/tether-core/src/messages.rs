//! Decoded messages exchanged with the transport outside the query protocol

use crate::change::ChangeEnvelope;
use crate::errors::Result;
use crate::identifiers::ActorId;
use serde::{Deserialize, Serialize};

/// Imperative command addressed to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name
    pub name: String,
    /// Encoded arguments
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Command {
    /// Build a command.
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Event emitted by an entity in answer to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    /// Entity type that produced the event
    pub entity_name: String,
    /// Entity id
    pub id: ActorId,
    /// Event name
    pub name: String,
    /// Encoded event data
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Event that starts a server-side business process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Event name
    pub name: String,
    /// Encoded event data
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Outcome of a dispatched business process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResult {
    /// Process instance id
    pub flow_id: String,
    /// Encoded process result
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Asynchronous notification pushed by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// Session authenticated
    #[serde(rename_all = "camelCase")]
    Welcome {
        /// Authenticated user
        user_id: String,
    },
    /// Changes for one view
    ViewChanged {
        /// Delivered changes
        envelope: ChangeEnvelope,
    },
    /// Connection re-established after a gap; every live query must resync
    Reconnected,
}

impl Notification {
    /// Decode from the wire.
    pub fn from_wire(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Connection status tracked by the client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not yet welcomed by the server
    #[default]
    Connecting,
    /// Welcomed as `user_id`
    Authenticated {
        /// Authenticated user
        user_id: String,
    },
}
