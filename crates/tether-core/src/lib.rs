//! # Tether Core
//!
//! Data model and transport contract for the Tether reactive query engine.
//!
//! A consumer describes the entity fields it needs as a [`QueryDef`]; the
//! server answers with a [`QueryResult`] of the same shape and then streams
//! [`ChangeEnvelope`]s that keep every subscribed view current. This crate
//! holds those types, the [`ChangeId`] version token that orders them, and
//! the [`Connection`] trait the runtime in `tether-client` drives. It has no
//! runtime state of its own.

pub mod change;
pub mod change_id;
pub mod config;
pub mod connection;
pub mod errors;
pub mod identifiers;
pub mod messages;
pub mod query;
pub mod value;

pub use change::{Change, ChangeEnvelope, ChangeKind};
pub use change_id::ChangeId;
pub use config::ClientConfig;
pub use connection::Connection;
pub use errors::{Result, TetherError};
pub use identifiers::{edge_entity_name, ActorId, ActorViewSub, ViewKey};
pub use messages::{Command, ConnectionState, FlowEvent, FlowResult, Notification, RemoteEvent};
pub use query::{
    ListQueryResult, PageCursor, QueryDef, QueryResult, RefQueryResult, ValueQueryResult,
    ViewQueryDef, ViewQueryKind, ViewQueryResult,
};
pub use value::{ListItem, ViewValue};
