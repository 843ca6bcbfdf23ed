//! # Tether Client
//!
//! Reactive runtime that keeps local copies of server-side entity views
//! current.
//!
//! A consumer asks a [`System`] for a root [`QueryHost`], runs it against an
//! entity, and reads values from its [`ViewHost`]s. Behind the hosts:
//!
//! - [`MessageStore`] keeps per-view change logs and fans envelopes out to
//!   the hosts listening on them
//! - [`SubscriptionRegistry`] reference-counts live view subscriptions so
//!   the transport sees one subscribe and one unsubscribe per view
//! - [`QuerySynchronizer`] holds releases back while an intersecting query
//!   is still in flight
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tether_client::System;
//! # use tether_core::{Connection, QueryDef};
//! # async fn example(connection: Arc<dyn Connection>) -> tether_core::Result<()> {
//! let system = System::with_defaults(connection);
//! let query = QueryDef::new("User")
//!     .value("name")
//!     .reference("manager", QueryDef::new("User").value("name"));
//! let host = system.root_host(query);
//! host.run("u1").await?;
//! host.wait_until_settled().await;
//! let manager = host.view("manager")?.ref_host()?;
//! println!("{:?}", manager.view("name")?.value());
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod host;
pub mod refcount;
pub mod store;
pub mod synchronizer;
pub mod system;

pub use errors::CommandError;
pub use host::{
    AttributesHost, ChangeEvent, ChangeHandler, HandlerId, QueryHost, QueryState, ViewHost,
    WatchCallback, WatchId, WatchPath,
};
pub use refcount::{Acquired, Released, SubscriptionRegistry};
pub use store::{ChangeSink, Delivery, MessageStore, StoreSubscription};
pub use synchronizer::{QuerySynchronizer, QueryTicket};
pub use system::System;
