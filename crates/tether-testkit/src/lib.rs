//! # Tether Testkit
//!
//! Shared test support: a scriptable [`MockConnection`], builders for query
//! results and notifications, and tracing setup for tests.

pub mod connection;
pub mod fixtures;

pub use connection::{ConnectionCall, MockConnection};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
