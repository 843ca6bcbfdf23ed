//! Shared setup for client integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use tether_client::System;
use tether_testkit::{init_tracing, MockConnection};

/// Fresh system over a fresh mock transport.
pub fn setup() -> (Arc<MockConnection>, System) {
    init_tracing();
    let mock = MockConnection::new();
    let system = System::with_defaults(mock.clone());
    (mock, system)
}

/// Give spawned tasks a chance to run up to their next suspension point.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
