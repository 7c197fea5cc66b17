//! Test helpers and fixtures for batch executor integration tests
//!
//! This module provides the scripted store, sleepers and data builders used
//! across the integration tests. No DynamoDB endpoint is needed.
#![allow(dead_code)]

pub mod fixtures;

pub use dynamo_batch::table::DynamoTable;
pub use serde::{Deserialize, Serialize};

pub use fixtures::*;

/// Install a fmt subscriber writing through the test harness (idempotent)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
