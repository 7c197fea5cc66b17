//! # DynamoDB Batch Operations
//!
//! Resilient batch writes and reads plus query-construction helpers for
//! DynamoDB:
//! - Order-preserving partitioning into request-sized chunks
//! - Batch sizing from an estimated item size
//! - Retried batch writes that never lose an unprocessed item
//! - Parallel batch reads with bounded concurrency
//! - Filter/condition expression builders (ranges, `IN`, text search,
//!   optimistic locking, soft deletes)
//! - Haversine distance and coarse proximity buckets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dynamo_batch::{DynamoTable, Error};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Visit {
//!     plan_id: String,
//!     seq: String,
//!     place: String,
//! }
//!
//! impl DynamoTable for Visit {
//!     type PK = String;
//!     type SK = String;
//!
//!     const TABLE: &'static str = "visits";
//!     const PARTITION_KEY: &'static str = "plan_id";
//!     const SORT_KEY: Option<&'static str> = Some("seq");
//!
//!     fn partition_key(&self) -> Self::PK {
//!         self.plan_id.clone()
//!     }
//!
//!     fn sort_key(&self) -> Option<Self::SK> {
//!         Some(self.seq.clone())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
//!     dynamo_batch::init(&config).await;
//!
//!     let visits: Vec<Visit> = (0..60)
//!         .map(|i| Visit {
//!             plan_id: "plan-1".to_string(),
//!             seq: format!("{i:03}"),
//!             place: "Gyeongbokgung".to_string(),
//!         })
//!         .collect();
//!
//!     let result = Visit::batch_upsert(visits).await?;
//!     println!(
//!         "{} written, {} pending after {} attempts",
//!         result.success_count(),
//!         result.failure_count(),
//!         result.attempts
//!     );
//!
//!     Ok(())
//! }
//! ```
//!
//! Any backend can be driven through [`BatchExecutor`] by implementing
//! [`BatchStore`].
#![deny(
    warnings,
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    deprecated,
    unknown_lints,
    unreachable_code,
    unused_mut
)]

mod error;
pub use error::Error;

/// Batch execution, stores and the table trait
pub mod table;

pub mod expression;
pub mod geo;
pub mod metrics;

pub use expression::{BooleanOperator, Expression};
pub use geo::GeoPoint;
pub use metrics::RepositoryMetrics;
pub use table::{
    BatchExecutor, BatchLimits, BatchOperationType, BatchReadOutput, BatchStore, BatchWriteResult,
    CompositeKey, DynamoDbStore, DynamoTable, RetryPolicy, optimal_batch_size, partition,
};

// Re-export aws-config types for configuration
pub use aws_config::{
    BehaviorVersion, Region, SdkConfig, defaults,
    meta::region::{ProvideRegion, RegionProviderChain},
    retry::{RetryConfig, RetryMode},
    timeout::TimeoutConfig,
};

// Re-export aws-types for advanced configuration
pub use aws_types::sdk_config::Builder as SdkConfigBuilder;

use aws_sdk_dynamodb::Client as DynamoDbClient;
use tokio::sync::OnceCell;

/// Global DynamoDB client instance
static GLOBAL_CLIENT: OnceCell<DynamoDbClient> = OnceCell::const_new();

/// Client configuration used when nothing was initialized explicitly
///
/// SDK-level retries stay adaptive with 3 attempts; they sit below the batch
/// retry loop, which only sees what the SDK gives up on.
async fn aws_config_defaults() -> SdkConfig {
    use std::time::Duration;

    let timeout_config = TimeoutConfig::builder()
        .connect_timeout(Duration::from_secs(3))
        .read_timeout(Duration::from_secs(20))
        .operation_timeout(Duration::from_secs(60))
        .build();

    let mut loader = defaults(BehaviorVersion::latest())
        .retry_config(
            RetryConfig::adaptive()
                .with_max_attempts(3)
                .with_initial_backoff(Duration::from_secs(1)),
        )
        .timeout_config(timeout_config);

    // Support LocalStack via AWS_PROFILE=localstack
    if std::env::var("AWS_PROFILE").unwrap_or_default() == "localstack" {
        loader = loader.endpoint_url("http://127.0.0.1:4566");
    }

    loader.load().await
}

/// Initialize the global DynamoDB client with a custom AWS config
///
/// Has no effect once the client exists.
///
/// ```rust,no_run
/// #[tokio::main]
/// async fn main() {
///     let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
///         .region(aws_config::Region::new("ap-northeast-2"))
///         .load()
///         .await;
///     dynamo_batch::init(&config).await;
/// }
/// ```
pub async fn init(config: &SdkConfig) {
    let _ = GLOBAL_CLIENT
        .get_or_init(|| async { DynamoDbClient::new(config) })
        .await;
}

/// Initialize the global DynamoDB client with a custom client instance
pub async fn init_with_client(client: DynamoDbClient) {
    let _ = GLOBAL_CLIENT.get_or_init(|| async { client }).await;
}

/// Get a reference to the global DynamoDB client
///
/// Initializes it on first use with adaptive retries, 3 s connect / 20 s read /
/// 60 s operation timeouts and the LocalStack endpoint when
/// `AWS_PROFILE=localstack`. Call [`init`] or [`init_with_client`] first to
/// override.
pub async fn dynamodb_client() -> &'static DynamoDbClient {
    GLOBAL_CLIENT
        .get_or_init(|| async {
            let config = aws_config_defaults().await;
            DynamoDbClient::new(&config)
        })
        .await
}
