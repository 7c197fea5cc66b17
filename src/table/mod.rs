mod batch;
mod helpers;
mod operations;
mod store;
mod types;

pub use batch::{BatchExecutor, Sleeper, TokioSleeper};
pub use helpers::keys::{
    MAX_KEY_LENGTH, SORT_KEY_SEPARATOR, compose_sort_key, is_reserved_word, is_valid_key,
};
pub use helpers::capacity::{MAX_BATCH_PAYLOAD_BYTES, PAYLOAD_SAFETY_FACTOR, optimal_batch_size};
pub use helpers::partition::partition;
pub use operations::*;
pub use store::{BatchStore, ChunkReadOutput, ChunkWriteOutput, DynamoDbStore};
pub use types::{
    Backoff, BatchLimits, BatchOperationType, BatchReadOutput, BatchWriteResult, CompositeKey,
    OutputItems, PartitionKey, RetryPolicy, SortKey,
};
