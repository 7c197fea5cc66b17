use aws_sdk_dynamodb::operation;
use aws_sdk_dynamodb::types::AttributeValue;
use serde_dynamo::{from_attribute_value, from_items};
use std::{collections::HashMap, fmt, time::Duration};

use crate::Error;
use crate::table::DynamoTable;
use crate::table::helpers::{batch_processor, capacity, retry_config};

/// Partition key type alias
pub type PartitionKey<PK> = PK;

/// Sort key type alias
pub type SortKey<SK> = Option<SK>;

/// Composite key type alias
pub type CompositeKey<PK, SK> = (PK, SortKey<SK>);

/// Kind of write carried by a batch request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchOperationType {
    /// Insert or replace whole items
    Put,
    /// Remove items by key
    Delete,
}

impl BatchOperationType {
    /// Name used for metrics and logs (`batch_put` / `batch_delete`)
    pub fn operation_name(self) -> &'static str {
        match self {
            BatchOperationType::Put => "batch_put",
            BatchOperationType::Delete => "batch_delete",
        }
    }
}

impl fmt::Display for BatchOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOperationType::Put => f.write_str("put"),
            BatchOperationType::Delete => f.write_str("delete"),
        }
    }
}

/// Delay growth between batch attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * 2^(attempt - 1)`
    Exponential,
}

/// Retry policy for batch operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: usize,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// How the delay grows with the attempt number
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Three attempts, linear backoff from one second
    pub const DEFAULT: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1000),
        max_delay: Duration::from_secs(30),
        backoff: Backoff::Linear,
    };

    /// Single attempt, never sleeps
    pub const NO_RETRY: RetryPolicy = RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff: Backoff::Linear,
    };

    /// Set the attempt ceiling
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the backoff shape
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay to wait after `attempt` (1-based) failed
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear => retry_config::linear_delay(attempt, self.base_delay, self.max_delay),
            Backoff::Exponential => {
                retry_config::retry_delay(attempt - 1, self.base_delay, self.max_delay)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Request ceilings and fan-out used by the batch executor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimits {
    /// Items per write request
    pub write_chunk_size: usize,
    /// Keys per read request
    pub read_chunk_size: usize,
    /// Read requests in flight at once
    pub max_concurrency: usize,
    /// Per-chunk read timeout; `None` waits indefinitely
    pub read_timeout: Option<Duration>,
}

impl BatchLimits {
    /// Derive the write chunk size from an estimated item size in bytes
    pub fn for_item_size(estimated_item_size_bytes: i64) -> Self {
        Self {
            write_chunk_size: capacity::optimal_batch_size(
                estimated_item_size_bytes,
                batch_processor::BATCH_WRITE_SIZE,
            ),
            ..Self::default()
        }
    }

    /// Set the per-chunk read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            write_chunk_size: batch_processor::BATCH_WRITE_SIZE,
            read_chunk_size: batch_processor::BATCH_READ_SIZE,
            max_concurrency: batch_processor::DEFAULT_CONCURRENCY,
            read_timeout: None,
        }
    }
}

/// Outcome of a retried batch write
///
/// `processed_items` and `unprocessed_items` together hold every input item
/// exactly once. Leftover unprocessed items are a partial success, not an error.
#[must_use = "batch write results contain unprocessed items that should be checked"]
#[derive(Clone, Debug)]
pub struct BatchWriteResult<T> {
    /// Items the store applied
    pub processed_items: Vec<T>,
    /// Items still unapplied when the retry loop ended
    pub unprocessed_items: Vec<T>,
    /// Capacity units reported across all attempts
    pub consumed_capacity_units: f64,
    /// Attempts made (0 for empty input)
    pub attempts: usize,
    /// Total execution time including backoff
    pub total_duration: Duration,
    /// The loop stopped early because the executor was cancelled
    pub cancelled: bool,
}

impl<T> BatchWriteResult<T> {
    pub(crate) fn empty() -> Self {
        Self {
            processed_items: Vec::new(),
            unprocessed_items: Vec::new(),
            consumed_capacity_units: 0.0,
            attempts: 0,
            total_duration: Duration::ZERO,
            cancelled: false,
        }
    }

    /// True when some items were never applied
    pub fn has_unprocessed_items(&self) -> bool {
        !self.unprocessed_items.is_empty()
    }

    /// Check if all operations were successful
    pub fn is_success(&self) -> bool {
        self.unprocessed_items.is_empty()
    }

    /// Number of applied items
    pub fn success_count(&self) -> usize {
        self.processed_items.len()
    }

    /// Number of unapplied items
    pub fn failure_count(&self) -> usize {
        self.unprocessed_items.len()
    }

    /// Get success rate as a percentage (0.0 to 100.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count() + self.failure_count();
        if total == 0 {
            return 100.0;
        }
        (self.success_count() as f64 / total as f64) * 100.0
    }
}

/// Outcome of a parallel batch read
#[must_use = "batch read results contain failed keys that should be checked"]
#[derive(Clone, Debug)]
pub struct BatchReadOutput<T, K> {
    /// Items found, in no particular order
    pub items: Vec<T>,
    /// Keys whose chunk failed or stayed unprocessed
    pub failed_keys: Vec<K>,
    /// Capacity units reported across all rounds
    pub consumed_capacity_units: f64,
    /// Read rounds issued (unprocessed keys trigger another round)
    pub rounds: usize,
    /// Total execution time
    pub total_duration: Duration,
}

impl<T, K> BatchReadOutput<T, K> {
    pub(crate) fn empty() -> Self {
        Self {
            items: Vec::new(),
            failed_keys: Vec::new(),
            consumed_capacity_units: 0.0,
            rounds: 0,
            total_duration: Duration::ZERO,
        }
    }

    /// True when every key was looked up; missing items then really are absent
    pub fn is_complete(&self) -> bool {
        self.failed_keys.is_empty()
    }

    /// Number of keys that could not be looked up
    pub fn failed_count(&self) -> usize {
        self.failed_keys.len()
    }
}

/// One page of scan results
#[must_use = "scan results should be used or you'll lose the fetched data"]
#[derive(Clone, Debug)]
pub struct OutputItems<T: DynamoTable> {
    /// The items returned by the scan
    pub items: Vec<T>,
    /// Requested page size
    pub limit: u16,
    /// Count of items returned
    pub count: i32,
    /// Items evaluated before the filter was applied
    pub scanned_count: i32,
    /// Key to resume from, when more pages exist
    pub last_evaluated_key: Option<CompositeKey<T::PK, T::SK>>,
}

impl<T: DynamoTable> Default for OutputItems<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            limit: 0,
            count: 0,
            scanned_count: 0,
            last_evaluated_key: None,
        }
    }
}

impl<T: DynamoTable> TryFrom<(operation::scan::ScanOutput, u16)> for OutputItems<T> {
    type Error = Error;

    /// The cursor is DynamoDB's own `LastEvaluatedKey`, so a page the filter
    /// emptied still carries it and resumption starts after the last row
    /// scanned, not the last row matched.
    fn try_from((output, limit): (operation::scan::ScanOutput, u16)) -> Result<Self, Error> {
        let last_evaluated_key = output
            .last_evaluated_key
            .as_ref()
            .filter(|key| !key.is_empty())
            .map(composite_key_from_attributes::<T>)
            .transpose()?;

        let items: Vec<T> = match output.items {
            Some(items) => from_items(items)?,
            None => Vec::new(),
        };

        Ok(Self {
            items,
            limit,
            count: output.count,
            scanned_count: output.scanned_count,
            last_evaluated_key,
        })
    }
}

/// Decode the key attributes of `T` from an attribute map
///
/// Used for `LastEvaluatedKey` cursors and for keys DynamoDB hands back as
/// unprocessed.
pub(crate) fn composite_key_from_attributes<T: DynamoTable>(
    attributes: &HashMap<String, AttributeValue>,
) -> Result<CompositeKey<T::PK, T::SK>, Error> {
    let partition_key = attributes.get(T::PARTITION_KEY).ok_or_else(|| {
        Error::InvalidArgument(format!(
            "key for '{}' lacks partition key '{}'",
            T::TABLE,
            T::PARTITION_KEY
        ))
    })?;
    let partition_key: T::PK = from_attribute_value(partition_key.clone())?;

    let sort_key: Option<T::SK> = T::SORT_KEY
        .and_then(|name| attributes.get(name))
        .map(|value| from_attribute_value(value.clone()))
        .transpose()?;

    Ok((partition_key, sort_key))
}
