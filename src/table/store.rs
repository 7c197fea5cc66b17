use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::{
    AttributeValue, ConsumedCapacity, DeleteRequest, KeysAndAttributes, PutRequest,
    ReturnConsumedCapacity, WriteRequest,
};
use serde_dynamo::{from_items, to_item};
use std::{collections::HashMap, fmt, future::Future, marker::PhantomData};

use crate::Error;
use crate::table::DynamoTable;
use crate::table::helpers::batch_processor::{BATCH_READ_SIZE, BATCH_WRITE_SIZE};
use crate::table::types::{BatchOperationType, CompositeKey, composite_key_from_attributes};

/// Result of one write request against the store
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkWriteOutput {
    /// Positions, within the submitted chunk, of items the store did not apply
    pub unprocessed: Vec<usize>,
    /// Capacity units reported for the request
    pub consumed_capacity_units: f64,
}

impl ChunkWriteOutput {
    /// Every item applied
    pub fn applied(consumed_capacity_units: f64) -> Self {
        Self {
            unprocessed: Vec::new(),
            consumed_capacity_units,
        }
    }
}

/// Result of one read request against the store
#[derive(Clone, Debug)]
pub struct ChunkReadOutput<T, K> {
    /// Items found for the requested keys
    pub items: Vec<T>,
    /// Keys the store did not get to and that may be requested again
    pub unprocessed_keys: Vec<K>,
    /// Capacity units reported for the request
    pub consumed_capacity_units: f64,
}

impl<T, K> ChunkReadOutput<T, K> {
    /// All keys looked up, `items` found
    pub fn found(items: Vec<T>) -> Self {
        Self {
            items,
            unprocessed_keys: Vec::new(),
            consumed_capacity_units: 0.0,
        }
    }
}

/// Backing store for batched writes and reads of `T`
///
/// Implementations perform exactly one request per call and must respect the
/// store's ceilings for the chunk they are given; chunking and retries belong
/// to [`BatchExecutor`](crate::table::BatchExecutor). The store is shared by
/// concurrent read requests.
pub trait BatchStore<T>: Send + Sync {
    /// Key identifying one item for reads
    type Key: Clone + Send + Sync;

    /// Table or collection name used in logs and metrics
    fn resource_name(&self) -> &str;

    /// Most items one write request may carry; larger chunks are split
    fn max_write_chunk_size(&self) -> usize {
        usize::MAX
    }

    /// Most keys one read request may carry; larger chunks are split
    fn max_read_chunk_size(&self) -> usize {
        usize::MAX
    }

    /// Submit one batch of puts or deletes
    fn write_chunk(
        &self,
        operation: BatchOperationType,
        items: &[T],
    ) -> impl Future<Output = Result<ChunkWriteOutput, Error>> + Send;

    /// Fetch the items for one batch of keys
    fn read_chunk(
        &self,
        keys: &[Self::Key],
    ) -> impl Future<Output = Result<ChunkReadOutput<T, Self::Key>, Error>> + Send;
}

/// [`BatchStore`] over a DynamoDB table described by a [`DynamoTable`] model
pub struct DynamoDbStore<T> {
    client: Client,
    table: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DynamoTable> DynamoDbStore<T> {
    /// Store bound to `T::TABLE`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            table: T::TABLE.to_string(),
            _marker: PhantomData,
        }
    }

    /// Override the table name, e.g. for per-environment prefixes
    pub fn with_table_name(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }
}

impl<T> Clone for DynamoDbStore<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            table: self.table.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for DynamoDbStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamoDbStore")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl<T: DynamoTable> BatchStore<T> for DynamoDbStore<T> {
    type Key = CompositeKey<T::PK, T::SK>;

    fn resource_name(&self) -> &str {
        &self.table
    }

    fn max_write_chunk_size(&self) -> usize {
        BATCH_WRITE_SIZE
    }

    fn max_read_chunk_size(&self) -> usize {
        BATCH_READ_SIZE
    }

    fn write_chunk(
        &self,
        operation: BatchOperationType,
        items: &[T],
    ) -> impl Future<Output = Result<ChunkWriteOutput, Error>> + Send {
        async move {
            let requests = write_requests(operation, items)?;

            let output = self
                .client
                .batch_write_item()
                .request_items(&self.table, requests)
                .return_consumed_capacity(ReturnConsumedCapacity::Total)
                .send()
                .await?;

            let unprocessed = output
                .unprocessed_items
                .and_then(|mut tables| tables.remove(&self.table))
                .unwrap_or_default();

            Ok(ChunkWriteOutput {
                unprocessed: unprocessed_positions(items, unprocessed),
                consumed_capacity_units: capacity_units(output.consumed_capacity),
            })
        }
    }

    fn read_chunk(
        &self,
        keys: &[Self::Key],
    ) -> impl Future<Output = Result<ChunkReadOutput<T, Self::Key>, Error>> + Send {
        async move {
            let request = KeysAndAttributes::builder()
                .set_keys(Some(keys.iter().map(key_attributes::<T>).collect()))
                .build()?;

            let output = self
                .client
                .batch_get_item()
                .request_items(&self.table, request)
                .return_consumed_capacity(ReturnConsumedCapacity::Total)
                .send()
                .await?;

            let mut items = Vec::with_capacity(keys.len());
            if let Some(responses) = output.responses {
                for table_items in responses.into_values() {
                    items.extend(from_items::<_, T>(table_items)?);
                }
            }

            let mut unprocessed_keys = Vec::new();
            if let Some(unprocessed) = output.unprocessed_keys {
                for keys_attrs in unprocessed.into_values() {
                    for key_map in keys_attrs.keys {
                        unprocessed_keys.push(composite_key_from_attributes::<T>(&key_map)?);
                    }
                }
            }

            Ok(ChunkReadOutput {
                items,
                unprocessed_keys,
                consumed_capacity_units: capacity_units(output.consumed_capacity),
            })
        }
    }
}

/// Key attributes of a composite key, as DynamoDB expects them in requests
fn key_attributes<T: DynamoTable>(
    (partition_key, sort_key): &CompositeKey<T::PK, T::SK>,
) -> HashMap<String, AttributeValue> {
    let mut key = HashMap::with_capacity(2);
    let _ = key.insert(
        T::PARTITION_KEY.to_string(),
        AttributeValue::S(partition_key.to_string()),
    );
    if let (Some(name), Some(sort_key)) = (T::SORT_KEY, sort_key) {
        let _ = key.insert(name.to_string(), AttributeValue::S(sort_key.to_string()));
    }
    key
}

pub(crate) fn write_requests<T: DynamoTable>(
    operation: BatchOperationType,
    items: &[T],
) -> Result<Vec<WriteRequest>, Error> {
    items
        .iter()
        .map(|item| {
            let request = match operation {
                BatchOperationType::Put => {
                    let attributes = to_item::<_, HashMap<String, AttributeValue>>(item)?;
                    WriteRequest::builder()
                        .put_request(PutRequest::builder().set_item(Some(attributes)).build()?)
                        .build()
                }
                BatchOperationType::Delete => WriteRequest::builder()
                    .delete_request(
                        DeleteRequest::builder()
                            .set_key(Some(key_attributes::<T>(&item.composite_key())))
                            .build()?,
                    )
                    .build(),
            };
            Ok(request)
        })
        .collect()
}

/// Map unprocessed write requests back to positions in the submitted chunk
///
/// A request that cannot be matched to an item marks the whole chunk as
/// unprocessed, so no item is reported as applied without evidence.
pub(crate) fn unprocessed_positions<T: DynamoTable>(
    items: &[T],
    unprocessed: Vec<WriteRequest>,
) -> Vec<usize> {
    if unprocessed.is_empty() {
        return Vec::new();
    }

    let positions: HashMap<(String, Option<String>), usize> = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let key = (
                item.partition_key().to_string(),
                item.sort_key().map(|sk| sk.to_string()),
            );
            (key, index)
        })
        .collect();

    let mut matched = Vec::with_capacity(unprocessed.len());
    for request in unprocessed {
        let attributes = match (request.put_request, request.delete_request) {
            (Some(put), _) => put.item,
            (None, Some(delete)) => delete.key,
            (None, None) => continue,
        };

        let partition_key = attributes.get(T::PARTITION_KEY).and_then(key_string);
        let sort_key = T::SORT_KEY
            .and_then(|name| attributes.get(name))
            .and_then(key_string);

        match partition_key.and_then(|pk| positions.get(&(pk, sort_key)).copied()) {
            Some(index) => matched.push(index),
            None => {
                tracing::warn!(
                    table = T::TABLE,
                    "unprocessed request does not match any submitted item, retrying whole chunk"
                );
                return (0..items.len()).collect();
            }
        }
    }

    matched.sort_unstable();
    matched.dedup();
    matched
}

fn key_string(value: &AttributeValue) -> Option<String> {
    match value {
        AttributeValue::S(s) | AttributeValue::N(s) => Some(s.clone()),
        _ => None,
    }
}

fn capacity_units(capacities: Option<Vec<ConsumedCapacity>>) -> f64 {
    capacities
        .unwrap_or_default()
        .iter()
        .filter_map(|capacity| capacity.capacity_units)
        .sum()
}
