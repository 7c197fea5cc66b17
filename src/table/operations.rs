use aws_sdk_dynamodb::operation::put_item::PutItemOutput;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnConsumedCapacity, ReturnValue, Select};
use serde::{Serialize, de::DeserializeOwned};
use serde_dynamo::to_item;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tracing::debug;

use crate::error::Error;
use crate::expression::{self, BooleanOperator, Expression};
use crate::table::batch::BatchExecutor;
use crate::table::helpers::keys;
use crate::table::store::DynamoDbStore;
use crate::table::types::{
    BatchReadOutput, BatchWriteResult, CompositeKey, OutputItems, RetryPolicy,
};

/// A serde record stored in one DynamoDB table
///
/// Implementors name the table and its key schema; the batch and scan
/// conveniences below then work off the global client.
pub trait DynamoTable: Serialize + DeserializeOwned + Send + Sync {
    /// Associated partition key type
    type PK: fmt::Display + Clone + Send + Sync + fmt::Debug + DeserializeOwned;

    /// Associated sort key type
    type SK: fmt::Display + Clone + Send + Sync + fmt::Debug + DeserializeOwned;

    /// Name of the table
    const TABLE: &'static str;

    /// Partition key attribute
    const PARTITION_KEY: &'static str;

    /// Sort key attribute, when the table has one
    const SORT_KEY: Option<&'static str> = None;

    /// Default page size for scans
    const DEFAULT_PAGE_SIZE: u16 = 10;

    /// Retry policy used by `batch_upsert`, `batch_delete` and `batch_get`
    const BATCH_RETRY_POLICY: RetryPolicy = RetryPolicy::DEFAULT;

    /// Boolean soft-delete flag; scans hide flagged items when set
    const SOFT_DELETE_FIELD: Option<&'static str> = None;

    /// Partition key value
    fn partition_key(&self) -> Self::PK;

    /// Sort key value
    fn sort_key(&self) -> Option<Self::SK> {
        None
    }

    /// Full primary key
    fn composite_key(&self) -> CompositeKey<Self::PK, Self::SK> {
        (self.partition_key(), self.sort_key())
    }

    /// Get the DynamoDB client for this table
    ///
    /// By default, returns the global client. Can be overridden to use a
    /// different client per table.
    fn dynamodb_client() -> impl Future<Output = &'static aws_sdk_dynamodb::Client> {
        crate::dynamodb_client()
    }

    /// Put many items, resubmitting unprocessed ones
    ///
    /// Writes 25 items per request and retries leftovers under
    /// [`BATCH_RETRY_POLICY`](Self::BATCH_RETRY_POLICY). Items still unwritten
    /// afterwards are returned in the result, not as an error.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use dynamo_batch::{DynamoTable, Error};
    /// # use serde::{Deserialize, Serialize};
    /// #
    /// # #[derive(Debug, Clone, Serialize, Deserialize)]
    /// # struct Visit {
    /// #     visit_id: String,
    /// #     city: String,
    /// # }
    /// #
    /// # impl DynamoTable for Visit {
    /// #     type PK = String;
    /// #     type SK = String;
    /// #     const TABLE: &'static str = "visits";
    /// #     const PARTITION_KEY: &'static str = "visit_id";
    /// #     fn partition_key(&self) -> Self::PK { self.visit_id.clone() }
    /// # }
    ///
    /// async fn example() -> Result<(), Error> {
    ///     let visits = vec![
    ///         Visit { visit_id: "1".to_string(), city: "Seoul".to_string() },
    ///         Visit { visit_id: "2".to_string(), city: "Busan".to_string() },
    ///     ];
    ///
    ///     let result = Visit::batch_upsert(visits).await?;
    ///     if result.has_unprocessed_items() {
    ///         println!("{} visits still pending", result.failure_count());
    ///     }
    ///     Ok(())
    /// }
    /// ```
    fn batch_upsert(
        items: Vec<Self>,
    ) -> impl Future<Output = Result<BatchWriteResult<Self>, Error>> {
        batch_upsert::<Self>(items)
    }

    /// Delete many items by their keys, resubmitting unprocessed ones
    fn batch_delete(
        items: Vec<Self>,
    ) -> impl Future<Output = Result<BatchWriteResult<Self>, Error>> {
        batch_delete::<Self>(items)
    }

    /// Fetch many items by key, 100 keys per request, requests in parallel
    ///
    /// Keys whose request failed are listed in
    /// [`BatchReadOutput::failed_keys`]; a key absent from both `items` and
    /// `failed_keys` does not exist in the table.
    fn batch_get(
        keys: Vec<CompositeKey<Self::PK, Self::SK>>,
    ) -> impl Future<Output = Result<BatchReadOutput<Self, CompositeKey<Self::PK, Self::SK>>, Error>> {
        batch_get::<Self>(keys)
    }

    /// Scan one page, optionally narrowed by a filter expression
    fn scan_items_with_filter(
        limit: Option<u16>,
        exclusive_start_key: Option<CompositeKey<Self::PK, Self::SK>>,
        filter: Option<Expression>,
    ) -> impl Future<Output = Result<OutputItems<Self>, Error>> {
        scan_items_with_filter::<Self>(limit, exclusive_start_key, filter)
    }

    /// Put this item only if `condition` holds for the stored one
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use dynamo_batch::{DynamoTable, Error, expression};
    /// # use serde::{Deserialize, Serialize};
    /// #
    /// # #[derive(Debug, Clone, Serialize, Deserialize)]
    /// # struct Plan {
    /// #     plan_id: String,
    /// #     version: i64,
    /// # }
    /// #
    /// # impl DynamoTable for Plan {
    /// #     type PK = String;
    /// #     type SK = String;
    /// #     const TABLE: &'static str = "plans";
    /// #     const PARTITION_KEY: &'static str = "plan_id";
    /// #     fn partition_key(&self) -> Self::PK { self.plan_id.clone() }
    /// # }
    ///
    /// async fn bump(mut plan: Plan) -> Result<(), Error> {
    ///     let guard = expression::optimistic_lock("version", plan.version);
    ///     plan.version += 1;
    ///
    ///     match plan.put_item_with_condition(guard).await {
    ///         Err(e) if e.is_conditional_check_failed() => {
    ///             println!("plan was modified concurrently");
    ///             Ok(())
    ///         }
    ///         other => other.map(|_| ()),
    ///     }
    /// }
    /// ```
    fn put_item_with_condition(
        &self,
        condition: Expression,
    ) -> impl Future<Output = Result<PutItemOutput, Error>> {
        put_item_with_condition(self, condition)
    }
}

/// Put `items` into `T::TABLE` with the table's retry policy
pub async fn batch_upsert<T>(items: Vec<T>) -> Result<BatchWriteResult<T>, Error>
where
    T: DynamoTable,
{
    keys::validate_table_keys::<T>()?;
    keys::validate_item_keys(&items)?;
    table_executor::<T>().await.put_all(items).await
}

/// Delete `items` from `T::TABLE` with the table's retry policy
pub async fn batch_delete<T>(items: Vec<T>) -> Result<BatchWriteResult<T>, Error>
where
    T: DynamoTable,
{
    keys::validate_table_keys::<T>()?;
    keys::validate_item_keys(&items)?;
    table_executor::<T>().await.delete_all(items).await
}

/// Fetch `keys` from `T::TABLE` in parallel chunks
pub async fn batch_get<T>(
    keys: Vec<CompositeKey<T::PK, T::SK>>,
) -> Result<BatchReadOutput<T, CompositeKey<T::PK, T::SK>>, Error>
where
    T: DynamoTable,
{
    validate_keys::<T>(&keys)?;
    table_executor::<T>().await.get_parallel(keys).await
}

/// Reject malformed key values before any request is sent
pub(crate) fn validate_keys<T>(composite_keys: &[CompositeKey<T::PK, T::SK>]) -> Result<(), Error>
where
    T: DynamoTable,
{
    keys::validate_table_keys::<T>()?;
    composite_keys.iter().try_for_each(|(partition_key, sort_key)| {
        keys::validate_key_values::<T>(partition_key, sort_key.as_ref())
    })
}

async fn table_executor<T>() -> BatchExecutor<DynamoDbStore<T>>
where
    T: DynamoTable,
{
    let client = T::dynamodb_client().await.clone();
    BatchExecutor::new(DynamoDbStore::new(client)).with_policy(T::BATCH_RETRY_POLICY)
}

/// Filter applied to every scan of `T`: `filter` plus the soft-delete guard
pub(crate) fn scan_filter<T>(filter: Option<Expression>) -> Option<Expression>
where
    T: DynamoTable,
{
    let guard = T::SOFT_DELETE_FIELD.map(expression::not_deleted);
    expression::combine([filter, guard], BooleanOperator::And)
}

/// Scan one page of `T::TABLE`
///
/// A zero `limit` returns an empty page without calling DynamoDB. The filter is
/// validated before the request is sent.
pub async fn scan_items_with_filter<T>(
    limit: Option<u16>,
    exclusive_start_key: Option<CompositeKey<T::PK, T::SK>>,
    filter: Option<Expression>,
) -> Result<OutputItems<T>, Error>
where
    T: DynamoTable,
{
    keys::validate_table_keys::<T>()?;

    if limit.map(|l| l == 0).unwrap_or(false) {
        return Ok(OutputItems::default());
    }

    let limit = limit.unwrap_or(T::DEFAULT_PAGE_SIZE);

    let mut builder = T::dynamodb_client()
        .await
        .scan()
        .table_name(T::TABLE)
        .select(Select::AllAttributes)
        .set_return_consumed_capacity(None)
        .limit(limit as i32);

    if let Some((partition_key, sort_key)) = exclusive_start_key {
        builder = builder.exclusive_start_key(
            T::PARTITION_KEY,
            AttributeValue::S(partition_key.to_string()),
        );

        if let (Some(sort_key_field), Some(sort_value)) = (T::SORT_KEY, sort_key) {
            builder = builder
                .exclusive_start_key(sort_key_field, AttributeValue::S(sort_value.to_string()));
        }
    }

    if let Some(filter) = scan_filter::<T>(filter) {
        filter.validate()?;
        debug!(table = T::TABLE, filter = filter.text(), "scanning with filter");

        let (text, names, values) = filter.into_parts();
        builder = builder.filter_expression(text);
        if !names.is_empty() {
            builder = builder.set_expression_attribute_names(Some(names));
        }
        if !values.is_empty() {
            builder = builder.set_expression_attribute_values(Some(values));
        }
    }

    let result = builder.send().await?;

    OutputItems::try_from((result, limit))
}

/// Put `payload` guarded by `condition`
///
/// A condition that no longer holds surfaces as an error for which
/// [`Error::is_conditional_check_failed`] is true.
pub async fn put_item_with_condition<T>(
    payload: &T,
    condition: Expression,
) -> Result<PutItemOutput, Error>
where
    T: DynamoTable,
{
    keys::validate_table_keys::<T>()?;
    keys::validate_key_values::<T>(&payload.partition_key(), payload.sort_key().as_ref())?;
    condition.validate()?;
    let item: HashMap<String, AttributeValue> = to_item(payload)?;
    let (text, names, values) = condition.into_parts();

    let mut builder = T::dynamodb_client()
        .await
        .put_item()
        .table_name(T::TABLE)
        .return_values(ReturnValue::None)
        .return_consumed_capacity(ReturnConsumedCapacity::None)
        .set_item(Some(item))
        .condition_expression(text);

    if !names.is_empty() {
        builder = builder.set_expression_attribute_names(Some(names));
    }
    if !values.is_empty() {
        builder = builder.set_expression_attribute_values(Some(values));
    }

    Ok(builder.send().await?)
}
