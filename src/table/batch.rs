use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::metrics::RepositoryMetrics;
use crate::table::helpers::batch_processor::BatchProcessor;
use crate::table::helpers::partition::partition;
use crate::table::store::{BatchStore, ChunkReadOutput};
use crate::table::types::{
    BatchLimits, BatchOperationType, BatchReadOutput, BatchWriteResult, RetryPolicy,
};

/// Suspension used between batch attempts
///
/// Injected so tests can drive the whole retry path without real delays.
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// [`Sleeper`] backed by the tokio timer
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Drives chunked, retried writes and parallel reads against a [`BatchStore`]
///
/// Writes run chunk by chunk; items the store leaves unprocessed (or whose
/// chunk failed in transit) are resubmitted after a backoff until the
/// [`RetryPolicy`] runs out. Reads fan out one request per chunk with at most
/// [`BatchLimits::max_concurrency`] in flight.
#[derive(Clone, Debug)]
pub struct BatchExecutor<S, Z = TokioSleeper> {
    store: S,
    policy: RetryPolicy,
    limits: BatchLimits,
    sleeper: Z,
    metrics: Option<Arc<RepositoryMetrics>>,
    cancellation: CancellationToken,
}

impl<S> BatchExecutor<S> {
    /// Executor with the default policy and DynamoDB limits
    pub fn new(store: S) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            limits: BatchLimits::default(),
            sleeper: TokioSleeper,
            metrics: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl<S, Z> BatchExecutor<S, Z> {
    /// Replace the retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the chunk sizes and read fan-out
    ///
    /// Chunk sizes above the store's own ceilings
    /// ([`BatchStore::max_write_chunk_size`], [`BatchStore::max_read_chunk_size`])
    /// are lowered to them when a call runs.
    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Record one timing per top-level call into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<RepositoryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Abort backoff waits when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Replace the sleeper used for backoff
    pub fn with_sleeper<Z2>(self, sleeper: Z2) -> BatchExecutor<S, Z2> {
        BatchExecutor {
            store: self.store,
            policy: self.policy,
            limits: self.limits,
            sleeper,
            metrics: self.metrics,
            cancellation: self.cancellation,
        }
    }

    /// The underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The active retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The active limits
    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }
}

impl<S, Z: Sleeper> BatchExecutor<S, Z> {
    /// Put every item, retrying unprocessed ones
    pub async fn put_all<T>(&self, items: Vec<T>) -> Result<BatchWriteResult<T>, Error>
    where
        S: BatchStore<T>,
        T: Send + Sync,
    {
        self.write_with_retry(BatchOperationType::Put, items).await
    }

    /// Delete every item, retrying unprocessed ones
    pub async fn delete_all<T>(&self, items: Vec<T>) -> Result<BatchWriteResult<T>, Error>
    where
        S: BatchStore<T>,
        T: Send + Sync,
    {
        self.write_with_retry(BatchOperationType::Delete, items).await
    }

    /// Write `items` in store-sized chunks, resubmitting unprocessed items
    ///
    /// Returns once everything is applied, the policy's attempts are used up or
    /// the executor is cancelled during a backoff. Items still unapplied at that
    /// point are returned in [`BatchWriteResult::unprocessed_items`]; they are not
    /// an error.
    ///
    /// Per-chunk transport failures are logged and retried. Serialization
    /// failures abort the call immediately; any other failure outside chunk
    /// handling is wrapped in [`Error::Operation`].
    pub async fn write_with_retry<T>(
        &self,
        operation: BatchOperationType,
        items: Vec<T>,
    ) -> Result<BatchWriteResult<T>, Error>
    where
        S: BatchStore<T>,
        T: Send + Sync,
    {
        if items.is_empty() {
            return Ok(BatchWriteResult::empty());
        }

        let timer = self.metrics.as_ref().map(|metrics| {
            metrics.start_operation(operation.operation_name(), self.store.resource_name())
        });

        match self.drive_writes(operation, items).await {
            Ok(result) => {
                if let Some(timer) = timer {
                    timer.record_capacity(result.consumed_capacity_units);
                    timer.record_success();
                }
                Ok(result)
            }
            Err(e) => {
                if let Some(timer) = timer {
                    timer.record_error(&e);
                }
                if e.is_serialization_error() {
                    Err(e)
                } else {
                    Err(Error::operation(operation.operation_name(), e))
                }
            }
        }
    }

    async fn drive_writes<T>(
        &self,
        operation: BatchOperationType,
        items: Vec<T>,
    ) -> Result<BatchWriteResult<T>, Error>
    where
        S: BatchStore<T>,
        T: Send + Sync,
    {
        let start_time = Instant::now();
        let table = self.store.resource_name();
        let max_attempts = self.policy.max_attempts.max(1);
        let chunk_size = self
            .limits
            .write_chunk_size
            .min(self.store.max_write_chunk_size());

        let mut result = BatchWriteResult::empty();
        result.processed_items.reserve(items.len());
        let mut unprocessed = items;

        while !unprocessed.is_empty() && result.attempts < max_attempts {
            result.attempts += 1;
            debug!(
                table,
                %operation,
                attempt = result.attempts,
                items = unprocessed.len(),
                "submitting batch write attempt"
            );

            let mut retry_buffer = Vec::new();

            for chunk in partition(unprocessed, chunk_size)? {
                match self.store.write_chunk(operation, &chunk).await {
                    Ok(output) => {
                        result.consumed_capacity_units += output.consumed_capacity_units.max(0.0);

                        if output.unprocessed.is_empty() {
                            result.processed_items.extend(chunk);
                            continue;
                        }

                        warn!(
                            table,
                            %operation,
                            unprocessed = output.unprocessed.len(),
                            chunk = chunk.len(),
                            "store left items unprocessed"
                        );

                        let mut rejected = vec![false; chunk.len()];
                        for index in output.unprocessed {
                            if let Some(flag) = rejected.get_mut(index) {
                                *flag = true;
                            }
                        }

                        for (item, rejected) in chunk.into_iter().zip(rejected) {
                            if rejected {
                                retry_buffer.push(item);
                            } else {
                                result.processed_items.push(item);
                            }
                        }
                    }
                    Err(e) if e.is_serialization_error() => return Err(e),
                    Err(e) => {
                        error!(
                            table,
                            %operation,
                            chunk = chunk.len(),
                            error = %e,
                            "batch write chunk failed"
                        );
                        retry_buffer.extend(chunk);
                    }
                }
            }

            unprocessed = retry_buffer;

            if !unprocessed.is_empty() && result.attempts < max_attempts {
                let delay = self.policy.delay_for(result.attempts);
                debug!(table, %operation, ?delay, "backing off before next attempt");

                if !self.backoff(delay).await {
                    info!(
                        table,
                        %operation,
                        pending = unprocessed.len(),
                        "batch write cancelled during backoff"
                    );
                    result.cancelled = true;
                    break;
                }
            }
        }

        if !unprocessed.is_empty() && !result.cancelled {
            warn!(
                table,
                %operation,
                pending = unprocessed.len(),
                attempts = result.attempts,
                "items left unprocessed after all attempts"
            );
        }

        result.unprocessed_items = unprocessed;
        result.total_duration = start_time.elapsed();
        Ok(result)
    }

    /// Fetch the items for `keys`, one request per chunk, chunks in parallel
    ///
    /// Items come back flattened in no particular order. A chunk that fails (or
    /// exceeds [`BatchLimits::read_timeout`]) is logged and contributes no
    /// items; its keys are listed in [`BatchReadOutput::failed_keys`]. Keys the
    /// store reports as unprocessed are requested again in a later round, up to
    /// the policy's attempt ceiling.
    pub async fn get_parallel<T>(
        &self,
        keys: Vec<<S as BatchStore<T>>::Key>,
    ) -> Result<BatchReadOutput<T, <S as BatchStore<T>>::Key>, Error>
    where
        S: BatchStore<T>,
        T: Send,
    {
        if keys.is_empty() {
            return Ok(BatchReadOutput::empty());
        }

        let timer = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.start_operation("batch_get", self.store.resource_name()));

        match self.drive_reads(keys).await {
            Ok(output) => {
                if let Some(timer) = timer {
                    timer.record_capacity(output.consumed_capacity_units);
                    timer.record_success();
                }
                Ok(output)
            }
            Err(e) => {
                if let Some(timer) = timer {
                    timer.record_error(&e);
                }
                Err(Error::operation("batch_get", e))
            }
        }
    }

    /// Same as [`get_parallel`](Self::get_parallel), keeping only the items
    pub async fn get_items<T>(&self, keys: Vec<<S as BatchStore<T>>::Key>) -> Result<Vec<T>, Error>
    where
        S: BatchStore<T>,
        T: Send,
    {
        Ok(self.get_parallel(keys).await?.items)
    }

    async fn drive_reads<T>(
        &self,
        keys: Vec<<S as BatchStore<T>>::Key>,
    ) -> Result<BatchReadOutput<T, <S as BatchStore<T>>::Key>, Error>
    where
        S: BatchStore<T>,
        T: Send,
    {
        let start_time = Instant::now();
        let table = self.store.resource_name();
        let max_rounds = self.policy.max_attempts.max(1);
        let chunk_size = self
            .limits
            .read_chunk_size
            .min(self.store.max_read_chunk_size());
        let processor = BatchProcessor::new(chunk_size, self.limits.max_concurrency);

        let mut output = BatchReadOutput::empty();
        let mut pending = keys;

        while !pending.is_empty() && output.rounds < max_rounds {
            output.rounds += 1;
            debug!(
                table,
                round = output.rounds,
                keys = pending.len(),
                "submitting batch read round"
            );

            let (round, unprocessed) = processor
                .process(
                    pending,
                    |chunk| async move {
                        let fetched = self.read_chunk_with_timeout(&chunk).await;
                        (chunk, fetched)
                    },
                    (output, Vec::new()),
                    |acc: &mut (BatchReadOutput<T, _>, Vec<_>), (chunk, fetched)| match fetched {
                        Ok(fetched) => {
                            acc.0.items.extend(fetched.items);
                            acc.0.consumed_capacity_units +=
                                fetched.consumed_capacity_units.max(0.0);
                            acc.1.extend(fetched.unprocessed_keys);
                        }
                        Err(e) => {
                            error!(
                                table,
                                keys = chunk.len(),
                                error = %e,
                                "batch read chunk failed, returning partial results"
                            );
                            acc.0.failed_keys.extend(chunk);
                        }
                    },
                )
                .await?;

            output = round;
            pending = unprocessed;

            if !pending.is_empty() && output.rounds < max_rounds {
                let delay = self.policy.delay_for(output.rounds);
                if !self.backoff(delay).await {
                    info!(table, pending = pending.len(), "batch read cancelled during backoff");
                    break;
                }
            }
        }

        if !pending.is_empty() {
            warn!(
                table,
                pending = pending.len(),
                "keys left unprocessed after all read rounds"
            );
            output.failed_keys.extend(pending);
        }

        output.total_duration = start_time.elapsed();
        Ok(output)
    }

    async fn read_chunk_with_timeout<T>(
        &self,
        keys: &[<S as BatchStore<T>>::Key],
    ) -> Result<ChunkReadOutput<T, <S as BatchStore<T>>::Key>, Error>
    where
        S: BatchStore<T>,
    {
        match self.limits.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.store.read_chunk(keys))
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => self.store.read_chunk(keys).await,
        }
    }

    /// Sleep for `delay`; false when cancelled first
    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => false,
            _ = self.sleeper.sleep(delay) => true,
        }
    }
}
