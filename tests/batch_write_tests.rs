//! Retrying batch writer tests
//!
//! Drives `BatchExecutor::write_with_retry` against a scripted store: full
//! and partial throttling, transport failures, fatal serialization errors,
//! cancellation during backoff and metrics.
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dynamo_batch::metrics::RepositoryMetrics;
use dynamo_batch::table::{
    Backoff, BatchExecutor, BatchLimits, BatchOperationType, ChunkWriteOutput, RetryPolicy,
};
use dynamo_batch::Error;
use tokio_util::sync::CancellationToken;

mod helpers;
use helpers::*;

fn recording_executor(
    store: ScriptedStore,
) -> (BatchExecutor<ScriptedStore, RecordingSleeper>, RecordingSleeper) {
    init_tracing();
    let sleeper = RecordingSleeper::default();
    let executor = BatchExecutor::new(store).with_sleeper(sleeper.clone());
    (executor, sleeper)
}

fn seqs(items: &[Visit]) -> BTreeSet<String> {
    items.iter().map(|v| v.seq.clone()).collect()
}

/// A store that never applies anything exhausts every attempt
#[tokio::test]
async fn test_always_unprocessed_exhausts_attempts() {
    let store = ScriptedStore::new().on_write(|_, items| Ok(all_unprocessed(items)));
    let (executor, sleeper) = recording_executor(store);

    let result = executor.put_all(visits(10)).await.unwrap();

    assert_eq!(result.attempts, 3);
    assert!(result.processed_items.is_empty());
    assert_eq!(result.unprocessed_items.len(), 10);
    assert_eq!(seqs(&result.unprocessed_items), seqs(&visits(10)));
    assert!(result.has_unprocessed_items());
    assert!(!result.cancelled);
    assert_eq!(executor.store().write_calls(), 3);

    // Linear backoff between attempts, none after the last one
    assert_eq!(
        sleeper.delays(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
}

/// 60 items fail on the first pass and all succeed on the second
#[tokio::test]
async fn test_succeeds_on_second_attempt() {
    // First attempt is three requests: 25 + 25 + 10
    let store = ScriptedStore::new().on_write(|call, items| {
        if call < 3 {
            Ok(all_unprocessed(items))
        } else {
            Ok(ChunkWriteOutput::applied(1.0))
        }
    });
    let (executor, sleeper) = recording_executor(store);

    let result = executor.put_all(visits(60)).await.unwrap();

    assert_eq!(result.processed_items.len(), 60);
    assert!(result.unprocessed_items.is_empty());
    assert!(result.attempts <= 2);
    assert!(result.is_success());
    assert_eq!(result.success_rate(), 100.0);
    assert_eq!(seqs(&result.processed_items), seqs(&visits(60)));
    assert_eq!(executor.store().write_calls(), 6);
    assert_eq!(sleeper.delays().len(), 1);
}

/// A failed request puts its whole chunk back into the retry buffer
#[tokio::test]
async fn test_transport_error_is_retried() {
    let store = ScriptedStore::new().on_write(|call, _| {
        if call == 0 {
            Err(Error::Store("connection reset".into()))
        } else {
            Ok(ChunkWriteOutput::applied(0.5))
        }
    });
    let (executor, _) = recording_executor(store);

    let result = executor.put_all(visits(10)).await.unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(result.processed_items.len(), 10);
    assert!(result.unprocessed_items.is_empty());
    assert_eq!(result.consumed_capacity_units, 0.5);
}

/// Items the store reports as unprocessed are retried; the rest of the chunk
/// counts as processed and nothing is lost
#[tokio::test]
async fn test_partial_remainder_is_split() {
    let store = ScriptedStore::new().on_write(|call, items| {
        if call == 0 {
            assert_eq!(items.len(), 5);
            Ok(ChunkWriteOutput {
                unprocessed: vec![1, 3, 42],
                consumed_capacity_units: 2.0,
            })
        } else {
            let retried: Vec<&str> = items.iter().map(|v| v.seq.as_str()).collect();
            assert_eq!(retried, vec!["0001", "0003"]);
            Ok(ChunkWriteOutput::applied(1.0))
        }
    });
    let (executor, _) = recording_executor(store);

    let result = executor.put_all(visits(5)).await.unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(result.processed_items.len(), 5);
    assert_eq!(seqs(&result.processed_items), seqs(&visits(5)));
    assert_eq!(result.consumed_capacity_units, 3.0);
    assert_eq!(executor.store().write_calls(), 2);
}

/// Leftovers after the last attempt keep their identity
#[tokio::test]
async fn test_processed_and_unprocessed_partition_input() {
    let store = ScriptedStore::new().on_write(|_, items| {
        // Every other item is throttled on every attempt
        let unprocessed = items
            .iter()
            .enumerate()
            .filter(|(_, v)| v.seq.ends_with(['1', '3', '5', '7', '9']))
            .map(|(i, _)| i)
            .collect();
        Ok(ChunkWriteOutput {
            unprocessed,
            consumed_capacity_units: 1.0,
        })
    });
    let (executor, _) = recording_executor(store);

    let input = visits(30);
    let result = executor.put_all(input.clone()).await.unwrap();

    assert_eq!(result.processed_items.len(), 15);
    assert_eq!(result.unprocessed_items.len(), 15);
    assert_eq!(result.success_count() + result.failure_count(), input.len());

    let mut all = seqs(&result.processed_items);
    all.extend(seqs(&result.unprocessed_items));
    assert_eq!(all, seqs(&input));
    assert!(result.unprocessed_items.iter().all(|v| v.seq.ends_with(['1', '3', '5', '7', '9'])));
}

#[tokio::test]
async fn test_empty_input_makes_no_requests() {
    let (executor, sleeper) = recording_executor(ScriptedStore::new());

    let result = executor.put_all::<Visit>(Vec::new()).await.unwrap();

    assert_eq!(result.attempts, 0);
    assert!(result.processed_items.is_empty());
    assert!(result.unprocessed_items.is_empty());
    assert_eq!(result.consumed_capacity_units, 0.0);
    assert_eq!(executor.store().write_calls(), 0);
    assert!(sleeper.delays().is_empty());
}

/// Serialization failures abort the call without retrying
#[tokio::test]
async fn test_serialization_failure_is_fatal() {
    let store = ScriptedStore::new().on_write(|_, _| {
        Err(Error::SerdeDynamo(<serde_dynamo::Error as serde::ser::Error>::custom(
            "unsupported map key",
        )))
    });
    let (executor, sleeper) = recording_executor(store);

    let err = executor.put_all(visits(30)).await.unwrap_err();

    assert!(err.is_serialization_error());
    assert!(matches!(err, Error::SerdeDynamo(_)));
    assert_eq!(executor.store().write_calls(), 1);
    assert!(sleeper.delays().is_empty());
}

/// Cancelling during backoff returns what was gathered so far
#[tokio::test]
async fn test_cancellation_during_backoff() {
    init_tracing();
    let token = CancellationToken::new();
    let store = ScriptedStore::new().on_write(|call, items| {
        if call == 0 {
            Ok(ChunkWriteOutput {
                unprocessed: vec![0],
                consumed_capacity_units: 1.0,
            })
        } else {
            Ok(all_unprocessed(items))
        }
    });
    let executor = BatchExecutor::new(store)
        .with_cancellation(token.clone())
        .with_sleeper(CancellingSleeper {
            token: token.clone(),
        });

    let result = executor.put_all(visits(4)).await.unwrap();

    assert!(result.cancelled);
    assert!(token.is_cancelled());
    assert_eq!(result.attempts, 1);
    assert_eq!(result.processed_items.len(), 3);
    assert_eq!(result.unprocessed_items.len(), 1);
    assert_eq!(result.unprocessed_items[0].seq, "0000");
    assert_eq!(executor.store().write_calls(), 1);
}

#[tokio::test]
async fn test_consumed_capacity_is_summed_and_non_negative() {
    let store = ScriptedStore::new().on_write(|call, _| {
        let units = if call == 1 { -4.0 } else { 1.5 };
        Ok(ChunkWriteOutput::applied(units))
    });
    let (executor, _) = recording_executor(store);

    let result = executor.put_all(visits(60)).await.unwrap();

    assert_eq!(executor.store().write_calls(), 3);
    assert_eq!(result.consumed_capacity_units, 3.0);
}

#[tokio::test]
async fn test_exponential_backoff_delays() {
    let store = ScriptedStore::new().on_write(|_, items| Ok(all_unprocessed(items)));
    let policy = RetryPolicy::DEFAULT
        .with_max_attempts(4)
        .with_base_delay(Duration::from_millis(100))
        .with_backoff(Backoff::Exponential);
    let (executor, sleeper) = recording_executor(store);
    let executor = executor.with_policy(policy);

    let result = executor.put_all(visits(3)).await.unwrap();

    assert_eq!(result.attempts, 4);
    assert_eq!(
        sleeper.delays(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]
    );
}

#[tokio::test]
async fn test_no_retry_policy_makes_one_attempt() {
    let store = ScriptedStore::new().on_write(|_, items| Ok(all_unprocessed(items)));
    let (executor, sleeper) = recording_executor(store);
    let executor = executor.with_policy(RetryPolicy::NO_RETRY);

    let result = executor.put_all(visits(3)).await.unwrap();

    assert_eq!(result.attempts, 1);
    assert_eq!(result.unprocessed_items.len(), 3);
    assert!(sleeper.delays().is_empty());
}

#[tokio::test]
async fn test_write_chunk_size_follows_limits() {
    let store = ScriptedStore::new().on_write(|_, items| {
        assert!(items.len() <= 3);
        Ok(ChunkWriteOutput::applied(0.0))
    });
    let (executor, _) = recording_executor(store);
    let executor = executor.with_limits(BatchLimits::for_item_size(100 * 1024));

    let result = executor.put_all(visits(10)).await.unwrap();

    assert!(result.is_success());
    assert_eq!(executor.store().write_calls(), 4);
}

/// A zero chunk size is rejected as a whole-operation failure
#[tokio::test]
async fn test_zero_chunk_size_is_operation_error() {
    let limits = BatchLimits {
        write_chunk_size: 0,
        ..BatchLimits::default()
    };
    let (executor, _) = recording_executor(ScriptedStore::new());
    let executor = executor.with_limits(limits);

    let err = executor.put_all(visits(3)).await.unwrap_err();

    match err {
        Error::Operation { operation, source } => {
            assert_eq!(operation, "batch_put");
            assert!(matches!(*source, Error::InvalidArgument(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.store().write_calls(), 0);
}

#[tokio::test]
async fn test_delete_uses_delete_requests() {
    let (executor, _) = recording_executor(ScriptedStore::new());

    let result = executor.delete_all(visits(30)).await.unwrap();

    assert_eq!(result.processed_items.len(), 30);
    assert_eq!(
        executor.store().operations(),
        vec![BatchOperationType::Delete, BatchOperationType::Delete]
    );
}

/// One timing per top-level call, whatever the number of attempts
#[tokio::test]
async fn test_metrics_recorded_once_per_call() {
    let metrics = Arc::new(RepositoryMetrics::new());
    let store = ScriptedStore::new().on_write(|call, items| {
        if call < 3 {
            Ok(all_unprocessed(items))
        } else {
            Ok(ChunkWriteOutput::applied(2.0))
        }
    });
    let (executor, _) = recording_executor(store);
    let executor = executor.with_metrics(metrics.clone());

    let result = executor.put_all(visits(60)).await.unwrap();
    assert_eq!(result.attempts, 2);

    let stats = metrics.stats("batch_put", "visits-fake");
    assert_eq!(stats.total_operations, 1);
    assert_eq!(stats.total_errors, 0);
    assert_eq!(stats.total_capacity_units, 6.0);

    let zero = BatchLimits {
        write_chunk_size: 0,
        ..BatchLimits::default()
    };
    let executor = executor.with_limits(zero);
    assert!(executor.delete_all(visits(1)).await.is_err());

    let stats = metrics.stats("batch_delete", "visits-fake");
    assert_eq!(stats.total_operations, 1);
    assert_eq!(stats.total_errors, 1);
}

/// Chunk sizes above the store's per-request ceiling are lowered to it
#[tokio::test]
async fn test_write_chunks_respect_store_ceiling() {
    let store = ScriptedStore::new().with_ceilings(25, 100);
    let (executor, _) = recording_executor(store);
    let executor = executor.with_limits(BatchLimits {
        write_chunk_size: 100,
        ..BatchLimits::default()
    });

    let result = executor.put_all(visits(60)).await.unwrap();

    assert_eq!(result.processed_items.len(), 60);
    assert_eq!(result.attempts, 1);
    assert_eq!(executor.store().chunk_sizes(), vec![25, 25, 10]);
}
