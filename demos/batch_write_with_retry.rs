//! Batch writes against a throttling store
//!
//! Runs the retrying writer and the parallel reader over an in-memory store
//! that leaves a share of every request unprocessed, the way DynamoDB does
//! under throttling. No AWS account is needed:
//!
//! ```sh
//! cargo run --example batch_write_with_retry
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dynamo_batch::table::{
    Backoff, BatchExecutor, BatchLimits, BatchOperationType, BatchStore, ChunkReadOutput,
    ChunkWriteOutput, RetryPolicy,
};
use dynamo_batch::{Error, RepositoryMetrics};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Visit {
    plan_id: String,
    seq: u32,
    place: String,
}

/// Keeps every third item of a request unprocessed on its first submission
#[derive(Default)]
struct ThrottlingStore {
    rows: Mutex<HashMap<u32, Visit>>,
    seen: Mutex<HashMap<u32, usize>>,
    requests: AtomicUsize,
}

impl BatchStore<Visit> for ThrottlingStore {
    type Key = u32;

    fn resource_name(&self) -> &str {
        "visits-in-memory"
    }

    fn write_chunk(
        &self,
        operation: BatchOperationType,
        items: &[Visit],
    ) -> impl Future<Output = Result<ChunkWriteOutput, Error>> + Send {
        let _ = self.requests.fetch_add(1, Ordering::Relaxed);

        let result = (|| -> Result<ChunkWriteOutput, Error> {
            let mut rows = self.rows.lock().map_err(|e| Error::Store(e.to_string()))?;
            let mut seen = self.seen.lock().map_err(|e| Error::Store(e.to_string()))?;

            let mut unprocessed = Vec::new();
            for (index, visit) in items.iter().enumerate() {
                let submissions = seen.entry(visit.seq).or_insert(0);
                *submissions += 1;

                if *submissions == 1 && visit.seq % 3 == 0 {
                    unprocessed.push(index);
                    continue;
                }

                match operation {
                    BatchOperationType::Put => {
                        let _ = rows.insert(visit.seq, visit.clone());
                    }
                    BatchOperationType::Delete => {
                        let _ = rows.remove(&visit.seq);
                    }
                }
            }

            Ok(ChunkWriteOutput {
                consumed_capacity_units: (items.len() - unprocessed.len()) as f64,
                unprocessed,
            })
        })();

        std::future::ready(result)
    }

    fn read_chunk(
        &self,
        keys: &[u32],
    ) -> impl Future<Output = Result<ChunkReadOutput<Visit, u32>, Error>> + Send {
        let result = self
            .rows
            .lock()
            .map_err(|e| Error::Store(e.to_string()))
            .map(|rows| {
                let mut output =
                    ChunkReadOutput::found(keys.iter().filter_map(|k| rows.get(k).cloned()).collect());
                output.consumed_capacity_units = keys.len() as f64 * 0.5;
                output
            });

        std::future::ready(result)
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let metrics = Arc::new(RepositoryMetrics::new());
    let executor = BatchExecutor::new(ThrottlingStore::default())
        .with_policy(
            RetryPolicy::DEFAULT
                .with_base_delay(Duration::from_millis(100))
                .with_backoff(Backoff::Exponential),
        )
        .with_limits(BatchLimits::for_item_size(20 * 1024))
        .with_metrics(metrics.clone());

    let visits: Vec<Visit> = (0..120)
        .map(|seq| Visit {
            plan_id: "plan-1".to_string(),
            seq,
            place: format!("stop #{seq}"),
        })
        .collect();

    let written = executor.put_all(visits).await?;
    println!(
        "wrote {}/{} visits in {} attempts ({:.1}% success, {} requests)",
        written.success_count(),
        written.success_count() + written.failure_count(),
        written.attempts,
        written.success_rate(),
        executor.store().requests.load(Ordering::Relaxed),
    );

    let read = executor.get_parallel::<Visit>((0..150).collect()).await?;
    println!(
        "read {} visits, {} keys failed, {:.1} capacity units",
        read.items.len(),
        read.failed_count(),
        read.consumed_capacity_units
    );

    metrics.log_summary();
    Ok(())
}
