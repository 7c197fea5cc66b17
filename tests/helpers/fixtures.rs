//! Common test fixtures and fake stores
//!
//! `ScriptedStore` stands in for DynamoDB: each request is answered by a
//! closure that sees the zero-based call number and the chunk, so tests can
//! script throttling, transport failures and slow responses.
use super::{Deserialize, DynamoTable, Serialize};
use dynamo_batch::Error;
use dynamo_batch::table::{
    BatchOperationType, BatchStore, ChunkReadOutput, ChunkWriteOutput, Sleeper, SortKey,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One stop of a travel plan
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Visit {
    pub plan_id: String,
    pub seq: String,
    pub place: String,
}

impl DynamoTable for Visit {
    type PK = String;
    type SK = String;
    const TABLE: &'static str = "visits";
    const PARTITION_KEY: &'static str = "plan_id";
    const SORT_KEY: Option<&'static str> = Some("seq");

    fn partition_key(&self) -> String {
        self.plan_id.clone()
    }

    fn sort_key(&self) -> SortKey<String> {
        Some(self.seq.clone())
    }
}

/// Read key used by the scripted store
pub fn key(i: usize) -> String {
    format!("{i:04}")
}

pub fn keys(n: usize) -> Vec<String> {
    (0..n).map(key).collect()
}

pub fn visit_for(key: &str) -> Visit {
    Visit {
        plan_id: "plan-1".to_string(),
        seq: key.to_string(),
        place: format!("place-{key}"),
    }
}

pub fn visits(n: usize) -> Vec<Visit> {
    keys(n).iter().map(|k| visit_for(k)).collect()
}

type WriteFn = dyn Fn(usize, &[Visit]) -> Result<ChunkWriteOutput, Error> + Send + Sync;
type ReadFn =
    dyn Fn(usize, &[String]) -> Result<ChunkReadOutput<Visit, String>, Error> + Send + Sync;
type DelayFn = dyn Fn(&[String]) -> Duration + Send + Sync;

/// In-memory [`BatchStore`] answering from closures
pub struct ScriptedStore {
    write: Box<WriteFn>,
    read: Box<ReadFn>,
    read_delay: Box<DelayFn>,
    write_calls: AtomicUsize,
    read_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    operations: Mutex<Vec<BatchOperationType>>,
    chunk_sizes: Mutex<Vec<usize>>,
    ceilings: (usize, usize),
}

impl ScriptedStore {
    /// Applies every write and finds every key
    pub fn new() -> Self {
        Self {
            write: Box::new(|_: usize, _: &[Visit]| -> Result<_, Error> {
                Ok(ChunkWriteOutput::applied(0.0))
            }),
            read: Box::new(|_: usize, keys: &[String]| -> Result<_, Error> { Ok(found(keys)) }),
            read_delay: Box::new(|_: &[String]| Duration::ZERO),
            write_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            operations: Mutex::new(Vec::new()),
            chunk_sizes: Mutex::new(Vec::new()),
            ceilings: (usize::MAX, usize::MAX),
        }
    }

    pub fn on_write(
        mut self,
        f: impl Fn(usize, &[Visit]) -> Result<ChunkWriteOutput, Error> + Send + Sync + 'static,
    ) -> Self {
        self.write = Box::new(f);
        self
    }

    pub fn on_read(
        mut self,
        f: impl Fn(usize, &[String]) -> Result<ChunkReadOutput<Visit, String>, Error>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.read = Box::new(f);
        self
    }

    pub fn with_read_delay(
        mut self,
        f: impl Fn(&[String]) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.read_delay = Box::new(f);
        self
    }

    /// Per-request ceilings, like DynamoDB's 25 writes / 100 reads
    pub fn with_ceilings(mut self, max_write: usize, max_read: usize) -> Self {
        self.ceilings = (max_write, max_read);
        self
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> Vec<BatchOperationType> {
        self.operations.lock().unwrap().clone()
    }

    /// Size of every chunk submitted, writes and reads alike
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.chunk_sizes.lock().unwrap().clone()
    }
}

/// Every key found
pub fn found(keys: &[String]) -> ChunkReadOutput<Visit, String> {
    ChunkReadOutput::found(keys.iter().map(|k| visit_for(k)).collect())
}

/// Every item in the chunk left unprocessed
pub fn all_unprocessed(items: &[Visit]) -> ChunkWriteOutput {
    ChunkWriteOutput {
        unprocessed: (0..items.len()).collect(),
        consumed_capacity_units: 0.0,
    }
}

impl BatchStore<Visit> for ScriptedStore {
    type Key = String;

    fn resource_name(&self) -> &str {
        "visits-fake"
    }

    fn max_write_chunk_size(&self) -> usize {
        self.ceilings.0
    }

    fn max_read_chunk_size(&self) -> usize {
        self.ceilings.1
    }

    fn write_chunk(
        &self,
        operation: BatchOperationType,
        items: &[Visit],
    ) -> impl Future<Output = Result<ChunkWriteOutput, Error>> + Send {
        let call = self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.operations.lock().unwrap().push(operation);
        self.chunk_sizes.lock().unwrap().push(items.len());
        std::future::ready((self.write)(call, items))
    }

    fn read_chunk(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<ChunkReadOutput<Visit, String>, Error>> + Send {
        self.chunk_sizes.lock().unwrap().push(keys.len());
        async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = (self.read_delay)(keys);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let call = self.read_calls.fetch_add(1, Ordering::SeqCst);
            let result = (self.read)(call, keys);
            let _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }
}

/// Sleeper that records every requested delay and returns immediately
#[derive(Clone, Debug, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.delays.lock().unwrap().push(duration);
        std::future::ready(())
    }
}

/// Sleeper that cancels `token` as soon as a backoff starts and never wakes
#[derive(Clone, Debug)]
pub struct CancellingSleeper {
    pub token: CancellationToken,
}

impl Sleeper for CancellingSleeper {
    fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
        self.token.cancel();
        std::future::pending()
    }
}
