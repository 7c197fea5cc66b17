//! Per-operation counters for batch calls
//!
//! A [`RepositoryMetrics`] is shared (usually behind an `Arc`) by every
//! executor that should report into it. Each top-level call opens one
//! [`OperationTimer`] and closes it with a success or an error.

use dashmap::DashMap;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::Error;

#[derive(Clone, Debug, Default)]
struct Counters {
    operations: u64,
    errors: u64,
    total_duration: Duration,
    capacity_units: f64,
    last_started: Option<SystemTime>,
}

/// Aggregated figures for one operation against one resource
#[derive(Clone, Debug, PartialEq)]
pub struct OperationStats {
    /// Operations started
    pub total_operations: u64,
    /// Operations that ended in an error
    pub total_errors: u64,
    /// `total_errors / total_operations` in percent
    pub error_rate: f64,
    /// Mean recorded duration
    pub avg_duration: Duration,
    /// Capacity units reported
    pub total_capacity_units: f64,
    /// Mean capacity units per operation
    pub avg_capacity_per_operation: f64,
    /// Wall-clock start of the latest operation
    pub last_operation: Option<SystemTime>,
}

impl From<&Counters> for OperationStats {
    fn from(counters: &Counters) -> Self {
        let ops = counters.operations;
        let per_op = |total: f64| if ops > 0 { total / ops as f64 } else { 0.0 };

        Self {
            total_operations: ops,
            total_errors: counters.errors,
            error_rate: per_op(counters.errors as f64) * 100.0,
            avg_duration: if ops > 0 {
                counters.total_duration.div_f64(ops as f64)
            } else {
                Duration::ZERO
            },
            total_capacity_units: counters.capacity_units,
            avg_capacity_per_operation: per_op(counters.capacity_units),
            last_operation: counters.last_started,
        }
    }
}

/// Thread-safe counters keyed by operation name and resource
#[derive(Debug, Default)]
pub struct RepositoryMetrics {
    counters: DashMap<(String, String), Counters>,
}

impl RepositoryMetrics {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new operation and start timing it
    pub fn start_operation(&self, operation: &str, resource: &str) -> OperationTimer<'_> {
        let key = (operation.to_string(), resource.to_string());
        {
            let mut entry = self.counters.entry(key.clone()).or_default();
            let counters = entry.value_mut();
            counters.operations += 1;
            counters.last_started = Some(SystemTime::now());
        }

        OperationTimer {
            metrics: self,
            key,
            started: Instant::now(),
        }
    }

    fn update(&self, key: &(String, String), f: impl FnOnce(&mut Counters)) {
        let mut entry = self.counters.entry(key.clone()).or_default();
        f(entry.value_mut());
    }

    /// Figures for `operation` against `resource`; zeros when never seen
    pub fn stats(&self, operation: &str, resource: &str) -> OperationStats {
        self.counters
            .get(&(operation.to_string(), resource.to_string()))
            .map(|entry| OperationStats::from(entry.value()))
            .unwrap_or_else(|| OperationStats::from(&Counters::default()))
    }

    /// Figures for every tracked pair, sorted by operation then resource
    pub fn snapshot(&self) -> Vec<(String, String, OperationStats)> {
        let mut all: Vec<_> = self
            .counters
            .iter()
            .map(|entry| {
                let (operation, resource) = entry.key().clone();
                (operation, resource, OperationStats::from(entry.value()))
            })
            .collect();
        all.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        all
    }

    /// Emit one `info!` line per tracked pair
    pub fn log_summary(&self) {
        for (operation, resource, stats) in self.snapshot() {
            info!(
                operation = operation.as_str(),
                resource = resource.as_str(),
                total = stats.total_operations,
                errors = stats.total_errors,
                error_rate = stats.error_rate,
                avg_ms = stats.avg_duration.as_millis() as u64,
                capacity_units = stats.total_capacity_units,
                "repository metrics"
            );
        }
    }

    /// Drop every counter
    pub fn reset(&self) {
        self.counters.clear();
        info!("repository metrics reset");
    }

    /// True when any pair's error rate is above `threshold_percent`
    pub fn has_high_error_rate(&self, threshold_percent: f64) -> bool {
        self.counters
            .iter()
            .any(|entry| OperationStats::from(entry.value()).error_rate > threshold_percent)
    }
}

/// Running measurement of one operation
#[must_use = "an operation timer records nothing until it is finished"]
#[derive(Debug)]
pub struct OperationTimer<'a> {
    metrics: &'a RepositoryMetrics,
    key: (String, String),
    started: Instant,
}

impl OperationTimer<'_> {
    /// Add consumed capacity units to the operation
    pub fn record_capacity(&self, units: f64) {
        if units > 0.0 {
            self.metrics
                .update(&self.key, |counters| counters.capacity_units += units);
        }
    }

    /// Finish the operation as a success
    pub fn record_success(self) {
        let elapsed = self.started.elapsed();
        self.metrics
            .update(&self.key, |counters| counters.total_duration += elapsed);
        debug!(
            operation = self.key.0.as_str(),
            resource = self.key.1.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "operation completed"
        );
    }

    /// Finish the operation as a failure
    pub fn record_error(self, error: &Error) {
        let elapsed = self.started.elapsed();
        self.metrics.update(&self.key, |counters| {
            counters.errors += 1;
            counters.total_duration += elapsed;
        });
        warn!(
            operation = self.key.0.as_str(),
            resource = self.key.1.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            error = %error,
            "operation failed"
        );
    }
}
