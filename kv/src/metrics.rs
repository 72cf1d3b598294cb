//! Per-operation metrics.
//!
//! Counters live in memory and never block user operations: recording is a
//! few atomic adds, and the optional durable flush logs and drops its own
//! failures. Exposed as JSON internally and as Prometheus text.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use log::warn;
use rusqlite::Connection;
use serde_derive::Serialize;

#[derive(Default)]
struct OpCounters {
    count: AtomicU64,
    errors: AtomicU64,
    latency_us: AtomicU64,
}

/// Aggregated view of one operation's counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpStats {
    pub count: u64,
    pub errors: u64,
    /// Total latency across all calls, milliseconds.
    pub latency_ms: f64,
    /// Mean latency per call, milliseconds. Zero when nothing ran.
    pub mean_ms: f64,
}

/// The metrics sink shared by the whole engine.
#[derive(Clone)]
pub struct Metrics {
    ops: Arc<RwLock<BTreeMap<&'static str, Arc<OpCounters>>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self { ops: Arc::new(RwLock::new(BTreeMap::new())) }
    }

    fn counters(&self, op: &'static str) -> Arc<OpCounters> {
        if let Some(c) = self.ops.read().expect("metrics poisoned").get(op) {
            return c.clone();
        }
        let mut ops = self.ops.write().expect("metrics poisoned");
        ops.entry(op).or_default().clone()
    }

    /// Times `f` and records one call under `op`.
    pub fn observe<T, E>(&self, op: &'static str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let start = Instant::now();
        let result = f();
        let c = self.counters(op);
        c.count.fetch_add(1, Ordering::Relaxed);
        c.latency_us
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        if result.is_err() {
            c.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Records one failed call without timing (for background sweeps).
    pub fn record_error(&self, op: &'static str) {
        let c = self.counters(op);
        c.count.fetch_add(1, Ordering::Relaxed);
        c.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of every operation's aggregates.
    pub fn snapshot(&self) -> BTreeMap<String, OpStats> {
        let ops = self.ops.read().expect("metrics poisoned");
        ops.iter()
            .map(|(op, c)| {
                let count = c.count.load(Ordering::Relaxed);
                let latency_ms = c.latency_us.load(Ordering::Relaxed) as f64 / 1000.0;
                (
                    op.to_string(),
                    OpStats {
                        count,
                        errors: c.errors.load(Ordering::Relaxed),
                        latency_ms,
                        mean_ms: if count == 0 { 0.0 } else { latency_ms / count as f64 },
                    },
                )
            })
            .collect()
    }

    /// Prometheus text exposition. One counter pair plus a latency gauge per
    /// operation; callers append their own storage/queue gauges.
    pub fn to_prometheus(&self, extra_gauges: &[(&str, f64)]) -> String {
        let mut out = String::new();
        let snapshot = self.snapshot();

        out.push_str("# TYPE kv_op_total counter\n");
        for (op, stats) in &snapshot {
            out.push_str(&format!("kv_op_total{{op=\"{}\"}} {}\n", op, stats.count));
        }
        out.push_str("# TYPE kv_op_errors_total counter\n");
        for (op, stats) in &snapshot {
            out.push_str(&format!("kv_op_errors_total{{op=\"{}\"}} {}\n", op, stats.errors));
        }
        out.push_str("# TYPE kv_op_latency_ms_total gauge\n");
        for (op, stats) in &snapshot {
            out.push_str(&format!(
                "kv_op_latency_ms_total{{op=\"{}\"}} {}\n",
                op, stats.latency_ms
            ));
        }
        for (name, value) in extra_gauges {
            out.push_str(&format!("# TYPE {} gauge\n{} {}\n", name, name, value));
        }
        out
    }

    /// Flushes current aggregates into the metrics table. Failures are
    /// logged and dropped; metrics never fail a caller.
    pub fn flush(&self, conn: &Connection) {
        let snapshot = self.snapshot();
        let now = chrono::Utc::now().timestamp_millis();
        for (op, stats) in snapshot {
            let result = conn.execute(
                "INSERT INTO kv_metrics (op, count, errors, latency_ms, flushed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (op) DO UPDATE SET \
                 count = excluded.count, errors = excluded.errors, \
                 latency_ms = excluded.latency_ms, flushed_at = excluded.flushed_at",
                rusqlite::params![op, stats.count, stats.errors, stats.latency_ms, now],
            );
            if let Err(err) = result {
                warn!("metrics flush failed for {}: {}", op, err);
                return;
            }
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
