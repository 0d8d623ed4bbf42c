//! Projection metrics
//!
//! Every series lives in one name-sorted map and is created on first use.
//! Components take an optional `Arc<MetricsRegistry>`; nothing is recorded
//! when none is supplied.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

/// Upper bounds, in seconds, of the latency buckets
const LATENCY_BUCKETS: [f64; 10] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0];

enum Series {
    Counter(AtomicU64),
    Gauge(AtomicI64),
    Latency(LatencyHistogram),
}

impl Series {
    fn kind(&self) -> &'static str {
        match self {
            Series::Counter(_) => "counter",
            Series::Gauge(_) => "gauge",
            Series::Latency(_) => "histogram",
        }
    }
}

/// Registry of named counters, gauges and latency histograms
pub struct MetricsRegistry {
    series: RwLock<BTreeMap<String, Arc<Series>>>,
    started: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(BTreeMap::new()),
            started: Instant::now(),
        }
    }

    /// Existing series `name`, or a new one from `make`. A name first used
    /// with another kind keeps its original series.
    async fn series(&self, name: &str, make: fn() -> Series) -> Arc<Series> {
        if let Some(series) = self.series.read().await.get(name) {
            return series.clone();
        }
        self.series
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    pub async fn add_counter(&self, name: &str, value: u64) {
        if let Series::Counter(counter) = &*self.series(name, new_counter).await {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub async fn set_gauge(&self, name: &str, value: i64) {
        if let Series::Gauge(gauge) = &*self.series(name, new_gauge).await {
            gauge.store(value, Ordering::Relaxed);
        }
    }

    /// Record one latency sample in seconds
    pub async fn observe_histogram(&self, name: &str, seconds: f64) {
        if let Series::Latency(histogram) = &*self.series(name, new_latency).await {
            histogram.observe(seconds);
        }
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        match self.series.read().await.get(name).map(|s| &**s) {
            Some(Series::Counter(counter)) => counter.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub async fn get_gauge(&self, name: &str) -> i64 {
        match self.series.read().await.get(name).map(|s| &**s) {
            Some(Series::Gauge(gauge)) => gauge.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub async fn histogram_count(&self, name: &str) -> u64 {
        match self.series.read().await.get(name).map(|s| &**s) {
            Some(Series::Latency(histogram)) => histogram.count(),
            _ => 0,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub async fn to_json(&self) -> Value {
        let series = self.series.read().await;
        let mut counters = Map::new();
        let mut gauges = Map::new();
        let mut histograms = Map::new();

        for (name, s) in series.iter() {
            match &**s {
                Series::Counter(c) => {
                    counters.insert(name.clone(), json!(c.load(Ordering::Relaxed)));
                }
                Series::Gauge(g) => {
                    gauges.insert(name.clone(), json!(g.load(Ordering::Relaxed)));
                }
                Series::Latency(h) => {
                    histograms.insert(name.clone(), h.to_json());
                }
            }
        }

        json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }

    /// Prometheus text exposition, in name order
    pub async fn to_prometheus(&self) -> String {
        let series = self.series.read().await;
        let mut out = String::new();

        let _ = writeln!(out, "# TYPE readmodel_uptime_seconds gauge");
        let _ = writeln!(out, "readmodel_uptime_seconds {}", self.uptime_seconds());

        for (name, s) in series.iter() {
            let metric = prometheus_name(name);
            let _ = writeln!(out, "# TYPE {} {}", metric, s.kind());
            match &**s {
                Series::Counter(c) => {
                    let _ = writeln!(out, "{} {}", metric, c.load(Ordering::Relaxed));
                }
                Series::Gauge(g) => {
                    let _ = writeln!(out, "{} {}", metric, g.load(Ordering::Relaxed));
                }
                Series::Latency(h) => h.write_prometheus(&metric, &mut out),
            }
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn new_counter() -> Series {
    Series::Counter(AtomicU64::new(0))
}

fn new_gauge() -> Series {
    Series::Gauge(AtomicI64::new(0))
}

fn new_latency() -> Series {
    Series::Latency(LatencyHistogram::default())
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Latency histogram over [`LATENCY_BUCKETS`]; the sum is kept in microseconds
#[derive(Default)]
struct LatencyHistogram {
    /// Per-bucket (non-cumulative) counts
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    total_micros: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    fn observe(&self, seconds: f64) {
        let seconds = seconds.max(0.0);
        self.total_micros
            .fetch_add((seconds * 1e6) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = LATENCY_BUCKETS.iter().position(|le| seconds <= *le) {
            self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn total_seconds(&self) -> f64 {
        self.total_micros.load(Ordering::Relaxed) as f64 / 1e6
    }

    fn to_json(&self) -> Value {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        json!({
            "le": LATENCY_BUCKETS,
            "counts": counts,
            "sum": self.total_seconds(),
            "count": self.count(),
        })
    }

    fn write_prometheus(&self, metric: &str, out: &mut String) {
        let mut cumulative = 0;
        for (le, bucket) in LATENCY_BUCKETS.iter().zip(&self.buckets) {
            cumulative += bucket.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", metric, le, cumulative);
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", metric, self.count());
        let _ = writeln!(out, "{}_sum {}", metric, self.total_seconds());
        let _ = writeln!(out, "{}_count {}", metric, self.count());
    }
}

/// Metric names recorded by the projection components
pub mod metric_names {
    // Collection wrapper
    pub const READMODEL_REBUILDS: &str = "readmodel.rebuilds";
    pub const READMODEL_REBUILD_FAILURES: &str = "readmodel.rebuild_failures";
    pub const READMODEL_WRITES_SKIPPED: &str = "readmodel.writes_skipped";
    pub const READMODEL_INSERT_RACES: &str = "readmodel.insert_races";
    pub const READMODEL_FAULTED: &str = "readmodel.faulted";
    pub const READMODEL_REBUILD_LATENCY: &str = "readmodel.rebuild.latency_seconds";

    // Signature fixer
    pub const FIXER_FIXED: &str = "fixer.fixed";
    pub const FIXER_FAULTED: &str = "fixer.faulted";

    // Checkpoints
    pub const CHECKPOINT_FLUSHES: &str = "checkpoint.flushes";

    /// Gauge holding the tracked position of one read model
    pub fn checkpoint_position(name: &str) -> String {
        format!("checkpoint.position.{}", name)
    }
}
