//! # Prometheus Metrics
//!
//! One [`Metrics`] handle per engine, owning its own `Registry` — there
//! are no process-wide metric singletons. The driver records every
//! query/execute outcome and duration by statement tag; the engine and
//! the background tasks bump the domain counters.
//!
//! ## Why a Handle Instead of Globals?
//!
//! A process can host several engines (tests do, multi-store binaries
//! might), and global registries make their series collide. Passing the
//! handle explicitly also makes the recording points visible in
//! signatures instead of hiding them behind a static.
//!
//! ## Example
//!
//! ```rust
//! use revkv::Metrics;
//!
//! let metrics = Metrics::new();
//! let text = metrics.encode();
//! assert!(text.contains("revkv_ops_total"));
//! ```

use std::time::Instant;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for per-statement metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OpLabels {
    /// Statement tag, e.g. `create_sql` or `after_sql_limit`.
    pub op: String,
}

impl OpLabels {
    fn new(op: &str) -> Self {
        Self { op: op.to_string() }
    }
}

/// Container for all engine metrics.
pub struct Metrics {
    registry: Registry,

    /// Completed driver operations by statement tag.
    pub ops_total: Family<OpLabels, Counter>,

    /// Failed driver operations by statement tag.
    pub op_failures_total: Family<OpLabels, Counter>,

    /// Driver operation latency in seconds, by statement tag.
    pub op_duration_seconds: Family<OpLabels, Histogram>,

    /// Transient-error retries performed by the driver.
    pub sql_retries_total: Counter,

    /// Create requests.
    pub creates_total: Counter,

    /// Update requests.
    pub updates_total: Counter,

    /// Delete requests.
    pub deletes_total: Counter,

    /// Gap-fill inserts.
    pub fills_total: Counter,

    /// Explicit single-revision deletes.
    pub delete_revision_total: Counter,

    /// Current-revision reads.
    pub current_revision_total: Counter,

    /// Compact-revision interval reads.
    pub compact_revision_total: Counter,

    /// Compaction passes started.
    pub compact_passes_total: Counter,

    /// Compaction transactions attempted (includes retries).
    pub compact_batches_total: Counter,

    /// Events fanned out to watch subscribers.
    pub watch_events_total: Counter,

    /// Currently registered watch subscribers.
    pub watch_subscribers: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let ops_total = Family::<OpLabels, Counter>::default();
        registry.register(
            "revkv_ops_total",
            "Completed driver operations by statement tag",
            ops_total.clone(),
        );

        let op_failures_total = Family::<OpLabels, Counter>::default();
        registry.register(
            "revkv_op_failures_total",
            "Failed driver operations by statement tag",
            op_failures_total.clone(),
        );

        // Buckets from 100µs to ~3s; the tail is dominated by busy
        // retries and compaction transactions.
        let op_duration_seconds = Family::<OpLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.0001, 2.0, 15))
        });
        registry.register(
            "revkv_op_duration_seconds",
            "Driver operation latency in seconds",
            op_duration_seconds.clone(),
        );

        let sql_retries_total = Counter::default();
        registry.register(
            "revkv_sql_retries_total",
            "Transient-error retries performed by the driver",
            sql_retries_total.clone(),
        );

        let creates_total = Counter::default();
        registry.register("revkv_creates_total", "Create requests", creates_total.clone());

        let updates_total = Counter::default();
        registry.register("revkv_updates_total", "Update requests", updates_total.clone());

        let deletes_total = Counter::default();
        registry.register("revkv_deletes_total", "Delete requests", deletes_total.clone());

        let fills_total = Counter::default();
        registry.register("revkv_fills_total", "Gap-fill inserts", fills_total.clone());

        let delete_revision_total = Counter::default();
        registry.register(
            "revkv_delete_revision_total",
            "Explicit single-revision deletes",
            delete_revision_total.clone(),
        );

        let current_revision_total = Counter::default();
        registry.register(
            "revkv_current_revision_total",
            "Current-revision reads",
            current_revision_total.clone(),
        );

        let compact_revision_total = Counter::default();
        registry.register(
            "revkv_compact_revision_total",
            "Compact-revision interval reads",
            compact_revision_total.clone(),
        );

        let compact_passes_total = Counter::default();
        registry.register(
            "revkv_compact_passes_total",
            "Compaction passes started",
            compact_passes_total.clone(),
        );

        let compact_batches_total = Counter::default();
        registry.register(
            "revkv_compact_batches_total",
            "Compaction transactions attempted",
            compact_batches_total.clone(),
        );

        let watch_events_total = Counter::default();
        registry.register(
            "revkv_watch_events_total",
            "Events fanned out to watch subscribers",
            watch_events_total.clone(),
        );

        let watch_subscribers = Gauge::default();
        registry.register(
            "revkv_watch_subscribers",
            "Currently registered watch subscribers",
            watch_subscribers.clone(),
        );

        Self {
            registry,
            ops_total,
            op_failures_total,
            op_duration_seconds,
            sql_retries_total,
            creates_total,
            updates_total,
            deletes_total,
            fills_total,
            delete_revision_total,
            current_revision_total,
            compact_revision_total,
            compact_passes_total,
            compact_batches_total,
            watch_events_total,
            watch_subscribers,
        }
    }

    /// Records the outcome and duration of one driver operation.
    pub fn record_op(&self, op: &str, started: Instant, ok: bool) {
        let labels = OpLabels::new(op);
        self.ops_total.get_or_create(&labels).inc();
        if !ok {
            self.op_failures_total.get_or_create(&labels).inc();
        }
        self.op_duration_seconds
            .get_or_create(&labels)
            .observe(started.elapsed().as_secs_f64());
    }

    /// Encodes all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}
