//! # Store Facade & Lifecycle
//!
//! [`RevKv`] is the public async handle: it owns the driver, the
//! engine, and the two background tasks (compactor and watch poller),
//! and it choreographs startup and shutdown.
//!
//! Startup order matters: pool open (retried for up to five minutes) →
//! schema migrations (fatal on error) → engine (primes the compact
//! watermark) → background tasks. Shutdown is the reverse: signal both
//! tasks, wait for them to drain, then close the pool. Background tasks
//! never exit on an operation error — they log and try again at the
//! next tick; only cancellation stops them.
//!
//! `RevKv` is `Clone`, `Send`, and `Sync`; clones share everything.
//!
//! ## Rust Concepts
//!
//! - **Facade over actors**: `RevKv` holds channels and `Arc`s, never a
//!   connection — every method is a message round trip, so the handle
//!   can be cloned into as many tasks as needed
//! - **`tokio::sync::watch` as a shutdown signal**: one sender, every
//!   background task holds a receiver and selects on `changed()`
//! - **`JoinHandle` collection**: shutdown awaits the tasks it spawned,
//!   so "drained" means *finished*, not merely signaled

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch as shutdown_signal;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::compact::spawn_compactor;
use crate::config::Config;
use crate::driver::Driver;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::schema;
use crate::types::{KvRow, Revision};
use crate::watch::{spawn_poller, Subscription, WatchHub};

/// Wall-clock budget for a signal-triggered shutdown.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

/// The async key/value store handle.
///
/// # Example
///
/// ```rust,no_run
/// use revkv::{Config, RevKv, Revision};
///
/// # async fn example() -> revkv::Result<()> {
/// let store = RevKv::open(Config::new("kv.db")).await?;
///
/// let rev = store.create("/registry/pods/web", b"spec", 0).await?;
/// assert!(rev.is_some(), "key was fresh");
///
/// let mut watch = store.watch("/registry/", Revision::ZERO).await?;
/// while let Some(event) = watch.next().await {
///     println!("{:?}", event?);
/// }
///
/// store.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RevKv {
    engine: Arc<Engine>,
    metrics: Arc<Metrics>,
    driver: Driver,
    hub: WatchHub,
    shutdown_tx: Arc<shutdown_signal::Sender<bool>>,
    tasks: Arc<AsyncMutex<Vec<JoinHandle<()>>>>,
}

impl RevKv {
    /// Opens the store with a fresh metrics registry.
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with_metrics(config, Arc::new(Metrics::new())).await
    }

    /// Opens the store recording into a caller-owned metrics handle
    /// (useful when one process scrapes several engines).
    pub async fn open_with_metrics(config: Config, metrics: Arc<Metrics>) -> Result<Self> {
        let driver = Driver::open(&config, Arc::clone(&metrics)).await?;
        schema::migrate(&driver).await?;
        let engine = Arc::new(Engine::new(driver.clone(), Arc::clone(&metrics)).await?);

        let (shutdown_tx, shutdown_rx) = shutdown_signal::channel(false);
        let mut tasks = Vec::new();
        match config.compact_interval() {
            Some(interval) => {
                tasks.push(spawn_compactor(
                    Arc::clone(&engine),
                    interval,
                    config.compact_retention(),
                    shutdown_rx.clone(),
                ));
            }
            None => info!("compaction disabled by configuration"),
        }
        let (hub, poller) = spawn_poller(
            Arc::clone(&engine),
            Arc::clone(&metrics),
            config.poll_interval(),
            config.watch_query_timeout(),
            shutdown_rx,
        );
        tasks.push(poller);

        info!(path = %config.path.display(), "store opened");
        Ok(Self {
            engine,
            metrics,
            driver,
            hub,
            shutdown_tx: Arc::new(shutdown_tx),
            tasks: Arc::new(AsyncMutex::new(tasks)),
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Creates `key` iff it has no live row. Returns the new revision,
    /// or `None` when the key already exists.
    pub async fn create(&self, key: &str, value: &[u8], lease: i64) -> Result<Option<Revision>> {
        self.engine.create(key, value, lease).await
    }

    /// Updates `key` iff its live revision equals `expected_rev`.
    /// Returns the new revision, or `None` on a CAS miss.
    pub async fn update(
        &self,
        key: &str,
        value: &[u8],
        expected_rev: Revision,
        lease: i64,
    ) -> Result<Option<Revision>> {
        self.engine.update(key, value, expected_rev, lease).await
    }

    /// Tombstones `key` iff its live revision equals `expected_rev`.
    /// Returns the tombstone's revision, or `None` on a CAS miss.
    pub async fn delete(&self, key: &str, expected_rev: Revision) -> Result<Option<Revision>> {
        self.engine.delete(key, expected_rev).await
    }

    /// Deletes exactly one row by id, bypassing MVCC bookkeeping.
    /// Maintenance tooling only.
    pub async fn delete_revision(&self, revision: Revision) -> Result<()> {
        self.engine.delete_revision(revision).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The live row for `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<KvRow>> {
        let rows = self.engine.list_current(key, "", 1, false).await?;
        Ok(rows.into_iter().next().filter(|row| row.name == key))
    }

    /// Newest row per key under `prefix` at the current revision.
    /// `start_key` (when non-empty) makes the range begin strictly
    /// after it; `limit = 0` means unlimited.
    pub async fn list_current(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        include_deleted: bool,
    ) -> Result<Vec<KvRow>> {
        self.engine
            .list_current(prefix, start_key, limit, include_deleted)
            .await
    }

    /// MVCC range read as of `revision`. Fails `Compacted` below the
    /// watermark.
    pub async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: Revision,
        include_deleted: bool,
    ) -> Result<Vec<KvRow>> {
        self.engine
            .list(prefix, start_key, limit, revision, include_deleted)
            .await
    }

    /// `(current_revision, live key count)` under `prefix`.
    pub async fn count_current(&self, prefix: &str, start_key: &str) -> Result<(Revision, i64)> {
        self.engine.count_current(prefix, start_key).await
    }

    /// `(current_revision, live key count)` as of `revision`.
    pub async fn count(
        &self,
        prefix: &str,
        start_key: &str,
        revision: Revision,
    ) -> Result<(Revision, i64)> {
        self.engine.count(prefix, start_key, revision).await
    }

    /// The store's current revision.
    pub async fn current_revision(&self) -> Result<Revision> {
        self.engine.current_revision().await
    }

    /// `(compact watermark, current revision)`.
    pub async fn compact_revision(&self) -> Result<(Revision, Revision)> {
        self.engine.compact_revision().await
    }

    /// Logical database size in bytes.
    pub async fn size(&self) -> Result<i64> {
        self.engine.get_size().await
    }

    // =========================================================================
    // Watch & compaction
    // =========================================================================

    /// Subscribes to changes under `prefix` after `start_rev`. See
    /// [`WatchHub::watch`].
    pub async fn watch(&self, prefix: &str, start_rev: Revision) -> Result<Subscription> {
        self.hub.watch(prefix, start_rev).await
    }

    /// Explicitly compacts history up to `revision` (clamped to the
    /// current revision), regardless of the retention window. Returns
    /// the resulting watermark.
    pub async fn compact(&self, revision: Revision) -> Result<Revision> {
        self.engine.compact(revision).await
    }

    /// The metrics handle this store records into.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Direct access to the underlying engine, for adapter layers that
    /// need the raw statement set (tail reads, maintenance tooling).
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Graceful shutdown: stop the background tasks, wait for them to
    /// drain, then close the pool. Operations on any clone fail with
    /// `Closed` afterwards.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        self.driver.close().await;
        info!("store shut down");
    }

    /// Runs until the process receives SIGINT, SIGTERM, or SIGQUIT,
    /// then shuts down within a 30-second budget.
    #[cfg(unix)]
    pub async fn run_until_signal(self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())
            .map_err(|e| Error::Schema(format!("failed to install SIGINT handler: {e}")))?;
        let mut terminate = signal(SignalKind::terminate())
            .map_err(|e| Error::Schema(format!("failed to install SIGTERM handler: {e}")))?;
        let mut quit = signal(SignalKind::quit())
            .map_err(|e| Error::Schema(format!("failed to install SIGQUIT handler: {e}")))?;

        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
            _ = quit.recv() => info!("received SIGQUIT"),
        }

        match tokio::time::timeout(SHUTDOWN_BUDGET, self.shutdown()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(budget = ?SHUTDOWN_BUDGET, "shutdown budget exceeded");
                Err(Error::Canceled("shutdown budget exceeded"))
            }
        }
    }
}
