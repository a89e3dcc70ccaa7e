//! # SQL Driver
//!
//! The connection pool and the retry/rewrite policy that every SQL
//! statement in the crate flows through. SQLite connections are not
//! `Sync`, so the pool is built from dedicated threads talking over
//! channels:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Async Tasks                            │
//! │   engine ops ── mpsc ──┐            ┌── mpsc ── watch poller  │
//! └────────────────────────┼────────────┼─────────────────────────┘
//!                          │            │
//!                          ▼            ▼
//!                 ┌───────────────┐  ┌─────────────────────┐
//!                 │ Writer thread │  │   Reader threads    │
//!                 │ (1, owns RW   │  │ (N, read-only conns │
//!                 │  connection)  │  │  compete for work)  │
//!                 └───────┬───────┘  └──────────┬──────────┘
//!                         └───────┬─────────────┘
//!                                 ▼
//!                         SQLite (WAL mode)
//! ```
//!
//! ## Policy
//!
//! - **Retry**: any error the pluggable predicate classifies as
//!   transient is re-issued immediately, up to [`MAX_RETRIES`] times
//!   with no backoff — the engine is expected to apply its own
//!   admission control. Exhaustion surfaces
//!   [`Error::Unavailable`] carrying the attempt count.
//! - **Parameter style**: statements are authored with `?` placeholders
//!   and rewritten once per distinct text to the configured style; the
//!   results are cached in an LRU so dynamically assembled texts
//!   (`... LIMIT ?` variants) do not re-rewrite.
//! - **Statement cache**: every worker uses `prepare_cached`, so
//!   identical SQL never re-prepares until its connection is recycled.
//! - **Write gate**: when `lock_writes` is set, a process-wide async
//!   mutex serializes `execute`/`transaction` end to end. Reads never
//!   take it.
//! - **Open**: open-and-ping is attempted up to 300 times, one second
//!   apart, before giving up.
//!
//! ## The SQLite Challenge
//!
//! SQLite's `Connection` uses interior mutability and is `!Sync`, so it
//! cannot be shared across threads behind an `Arc`. Instead of fighting
//! that, each connection is *owned* by one dedicated thread and async
//! callers talk to it over channels. The request/response round trip is
//! the suspension point the rest of the crate awaits on.
//!
//! ## Rust Concepts
//!
//! - **`tokio::sync::mpsc`**: async request channels into the worker
//!   threads; workers drain them with `blocking_recv` (no runtime needed
//!   on the worker side)
//! - **`tokio::sync::oneshot`**: single-use response channel per request
//! - **`Arc<Mutex<Receiver>>`**: reader threads compete for the next
//!   request — whichever thread is free picks it up, which is all the
//!   load balancing a read pool needs
//! - **`Arc<str>`**: rewritten SQL is shared between the cache, the
//!   retry loop, and the request without copying the text

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::{self, available_parallelism, JoinHandle};
use std::time::{Duration, Instant};

use lru::LruCache;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, trace};

use crate::config::{Config, ParamStyle};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

// =============================================================================
// Tunables
// =============================================================================

/// Upper bound on transparent retries of a single statement.
pub const MAX_RETRIES: usize = 500;

/// Attempts to open and ping the database before open fails for good.
const OPEN_ATTEMPTS: usize = 300;

/// Delay between open attempts.
const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pings issued against a fresh connection before it is accepted.
const PING_COUNT: usize = 3;

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

/// Size of the write request channel.
const WRITE_CHANNEL_SIZE: usize = 1024;

/// Bounds on the reader-thread count when sizing from the CPU count.
const MIN_READERS: usize = 1;
const MAX_READERS: usize = 16;

/// Per-connection prepared-statement cache capacity.
const STATEMENT_CACHE_CAPACITY: usize = 64;

/// Entries kept in the parameter-rewrite cache.
const REWRITE_CACHE_CAPACITY: usize = 128;

/// Execute attempts logged at trace before escalating to debug.
const EXEC_TRACE_ATTEMPTS: usize = 2;

// =============================================================================
// Public driver types
// =============================================================================

/// One result row: column values in select order.
pub type DriverRow = Vec<Value>;

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy)]
pub struct ExecResult {
    /// Rows the statement inserted, updated, or deleted.
    pub rows_affected: u64,
    /// Rowid of the last inserted row on this connection. Only
    /// meaningful when `rows_affected > 0` after an insert.
    pub last_insert_id: i64,
}

/// Pluggable classification of retry-worthy errors.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

// =============================================================================
// Worker requests
// =============================================================================

enum ReadRequest {
    Query {
        sql: Arc<str>,
        args: Vec<Value>,
        response: oneshot::Sender<Result<Vec<DriverRow>>>,
    },
    Shutdown,
}

enum WriteRequest {
    Execute {
        sql: Arc<str>,
        args: Vec<Value>,
        response: oneshot::Sender<Result<ExecResult>>,
    },
    Transaction {
        statements: Vec<(Arc<str>, Vec<Value>)>,
        response: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

// =============================================================================
// Parameter-style rewriting
// =============================================================================

/// Rewrites canonical `?` placeholders into the configured style, caching
/// results by the canonical text.
struct Rewriter {
    style: ParamStyle,
    cache: StdMutex<LruCache<String, Arc<str>>>,
}

impl Rewriter {
    fn new(style: ParamStyle) -> Self {
        let capacity = REWRITE_CACHE_CAPACITY.try_into().expect("nonzero capacity");
        Self {
            style,
            cache: StdMutex::new(LruCache::new(capacity)),
        }
    }

    fn rewrite(&self, sql: &str) -> Arc<str> {
        let mut cache = self.cache.lock().expect("rewrite cache poisoned");
        if let Some(hit) = cache.get(sql) {
            return hit.clone();
        }
        let rewritten: Arc<str> = match self.style {
            ParamStyle::Positional => Arc::from(sql),
            ParamStyle::Numbered(prefix) => Arc::from(rewrite_numbered(sql, prefix)),
        };
        cache.put(sql.to_string(), rewritten.clone());
        rewritten
    }
}

/// Replaces each `?` with `<prefix><n>`, numbering from 1.
fn rewrite_numbered(sql: &str, prefix: char) -> String {
    let mut out = String::with_capacity(sql.len() + 16);
    let mut n = 0u32;
    for ch in sql.chars() {
        if ch == '?' {
            n += 1;
            out.push(prefix);
            out.push_str(&n.to_string());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Collapses whitespace for one-line statement logging.
fn strip_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

// =============================================================================
// Driver
// =============================================================================

struct DriverInner {
    read_tx: mpsc::Sender<ReadRequest>,
    write_tx: mpsc::Sender<WriteRequest>,
    write_gate: Option<AsyncMutex<()>>,
    retryable: RetryPredicate,
    rewriter: Rewriter,
    metrics: Arc<Metrics>,
    reader_count: usize,
    writer_handle: StdMutex<Option<JoinHandle<()>>>,
    reader_handles: StdMutex<Vec<JoinHandle<()>>>,
}

/// Async handle to the connection pool. Cheap to clone; all clones share
/// the same workers.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    /// Opens the pool with the default retry predicate
    /// ([`Error::is_retryable`]).
    pub async fn open(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        Self::open_with_retry(config, metrics, Arc::new(Error::is_retryable)).await
    }

    /// Opens the pool with a custom retry predicate.
    ///
    /// Retries open-and-ping up to 300 times with one-second waits; the
    /// last translated error is returned if every attempt fails.
    pub async fn open_with_retry(
        config: &Config,
        metrics: Arc<Metrics>,
        retryable: RetryPredicate,
    ) -> Result<Self> {
        let path = config.path.clone();

        let mut writer_conn = None;
        let mut last_err = None;
        for attempt in 0..OPEN_ATTEMPTS {
            let path = path.clone();
            let outcome = tokio::task::spawn_blocking(move || open_writer(&path))
                .await
                .map_err(|_| Error::Canceled("open task aborted"))?;
            match outcome {
                Ok(conn) => {
                    writer_conn = Some(conn);
                    break;
                }
                Err(err) => {
                    error!(attempt, error = %err, "failed to open and ping database");
                    last_err = Some(err);
                    tokio::time::sleep(OPEN_RETRY_DELAY).await;
                }
            }
        }
        let writer_conn = match writer_conn {
            Some(conn) => conn,
            None => return Err(last_err.unwrap_or(Error::Closed)),
        };

        let reader_count = reader_count(config.pool.max_open);
        let idle_conns = config.pool.idle_conns();
        debug!(
            reader_count,
            idle_conns,
            max_lifetime = ?config.pool.max_lifetime,
            max_idle_time = ?config.pool.max_idle_time,
            lock_writes = config.lock_writes,
            "configuring connection pool"
        );

        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
        let writer_handle = thread::Builder::new()
            .name("revkv-writer".to_string())
            .spawn(move || run_writer(writer_conn, write_rx))
            .map_err(|e| Error::Schema(format!("failed to spawn writer thread: {e}")))?;

        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let read_rx = Arc::new(StdMutex::new(read_rx));
        let mut reader_handles = Vec::with_capacity(reader_count);
        for index in 0..reader_count {
            let rx = Arc::clone(&read_rx);
            let path = path.clone();
            let keep_open = index < idle_conns;
            let max_lifetime = config.pool.max_lifetime.filter(|d| !d.is_zero());
            let max_idle_time = config.pool.max_idle_time.filter(|d| !d.is_zero());
            let handle = thread::Builder::new()
                .name(format!("revkv-reader-{index}"))
                .spawn(move || run_reader(path, keep_open, max_lifetime, max_idle_time, rx))
                .map_err(|e| Error::Schema(format!("failed to spawn reader thread: {e}")))?;
            reader_handles.push(handle);
        }

        Ok(Self {
            inner: Arc::new(DriverInner {
                read_tx,
                write_tx,
                write_gate: config.lock_writes.then(|| AsyncMutex::new(())),
                retryable,
                rewriter: Rewriter::new(config.param_style),
                metrics,
                reader_count,
                writer_handle: StdMutex::new(Some(writer_handle)),
                reader_handles: StdMutex::new(reader_handles),
            }),
        })
    }

    /// Runs a read statement, returning materialized rows.
    ///
    /// Transient errors are retried without backoff up to
    /// [`MAX_RETRIES`]; the outcome is recorded in telemetry under
    /// `tag`.
    pub async fn query(
        &self,
        tag: &'static str,
        sql: &str,
        args: Vec<Value>,
    ) -> Result<Vec<DriverRow>> {
        let sql = self.inner.rewriter.rewrite(sql);
        let started = Instant::now();
        let mut attempt = 0usize;
        let result = loop {
            if attempt == 0 {
                trace!(tag, attempt, sql = %strip_sql(&sql), "QUERY");
            } else {
                debug!(tag, attempt, sql = %strip_sql(&sql), "QUERY");
            }

            let (tx, rx) = oneshot::channel();
            let request = ReadRequest::Query {
                sql: sql.clone(),
                args: args.clone(),
                response: tx,
            };
            if self.inner.read_tx.send(request).await.is_err() {
                break Err(Error::Closed);
            }
            match rx.await {
                Ok(Ok(rows)) => break Ok(rows),
                Ok(Err(err)) => match self.classify_retry(err, &mut attempt) {
                    None => continue,
                    Some(final_err) => break Err(final_err),
                },
                Err(_) => break Err(Error::Closed),
            }
        };
        self.inner.metrics.record_op(tag, started, result.is_ok());
        if let Err(err) = &result {
            debug!(tag, attempts = attempt + 1, error = %err, "query failed");
        }
        result
    }

    /// Runs a write statement, returning rows affected and the last
    /// insert id. Same retry policy as [`Driver::query`]; additionally
    /// serialized behind the write gate when `lock_writes` is enabled.
    pub async fn execute(
        &self,
        tag: &'static str,
        sql: &str,
        args: Vec<Value>,
    ) -> Result<ExecResult> {
        let _gate = match &self.inner.write_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let sql = self.inner.rewriter.rewrite(sql);
        let started = Instant::now();
        let mut attempt = 0usize;
        let result = loop {
            if attempt > EXEC_TRACE_ATTEMPTS {
                debug!(tag, attempt, sql = %strip_sql(&sql), "EXEC");
            } else {
                trace!(tag, attempt, sql = %strip_sql(&sql), "EXEC");
            }

            let (tx, rx) = oneshot::channel();
            let request = WriteRequest::Execute {
                sql: sql.clone(),
                args: args.clone(),
                response: tx,
            };
            if self.inner.write_tx.send(request).await.is_err() {
                break Err(Error::Closed);
            }
            match rx.await {
                Ok(Ok(result)) => break Ok(result),
                Ok(Err(err)) => match self.classify_retry(err, &mut attempt) {
                    None => continue,
                    Some(final_err) => break Err(final_err),
                },
                Err(_) => break Err(Error::Closed),
            }
        };
        self.inner.metrics.record_op(tag, started, result.is_ok());
        if let Err(err) = &result {
            debug!(tag, attempts = attempt + 1, error = %err, "exec failed");
        }
        result
    }

    /// Runs several write statements in one SQL transaction on the
    /// writer connection. Not retried internally — callers that want
    /// the whole transaction retried loop on [`Error::is_retryable`]
    /// themselves.
    pub async fn transaction(
        &self,
        tag: &'static str,
        statements: Vec<(String, Vec<Value>)>,
    ) -> Result<()> {
        let _gate = match &self.inner.write_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let started = Instant::now();
        let statements = statements
            .into_iter()
            .map(|(sql, args)| (self.inner.rewriter.rewrite(&sql), args))
            .collect();
        let (tx, rx) = oneshot::channel();
        let request = WriteRequest::Transaction {
            statements,
            response: tx,
        };
        let result = if self.inner.write_tx.send(request).await.is_err() {
            Err(Error::Closed)
        } else {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Closed),
            }
        };
        self.inner.metrics.record_op(tag, started, result.is_ok());
        result
    }

    /// Decides whether to retry: bumps the attempt counter and returns
    /// `None` to go again, or the final error to surface.
    fn classify_retry(&self, err: Error, attempt: &mut usize) -> Option<Error> {
        if !(self.inner.retryable)(&err) {
            return Some(err);
        }
        if *attempt + 1 >= MAX_RETRIES {
            return Some(Error::Unavailable {
                attempts: *attempt + 1,
                source: Box::new(err),
            });
        }
        *attempt += 1;
        self.inner.metrics.sql_retries_total.inc();
        None
    }

    /// Number of reader threads in the pool.
    pub fn reader_count(&self) -> usize {
        self.inner.reader_count
    }

    /// Shuts the pool down: signals every worker and joins the threads.
    /// Subsequent operations fail with [`Error::Closed`].
    pub async fn close(&self) {
        let _ = self.inner.write_tx.send(WriteRequest::Shutdown).await;
        for _ in 0..self.inner.reader_count {
            let _ = self.inner.read_tx.send(ReadRequest::Shutdown).await;
        }

        if let Some(handle) = self
            .inner
            .writer_handle
            .lock()
            .expect("writer handle mutex poisoned")
            .take()
        {
            let _ = handle.join();
        }
        let handles = std::mem::take(
            &mut *self
                .inner
                .reader_handles
                .lock()
                .expect("reader handles mutex poisoned"),
        );
        for handle in handles {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Connection setup
// =============================================================================

fn reader_count(max_open: usize) -> usize {
    let from_cpus = || {
        available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_READERS)
    };
    let count = if max_open == 0 { from_cpus() } else { max_open };
    count.clamp(MIN_READERS, MAX_READERS)
}

fn open_writer(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    ping(&conn)?;
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    // WAL keeps readers unblocked by the writer; NORMAL syncs the WAL on
    // commit only.
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    Ok(conn)
}

fn open_reader(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    ping(&conn)?;
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    Ok(conn)
}

fn ping(conn: &Connection) -> Result<()> {
    for _ in 0..PING_COUNT {
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
    }
    Ok(())
}

// =============================================================================
// Worker loops
// =============================================================================

fn run_writer(mut conn: Connection, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            WriteRequest::Execute {
                sql,
                args,
                response,
            } => {
                let _ = response.send(execute_on(&conn, &sql, args));
            }
            WriteRequest::Transaction {
                statements,
                response,
            } => {
                let _ = response.send(transaction_on(&mut conn, statements));
            }
            WriteRequest::Shutdown => break,
        }
    }
}

/// A reader connection with its age, for lifetime recycling.
struct ReaderConn {
    conn: Connection,
    opened_at: Instant,
}

fn run_reader(
    path: PathBuf,
    keep_open: bool,
    max_lifetime: Option<Duration>,
    max_idle_time: Option<Duration>,
    rx: Arc<StdMutex<mpsc::Receiver<ReadRequest>>>,
) {
    let mut slot: Option<ReaderConn> = None;
    let mut last_used = Instant::now();

    loop {
        // Readers compete for the next request; the lock is released as
        // soon as one is received, so the others keep draining the queue
        // while this one serves.
        let request = {
            let mut guard = rx.lock().expect("reader channel mutex poisoned");
            guard.blocking_recv()
        };
        let (sql, args, response) = match request {
            Some(ReadRequest::Query {
                sql,
                args,
                response,
            }) => (sql, args, response),
            Some(ReadRequest::Shutdown) | None => break,
        };

        // Recycle a connection that outlived its limits before reuse.
        if let Some(held) = &slot {
            let over_lifetime = max_lifetime.is_some_and(|d| held.opened_at.elapsed() > d);
            let over_idle = max_idle_time.is_some_and(|d| last_used.elapsed() > d);
            if over_lifetime || over_idle {
                slot = None;
            }
        }
        if slot.is_none() {
            match open_reader(&path) {
                Ok(conn) => {
                    slot = Some(ReaderConn {
                        conn,
                        opened_at: Instant::now(),
                    })
                }
                Err(err) => {
                    let _ = response.send(Err(err));
                    continue;
                }
            }
        }

        let held = slot.as_ref().expect("reader connection just opened");
        let _ = response.send(query_on(&held.conn, &sql, args));
        last_used = Instant::now();

        // Surplus readers (beyond max-idle) don't hold a connection
        // across idle periods.
        if !keep_open {
            slot = None;
        }
    }
}

fn query_on(conn: &Connection, sql: &str, args: Vec<Value>) -> Result<Vec<DriverRow>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params_from_iter(args))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            values.push(row.get::<_, Value>(index)?);
        }
        out.push(values);
    }
    Ok(out)
}

fn execute_on(conn: &Connection, sql: &str, args: Vec<Value>) -> Result<ExecResult> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows_affected = stmt.execute(rusqlite::params_from_iter(args))? as u64;
    Ok(ExecResult {
        rows_affected,
        last_insert_id: conn.last_insert_rowid(),
    })
}

fn transaction_on(conn: &mut Connection, statements: Vec<(Arc<str>, Vec<Value>)>) -> Result<()> {
    let tx = conn.transaction()?;
    for (sql, args) in statements {
        tx.prepare_cached(&sql)?
            .execute(rusqlite::params_from_iter(args))?;
    }
    tx.commit()?;
    Ok(())
}
