//! # Revision-Log Engine
//!
//! This module is the heart of revkv: the SQL statement set and the
//! semantics of every key/value primitive on top of the `kine` log.
//!
//! ## How One Table Becomes an MVCC Store
//!
//! ```text
//! kine rows for key "foo" over time:
//!
//!   id │ created deleted │ create_rev prev_rev │ value  old_value
//!   ───┼─────────────────┼─────────────────────┼─────────────────
//!    1 │    1       0    │     0        0      │ "1"    NULL       Create
//!    2 │    0       0    │     1        1      │ "2"    "1"        Update
//!    3 │    0       1    │     1        2      │ NULL   "2"        Delete
//!    4 │    1       0    │     0        3      │ "x"    NULL       Create (new life)
//! ```
//!
//! - **Revisions are row ids.** The engine assigns them; they only grow.
//! - **Writes are conditional inserts.** Create/Update/Delete are each a
//!   single `INSERT … SELECT` whose subquery pins the current head row
//!   of the key. When the condition fails the insert materializes zero
//!   rows — the SQL engine arbitrates the race, there is no
//!   read-then-write window, and a miss is reported as `Ok(None)`
//!   rather than an error.
//! - **Reads at a revision are one self-join.** An inner aggregate
//!   picks `MAX(id)` per name within the range (optionally bounded by
//!   `id <= rev`), the join materializes those rows, tombstones are
//!   filtered unless asked for, ordering is `name ASC, id ASC`.
//! - **Create-revision carry-forward.** An update/delete copies the
//!   life-cycle root from its predecessor: the predecessor's own id if
//!   it was a create, else its stored `create_revision`.
//! - **Compaction is windowed.** One transaction deletes the rows
//!   superseded inside `(compact, target]`, then the tombstones in the
//!   window, then advances the sentinel watermark with
//!   `MAX(prev_revision, target)`. Reads below the watermark fail
//!   `Compacted`; the watermark is cached so the common rejection is
//!   free.
//!
//! ## Systems Concept: The SQL Engine Is the Arbiter
//!
//! There is no lock manager in this crate. Every race — two creates of
//! the same key, concurrent CAS updates, a gap fill losing to a real
//! write — is decided by the database inside a single statement. The
//! engine only inspects the outcome (`rows_affected`, the last insert
//! id, a constraint code). This is what makes the primitives correct
//! under arbitrary concurrency without a read-then-write window.
//!
//! ## Special Rows
//!
//! The sentinel row (`compact_rev_key`, id 0) and gap rows (`gap-<id>`,
//! minted by the watch poller to close id holes) live in the same
//! table; range scans exclude the sentinel by name, and gap rows are
//! ordinary tombstones that compaction eventually removes.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use rusqlite::types::Value;
use tracing::{debug, warn};

use crate::driver::{Driver, ExecResult, MAX_RETRIES};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::types::{decode_scalar_i64, KvRow, Revision};

/// Canonical column list, in [`KvRow::from_values`] order.
const COLUMNS: &str = "kv.id, kv.name, kv.created, kv.deleted, kv.create_revision, \
                       kv.prev_revision, kv.lease, kv.value, kv.old_value";

/// `MAX(id)` over the whole log (the sentinel sits at id 0 and never
/// wins).
const REV_SQL: &str = "SELECT MAX(rkv.id) AS id FROM kine AS rkv";

/// Compact watermark and current revision in one round trip.
const REVISION_INTERVAL_SQL: &str = "\
SELECT (
    SELECT MAX(prev_revision)
    FROM kine
    WHERE name = 'compact_rev_key'
) AS low, (
    SELECT MAX(id)
    FROM kine
) AS high";

/// Conditional insert for Create: succeeds only when the key has no row
/// at all or its newest row is a tombstone. A resurrected key points
/// `prev_revision` at the tombstone.
const CREATE_SQL: &str = "\
INSERT INTO kine (name, created, deleted, create_revision, prev_revision, lease, value, old_value)
SELECT
    ? AS name,
    1 AS created,
    0 AS deleted,
    0 AS create_revision,
    COALESCE(id, 0) AS prev_revision,
    ? AS lease,
    ? AS value,
    NULL AS old_value
FROM (
    SELECT MAX(id) AS id, deleted
    FROM kine
    WHERE name = ?
) AS maxkv
WHERE maxkv.deleted = 1 OR id IS NULL";

/// Conditional insert for Update: succeeds only when the key's newest
/// row is live and its id equals the caller's expected revision.
const UPDATE_SQL: &str = "\
INSERT INTO kine (name, created, deleted, create_revision, prev_revision, lease, value, old_value)
SELECT
    ? AS name,
    0 AS created,
    0 AS deleted,
    CASE
        WHEN kine.created THEN id
        ELSE create_revision
    END AS create_revision,
    id AS prev_revision,
    ? AS lease,
    ? AS value,
    value AS old_value
FROM kine
WHERE id = (SELECT MAX(id) FROM kine WHERE name = ?)
    AND deleted = 0
    AND id = ?";

/// Conditional insert for Delete: same CAS predicate as Update, but the
/// new row is a tombstone carrying the superseded value in `old_value`.
const DELETE_SQL: &str = "\
INSERT INTO kine (name, created, deleted, create_revision, prev_revision, lease, value, old_value)
SELECT
    name,
    0 AS created,
    1 AS deleted,
    CASE
        WHEN kine.created THEN id
        ELSE create_revision
    END AS create_revision,
    id AS prev_revision,
    lease,
    NULL AS value,
    value AS old_value
FROM kine
WHERE id = (SELECT MAX(id) FROM kine WHERE name = ?)
    AND deleted = 0
    AND id = ?";

/// Synthetic tombstone with an explicit id, closing a gap left by a
/// failed write transaction.
const FILL_SQL: &str = "\
INSERT INTO kine (id, name, created, deleted, create_revision, prev_revision, lease, value, old_value)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

const DELETE_REV_SQL: &str = "DELETE FROM kine WHERE id = ?";

/// Advances the compact watermark in place. `MAX` keeps it monotonic
/// even if passes race or replay.
const UPDATE_COMPACT_SQL: &str = "\
UPDATE kine
SET prev_revision = MAX(prev_revision, ?)
WHERE name = 'compact_rev_key'";

/// First compaction delete: rows superseded by an update or delete
/// inside the window.
///
/// The `created = 0` condition guards against historical rows that set
/// `prev_revision = MAX(id)` on create due to an old defect; without it
/// a live predecessor of such a row could be deleted. The guard is
/// permanent.
const COMPACT_SUPERSEDED_SQL: &str = "\
DELETE FROM kine
WHERE id IN (
    SELECT prev_revision
    FROM kine
    WHERE name != 'compact_rev_key'
        AND created = 0
        AND prev_revision != 0
        AND ? < id AND id <= ?
)";

/// Second compaction delete: the tombstones themselves (including gap
/// rows, which are tombstones by construction).
const COMPACT_TOMBSTONES_SQL: &str = "\
DELETE FROM kine
WHERE deleted = 1
    AND ? < id AND id <= ?";

/// Logical database size: allocated minus free pages.
const GET_SIZE_SQL: &str = "\
SELECT (page_count - freelist_count) * page_size
FROM pragma_page_count(), pragma_freelist_count(), pragma_page_size()";

/// Tail read across all keys, for the watch poller.
const AFTER_SQL: &str = "SELECT {columns} FROM kine AS kv WHERE kv.id > ? ORDER BY kv.id ASC";

/// Tail read restricted to a prefix range.
const AFTER_PREFIX_SQL: &str = "\
SELECT {columns}
FROM kine AS kv
WHERE kv.name >= ? AND kv.name < ? AND kv.name != 'compact_rev_key'
    AND kv.id > ?
ORDER BY kv.id ASC";

/// MVCC range read: inner aggregate picks the newest row per name in
/// the range (bounded by `id <= rev` when reading at a revision), the
/// join materializes it, tombstones are filtered unless requested.
const LIST_SQL: &str = "\
SELECT {columns}
FROM kine AS kv
JOIN (
    SELECT MAX(mkv.id) AS id
    FROM kine AS mkv
    WHERE mkv.name >= ? AND mkv.name < ? AND mkv.name != 'compact_rev_key'
        {rev_filter}
    GROUP BY mkv.name
) AS maxkv
    ON maxkv.id = kv.id
WHERE (kv.deleted = 0 OR ?)
ORDER BY kv.name ASC, kv.id ASC";

/// The revision-log engine: one instance per store.
///
/// # Construction
///
/// Built by [`RevKv::open`](crate::RevKv::open) after migrations run;
/// adapter layers can also construct one directly from a [`Driver`] when
/// they need the raw statement set without the background tasks:
///
/// ```rust,ignore
/// let driver = Driver::open(&config, Arc::clone(&metrics)).await?;
/// schema::migrate(&driver).await?;
/// let engine = Engine::new(driver, metrics).await?;
/// let tail = engine.after(Revision::ZERO, 500).await?;
/// ```
///
/// # Statement Ownership
///
/// The handful of statements that exist in base and `LIMIT ?` variants
/// are assembled once here and stored as fields; everything fixed lives
/// in consts above. The driver handles parameter-style rewriting and
/// prepared-statement caching, so these strings stay canonical `?` form.
pub struct Engine {
    driver: Driver,
    metrics: Arc<Metrics>,

    /// Cached compact watermark, advanced monotonically. Reads below it
    /// are rejected without touching the pool; it can lag the database
    /// only until the next interval read, and lagging is safe (a stale
    /// low value just defers the rejection to the SQL result).
    compact_watermark: AtomicI64,

    get_current_sql: String,
    get_current_limit_sql: String,
    list_revision_sql: String,
    list_revision_limit_sql: String,
    count_current_sql: String,
    count_revision_sql: String,
    after_sql: String,
    after_limit_sql: String,
    after_prefix_sql: String,
    after_prefix_limit_sql: String,
}

impl Engine {
    /// Builds the statement set and primes the watermark cache.
    pub async fn new(driver: Driver, metrics: Arc<Metrics>) -> Result<Self> {
        let current = LIST_SQL
            .replace("{columns}", COLUMNS)
            .replace("{rev_filter}\n", "");
        let at_revision = LIST_SQL
            .replace("{columns}", COLUMNS)
            .replace("{rev_filter}", "AND mkv.id <= ?");
        let after = AFTER_SQL.replace("{columns}", COLUMNS);
        let after_prefix = AFTER_PREFIX_SQL.replace("{columns}", COLUMNS);

        let engine = Self {
            driver,
            metrics,
            compact_watermark: AtomicI64::new(0),
            get_current_limit_sql: format!("{current} LIMIT ?"),
            count_current_sql: format!(
                "SELECT ({REV_SQL}), COUNT(*) FROM (\n{current}\n) AS c"
            ),
            count_revision_sql: format!(
                "SELECT ({REV_SQL}), COUNT(*) FROM (\n{at_revision}\n) AS c"
            ),
            get_current_sql: current,
            list_revision_limit_sql: format!("{at_revision} LIMIT ?"),
            list_revision_sql: at_revision,
            after_limit_sql: format!("{after} LIMIT ?"),
            after_sql: after,
            after_prefix_limit_sql: format!("{after_prefix} LIMIT ?"),
            after_prefix_sql: after_prefix,
        };

        // Prime the watermark cache so compacted reads are rejected from
        // the first request.
        engine.compact_revision().await?;
        Ok(engine)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Inserts a create row iff the key has no live row.
    ///
    /// # Semantics
    ///
    /// "No live row" means the key either never existed or its newest row
    /// is a tombstone. Creating over a tombstone starts a *new life-cycle*:
    /// the fresh row is its own create-revision root, and its
    /// `prev_revision` points at the tombstone so history stays linked.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(rev))` — the key was created at revision `rev`
    /// - `Ok(None)` — the key is already live (not an error; see the
    ///   module docs on CAS misses)
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty key
    /// - `Unavailable` when the engine stayed busy past the retry budget
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// match store.create("/registry/pods/web", b"spec", 0).await? {
    ///     Some(rev) => println!("created at revision {rev}"),
    ///     None => println!("someone else holds this key"),
    /// }
    /// ```
    pub async fn create(&self, key: &str, value: &[u8], lease: i64) -> Result<Option<Revision>> {
        validate_key(key)?;
        self.metrics.creates_total.inc();
        let result = self
            .driver
            .execute(
                "create_sql",
                CREATE_SQL,
                vec![
                    Value::Text(key.to_string()),
                    Value::Integer(lease),
                    Value::Blob(value.to_vec()),
                    Value::Text(key.to_string()),
                ],
            )
            .await?;
        Ok(insert_outcome(result))
    }

    /// Inserts an update row iff the key's live row has id
    /// `expected_rev`.
    ///
    /// # Systems Concept: Optimistic Concurrency Control
    ///
    /// Rather than locking the key between read and write (pessimistic),
    /// the caller presents the revision it *read* and the insert's
    /// subquery checks that the head is still exactly that row. Two
    /// racing updates with the same `expected_rev` resolve to exactly one
    /// winner; the loser sees `Ok(None)` and nothing else changes.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(rev))` — the update landed at revision `rev`
    /// - `Ok(None)` — CAS miss: the head moved, the key is tombstoned, or
    ///   it never existed (`expected_rev = 0` never matches an existing
    ///   key — resurrection goes through [`Engine::create`])
    ///
    /// # Recovery After a Miss
    ///
    /// 1. Re-read the key to learn the current revision and value
    /// 2. Re-apply the caller's logic against the fresh state
    /// 3. Retry with the new `expected_rev`
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let head = store.get("/config/flags").await?.expect("key exists");
    /// match store.update("/config/flags", b"v2", head.id, 0).await? {
    ///     Some(rev) => println!("now at revision {rev}"),
    ///     None => println!("lost the race, re-read and retry"),
    /// }
    /// ```
    pub async fn update(
        &self,
        key: &str,
        value: &[u8],
        expected_rev: Revision,
        lease: i64,
    ) -> Result<Option<Revision>> {
        validate_key(key)?;
        self.metrics.updates_total.inc();
        let result = self
            .driver
            .execute(
                "update_sql",
                UPDATE_SQL,
                vec![
                    Value::Text(key.to_string()),
                    Value::Integer(lease),
                    Value::Blob(value.to_vec()),
                    Value::Text(key.to_string()),
                    Value::Integer(expected_rev.get()),
                ],
            )
            .await?;
        Ok(insert_outcome(result))
    }

    /// Inserts a tombstone iff the key's live row has id
    /// `expected_rev`.
    ///
    /// # Why Delete Writes a Row
    ///
    /// Deletion is just another change in the log: the tombstone carries
    /// the superseded payload in `old_value` (watch events need it for
    /// `prev_kv`), the key's history stays readable at older revisions,
    /// and the row is physically removed only by compaction.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(rev))` — the key was tombstoned at revision `rev`
    /// - `Ok(None)` — CAS miss; the same `expected_rev` deletes at most
    ///   once, so "delete, then delete again" yields one success and one
    ///   miss
    pub async fn delete(&self, key: &str, expected_rev: Revision) -> Result<Option<Revision>> {
        validate_key(key)?;
        self.metrics.deletes_total.inc();
        let result = self
            .driver
            .execute(
                "delete_sql",
                DELETE_SQL,
                vec![
                    Value::Text(key.to_string()),
                    Value::Integer(expected_rev.get()),
                ],
            )
            .await?;
        Ok(insert_outcome(result))
    }

    /// Inserts a `gap-<rev>` tombstone at an explicit revision.
    ///
    /// `Error::Constraint` means the id got a real row concurrently;
    /// callers treat that as a lost race and re-read.
    pub async fn fill(&self, revision: Revision) -> Result<()> {
        self.metrics.fills_total.inc();
        self.driver
            .execute(
                "fill_sql",
                FILL_SQL,
                vec![
                    Value::Integer(revision.get()),
                    Value::Text(format!("gap-{revision}")),
                    Value::Integer(0), // created
                    Value::Integer(1), // deleted
                    Value::Integer(0), // create_revision
                    Value::Integer(0), // prev_revision
                    Value::Integer(0), // lease
                    Value::Null,       // value
                    Value::Null,       // old_value
                ],
            )
            .await?;
        Ok(())
    }

    /// Deletes exactly the row with the given id. Maintenance only —
    /// this bypasses MVCC bookkeeping.
    pub async fn delete_revision(&self, revision: Revision) -> Result<()> {
        self.metrics.delete_revision_total.inc();
        self.driver
            .execute(
                "delete_rev_sql",
                DELETE_REV_SQL,
                vec![Value::Integer(revision.get())],
            )
            .await?;
        Ok(())
    }

    // =========================================================================
    // Revision reads
    // =========================================================================

    /// `MAX(id)` over the log. Zero for a fresh store.
    pub async fn current_revision(&self) -> Result<Revision> {
        self.metrics.current_revision_total.inc();
        let rows = self.driver.query("rev_sql", REV_SQL, vec![]).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Schema("revision aggregate returned no rows".into()))?;
        Ok(Revision::new(decode_scalar_i64(&row[0])?))
    }

    /// `(compact, current)` in one query, refreshing the watermark
    /// cache.
    pub async fn compact_revision(&self) -> Result<(Revision, Revision)> {
        self.metrics.compact_revision_total.inc();
        let rows = self
            .driver
            .query("revision_interval_sql", REVISION_INTERVAL_SQL, vec![])
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Schema("revision interval returned no rows".into()))?;
        let compact = decode_scalar_i64(&row[0])?;
        let current = decode_scalar_i64(&row[1])?;
        self.compact_watermark.fetch_max(compact, Ordering::AcqRel);
        Ok((Revision::new(compact), Revision::new(current)))
    }

    /// The last watermark this engine observed (may lag the database).
    pub fn cached_compact_revision(&self) -> Revision {
        Revision::new(self.compact_watermark.load(Ordering::Acquire))
    }

    /// Logical size of the database in bytes.
    pub async fn get_size(&self) -> Result<i64> {
        let rows = self.driver.query("get_size_sql", GET_SIZE_SQL, vec![]).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Schema("size query returned no rows".into()))?;
        decode_scalar_i64(&row[0])
    }

    // =========================================================================
    // Range reads
    // =========================================================================

    /// Newest row per key in the range, at the current revision.
    pub async fn list_current(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        include_deleted: bool,
    ) -> Result<Vec<KvRow>> {
        let (start, end) = range_bounds(prefix, start_key);
        let mut args = vec![
            Value::Text(start),
            Value::Text(end),
            Value::Integer(include_deleted as i64),
        ];
        let (tag, sql) = if limit > 0 {
            args.push(Value::Integer(limit));
            ("get_current_sql_limit", &self.get_current_limit_sql)
        } else {
            ("get_current_sql", &self.get_current_sql)
        };
        let rows = self.driver.query(tag, sql, args).await?;
        decode_rows(rows)
    }

    /// Newest row per key in the range as of `revision` (MVCC read).
    ///
    /// # Systems Concept: Snapshot Reads from a Log
    ///
    /// "As of revision R" is answered without any snapshot machinery: the
    /// inner aggregate simply ignores rows with `id > R`, so the newest
    /// surviving row per key *is* the key's state at R. The whole read is
    /// one SQL statement, which is what makes it consistent — there is no
    /// moment where half the range is read at one revision and half at
    /// another.
    ///
    /// # Arguments
    ///
    /// * `prefix` — range selector; `"p/"` scans the subtree, anything
    ///   else scans the key itself plus suffixed keys
    /// * `start_key` — when non-empty, results begin strictly *after*
    ///   this key (pagination cursor)
    /// * `limit` — page size; `0` means unlimited
    /// * `revision` — the snapshot point; `0` means current
    /// * `include_deleted` — surface tombstones instead of hiding them
    ///
    /// # Errors
    ///
    /// `Compacted` when `revision` is non-zero and below the watermark:
    /// the rows that would answer the read may already be pruned.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// // Page through /registry/pods/ as of a fixed revision.
    /// let (rev, _count) = store.count_current("/registry/pods/", "").await?;
    /// let mut cursor = String::new();
    /// loop {
    ///     let page = store.list("/registry/pods/", &cursor, 500, rev, false).await?;
    ///     let Some(last) = page.last() else { break };
    ///     cursor = last.name.clone();
    ///     for row in &page {
    ///         println!("{} @ {}", row.name, row.id);
    ///     }
    /// }
    /// ```
    pub async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: Revision,
        include_deleted: bool,
    ) -> Result<Vec<KvRow>> {
        self.check_compacted(revision)?;
        let (start, end) = range_bounds(prefix, start_key);
        let mut args = vec![
            Value::Text(start),
            Value::Text(end),
            Value::Integer(revision.get()),
            Value::Integer(include_deleted as i64),
        ];
        let (tag, sql) = if limit > 0 {
            args.push(Value::Integer(limit));
            ("list_revision_sql_limit", &self.list_revision_limit_sql)
        } else {
            ("list_revision_sql", &self.list_revision_sql)
        };
        let rows = self.driver.query(tag, sql, args).await?;
        decode_rows(rows)
    }

    /// `(current_revision, live keys in range)` at the current
    /// revision.
    pub async fn count_current(&self, prefix: &str, start_key: &str) -> Result<(Revision, i64)> {
        let (start, end) = range_bounds(prefix, start_key);
        let rows = self
            .driver
            .query(
                "count_current",
                &self.count_current_sql,
                vec![
                    Value::Text(start),
                    Value::Text(end),
                    Value::Integer(0), // never count tombstones
                ],
            )
            .await?;
        decode_count(rows)
    }

    /// `(current_revision, live keys in range)` as of `revision`.
    pub async fn count(
        &self,
        prefix: &str,
        start_key: &str,
        revision: Revision,
    ) -> Result<(Revision, i64)> {
        self.check_compacted(revision)?;
        let (start, end) = range_bounds(prefix, start_key);
        let rows = self
            .driver
            .query(
                "count_revision",
                &self.count_revision_sql,
                vec![
                    Value::Text(start),
                    Value::Text(end),
                    Value::Integer(revision.get()),
                    Value::Integer(0),
                ],
            )
            .await?;
        decode_count(rows)
    }

    // =========================================================================
    // Tail reads (watch)
    // =========================================================================

    /// Raw rows with `id > after`, in id order, across all keys.
    pub async fn after(&self, after: Revision, limit: i64) -> Result<Vec<KvRow>> {
        let mut args = vec![Value::Integer(after.get())];
        let (tag, sql) = if limit > 0 {
            args.push(Value::Integer(limit));
            ("after_sql_limit", &self.after_limit_sql)
        } else {
            ("after_sql", &self.after_sql)
        };
        let rows = self.driver.query(tag, sql, args).await?;
        decode_rows(rows)
    }

    /// Raw rows with `id > after` restricted to a prefix range.
    pub async fn after_prefix(
        &self,
        prefix: &str,
        after: Revision,
        limit: i64,
    ) -> Result<Vec<KvRow>> {
        let (start, end) = prefix_range(prefix);
        let mut args = vec![
            Value::Text(start),
            Value::Text(end),
            Value::Integer(after.get()),
        ];
        let (tag, sql) = if limit > 0 {
            args.push(Value::Integer(limit));
            ("after_sql_prefix_limit", &self.after_prefix_limit_sql)
        } else {
            ("after_sql_prefix", &self.after_prefix_sql)
        };
        let rows = self.driver.query(tag, sql, args).await?;
        decode_rows(rows)
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Compacts history up to `revision` (clamped to the current
    /// revision). Returns the resulting watermark. Afterwards any read
    /// at an older revision fails `Compacted`.
    ///
    /// # What One Pass Deletes
    ///
    /// Within the window `(compact, target]`, in one transaction:
    ///
    /// 1. every row referenced as `prev_revision` by an update or delete
    ///    in the window (the superseded history), then
    /// 2. the tombstones in the window themselves (gap rows included),
    ///    and finally
    /// 3. the sentinel watermark advances to `target`.
    ///
    /// # Safety
    ///
    /// The live head of every key is never a candidate: step 1 only
    /// deletes rows that something newer *in the window* superseded, and
    /// step 2 only deletes rows that were already dead. So for any
    /// `rev >= target`, `list(..., rev, ...)` returns exactly what it
    /// returned before the pass — that is the compact-safety law the
    /// tests pin down.
    ///
    /// # Retry
    ///
    /// The whole window is one transaction, retried on transient
    /// failures up to the driver's retry bound; a pass that keeps
    /// failing leaves the watermark untouched and is simply attempted
    /// again later.
    pub async fn compact(&self, revision: Revision) -> Result<Revision> {
        self.metrics.compact_passes_total.inc();
        let (compact, current) = self.compact_revision().await?;
        let target = revision.get().min(current.get());
        if compact.get() >= target {
            return Ok(compact);
        }
        debug!(start = compact.get(), target, "compacting revision window");

        let mut attempt = 0usize;
        loop {
            self.metrics.compact_batches_total.inc();
            match self.try_compact(compact.get(), target).await {
                Ok(()) => break,
                Err(err) if err.is_retryable() && attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                }
                Err(err) => {
                    warn!(attempts = attempt + 1, error = %err, "compaction window failed");
                    return Err(err);
                }
            }
        }

        self.compact_watermark.fetch_max(target, Ordering::AcqRel);
        Ok(Revision::new(target))
    }

    async fn try_compact(&self, start: i64, end: i64) -> Result<()> {
        self.driver
            .transaction(
                "compact_sql",
                vec![
                    (
                        COMPACT_SUPERSEDED_SQL.to_string(),
                        vec![Value::Integer(start), Value::Integer(end)],
                    ),
                    (
                        COMPACT_TOMBSTONES_SQL.to_string(),
                        vec![Value::Integer(start), Value::Integer(end)],
                    ),
                    (UPDATE_COMPACT_SQL.to_string(), vec![Value::Integer(end)]),
                ],
            )
            .await
    }

    fn check_compacted(&self, revision: Revision) -> Result<()> {
        let watermark = self.compact_watermark.load(Ordering::Acquire);
        if !revision.is_zero() && revision.get() < watermark {
            return Err(Error::Compacted {
                revision: revision.get(),
                compact_revision: watermark,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Range encoding & decoding
// =============================================================================

/// Derives the `[start, end)` bounds for a prefix.
///
/// A prefix ending in `/` scans its subtree (`end` bumps the trailing
/// `/` to `0`, the next readable character); any other prefix scans
/// itself plus suffixed keys (`end = prefix + '\x01'`).
pub(crate) fn prefix_range(prefix: &str) -> (String, String) {
    match prefix.strip_suffix('/') {
        Some(parent) => (prefix.to_string(), format!("{parent}0")),
        None => (prefix.to_string(), format!("{prefix}\u{01}")),
    }
}

/// Range bounds with the optional exclusive `start_key` override:
/// results begin strictly after `start_key`.
fn range_bounds(prefix: &str, start_key: &str) -> (String, String) {
    let (start, end) = prefix_range(prefix);
    if start_key.is_empty() {
        (start, end)
    } else {
        (format!("{start_key}\u{01}"), end)
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

fn insert_outcome(result: ExecResult) -> Option<Revision> {
    if result.rows_affected == 0 {
        None
    } else {
        Some(Revision::new(result.last_insert_id))
    }
}

fn decode_rows(rows: Vec<Vec<Value>>) -> Result<Vec<KvRow>> {
    rows.iter().map(|row| KvRow::from_values(row)).collect()
}

fn decode_count(rows: Vec<Vec<Value>>) -> Result<(Revision, i64)> {
    let row = rows
        .first()
        .ok_or_else(|| Error::Schema("count aggregate returned no rows".into()))?;
    let revision = Revision::new(decode_scalar_i64(&row[0])?);
    let count = decode_scalar_i64(&row[1])?;
    Ok((revision, count))
}
