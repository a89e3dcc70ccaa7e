//! # Error Handling for revkv
//!
//! This module defines the error types used throughout revkv. We use a single
//! error enum ([`Error`]) to represent all possible failure modes, which
//! simplifies error handling for library users.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Proper error source chaining via `#[source]`
//!
//! ## Why a Single Error Type?
//!
//! Libraries commonly choose between:
//! 1. **Single enum** (our choice): Easy to match on, simple function signatures
//! 2. **Separate error types per module**: More precise, but verbose
//!
//! For revkv, a single enum works well because:
//! - Every layer ultimately fails the same ways (engine errors, compaction,
//!   lifecycle)
//! - The driver, the engine, and the watch pipeline all flow into the same
//!   public API surface
//! - Callers typically branch on a handful of conditions (compacted? closed?
//!   slow consumer?) and treat the rest uniformly
//!
//! ## Error Categories
//!
//! Errors fall into these categories:
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Caller mistakes | Empty key, read below the watermark | Fix the request, re-read at a newer revision |
//! | Engine conditions | Busy/locked, constraint hit, retries exhausted | Retried internally; give up and report when exhausted |
//! | Lifecycle | Store closed, slow watch consumer, shutdown budget | Reopen, rewatch, or let the operator intervene |
//!
//! ## What Is *Not* an Error
//!
//! A compare-and-swap miss is a normal outcome of optimistic concurrency,
//! not a failure: write operations return `Ok(None)` for a miss and reserve
//! `Err` for conditions the caller cannot resolve by re-reading.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in revkv operations.
///
/// # Rust Pattern: Enum Variants
///
/// Each variant represents a distinct failure mode. The `#[error(...)]`
/// attribute defines the `Display` message shown when the error is printed.
///
/// # Example
///
/// ```rust
/// use revkv::Error;
///
/// // Errors can be created directly...
/// let err = Error::Compacted {
///     revision: 2,
///     compact_revision: 3,
/// };
///
/// // ...and matched to decide on recovery.
/// match err {
///     Error::Compacted { compact_revision, .. } => {
///         // re-read or rewatch at `compact_revision` or newer
///         assert_eq!(compact_revision, 3);
///     }
///     _ => unreachable!(),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Caller Mistakes (fix the request)
    // =========================================================================

    /// The request itself is malformed.
    ///
    /// # When This Happens
    ///
    /// - An empty key was passed to Create/Update/Delete
    /// - Some future validation rejects an argument before any SQL runs
    ///
    /// # Recovery
    ///
    /// Fix the request; nothing was written.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No row matched a point read.
    ///
    /// # When This Happens
    ///
    /// The SQL engine reported "no rows" for a query that expected one.
    /// Range reads return empty vectors instead; this variant exists so the
    /// driver boundary can classify the engine's no-rows code faithfully.
    #[error("key not found")]
    NotFound,

    /// A read asked for a revision older than the compact watermark.
    ///
    /// # When This Happens
    ///
    /// The compactor prunes history up to a moving watermark. A `List`,
    /// `Count`, or `watch` that names a revision below it cannot be served:
    /// the rows that would answer it are gone.
    ///
    /// # Systems Concept: MVCC Compaction
    ///
    /// An append-only revision log grows forever unless superseded history
    /// is trimmed. The watermark is the contract with readers: everything
    /// strictly below it may have been deleted; everything at or above it is
    /// still a correct snapshot.
    ///
    /// # Recovery
    ///
    /// 1. Read the current `(compact, current)` interval
    /// 2. Re-list at a revision `>= compact_revision`
    /// 3. For watches, resubscribe from the new baseline
    #[error("revision {revision} has been compacted (compact revision is {compact_revision})")]
    Compacted {
        /// The revision the caller asked for.
        revision: i64,
        /// The current compact watermark.
        compact_revision: i64,
    },

    // =========================================================================
    // Engine Conditions (retried internally)
    // =========================================================================

    /// The SQL engine rejected a statement with a constraint violation.
    ///
    /// # When This Happens
    ///
    /// The main source is `Fill`: the poller mints a gap tombstone at an
    /// explicit id, and a real write can win that id concurrently. The
    /// unique primary key then rejects the fill.
    ///
    /// # Recovery
    ///
    /// For fills this is a *lost race, not a problem* — the id is reachable
    /// after all, and the poller simply re-reads. Other constraint hits
    /// indicate a bug and should be reported upstream.
    #[error("constraint violation: {0}")]
    Constraint(#[source] rusqlite::Error),

    /// A transient engine condition (busy / locked).
    ///
    /// # When This Happens
    ///
    /// The engine is momentarily unable to serve the statement — another
    /// connection holds a conflicting lock, or the write queue is saturated.
    ///
    /// # Recovery
    ///
    /// The driver retries these transparently (no backoff, the engine
    /// self-throttles), so this variant only escapes when the retry
    /// predicate was replaced with a narrower one.
    #[error("transient sqlite error: {0}")]
    Transient(#[source] rusqlite::Error),

    /// Retries were exhausted without the error clearing.
    ///
    /// # When This Happens
    ///
    /// A transient condition persisted across the driver's full retry
    /// budget (hundreds of attempts). At that point the engine is
    /// effectively down for this process.
    ///
    /// # Recovery
    ///
    /// Surface to the operator; the attempt count is carried so logs show
    /// how long the driver tried.
    #[error("unavailable after {attempts} attempts: {source}")]
    Unavailable {
        /// How many attempts were made before giving up.
        attempts: usize,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Lifecycle (reopen / rewatch)
    // =========================================================================

    /// A watch subscriber fell behind its delivery buffer and was
    /// terminated.
    ///
    /// # When This Happens
    ///
    /// Each subscription has a bounded buffer. When the poller cannot
    /// enqueue the next event, it abandons the subscription rather than
    /// stall every other subscriber or buffer without bound.
    ///
    /// # Systems Concept: Backpressure
    ///
    /// A fan-out pipeline must pick one of three evils when a consumer
    /// stalls: block everyone, buffer forever, or drop the stall-er. revkv
    /// drops the stall-er and tells it so, which keeps the contract honest —
    /// a subscription either sees *every* matching event or ends with this
    /// error.
    ///
    /// # Recovery
    ///
    /// Rewatch from a fresh revision (typically the current one) and
    /// re-list to resynchronize state.
    #[error("slow consumer: delivery buffer of {buffered} events overflowed")]
    SlowConsumer {
        /// Buffer capacity at the time of the overflow.
        buffered: usize,
    },

    /// The pool (or the whole store) has been shut down.
    ///
    /// # When This Happens
    ///
    /// Any operation issued after `shutdown()` — including on clones of the
    /// handle — fails with this. The worker threads are gone, so there is
    /// nothing to send the request to.
    #[error("store is closed")]
    Closed,

    /// An operation was abandoned before completion (deadline or
    /// cancellation).
    ///
    /// # When This Happens
    ///
    /// - The watch poller's per-poll query exceeded its timeout
    /// - A signal-triggered shutdown overran its budget
    #[error("canceled: {0}")]
    Canceled(&'static str),

    /// Schema initialization or migration failed.
    ///
    /// # When This Happens
    ///
    /// - The database reports more migrations than this build knows
    ///   (written by a newer release)
    /// - A migration statement failed outright
    /// - A row decoded with an impossible shape (column count/type drift)
    ///
    /// # Recovery
    ///
    /// Fatal at open time; requires the matching binary or operator
    /// intervention.
    #[error("schema error: {0}")]
    Schema(String),

    /// Any other engine error, passed through unclassified.
    ///
    /// # Rust Pattern: Catch-All Variant
    ///
    /// The driver boundary classifies the codes it knows (busy, locked,
    /// constraint, no-rows); everything else keeps its original error as
    /// the source so nothing is lost in translation.
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
}

impl Error {
    /// Default retry predicate: only transient engine conditions are worth
    /// re-issuing verbatim.
    ///
    /// # Why a Method Instead of Hard-Coding?
    ///
    /// The driver stores its predicate as a swappable function, so a
    /// different SQL engine (or a test) can widen or narrow the retryable
    /// set without touching the retry loop itself. This method is the
    /// default it starts with.
    ///
    /// # Example
    ///
    /// ```rust
    /// use revkv::Error;
    ///
    /// assert!(!Error::Closed.is_retryable());
    /// assert!(!Error::NotFound.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True for constraint violations (unique/PK conflicts).
    ///
    /// Used by the gap-fill path to distinguish "a real row won the id"
    /// from genuine failures.
    pub fn is_constraint(&self) -> bool {
        matches!(self, Error::Constraint(_))
    }
}

// =============================================================================
// Error Translation
// =============================================================================

/// Classifies engine-specific error codes into the crate taxonomy.
///
/// # Systems Concept: Error Translation at the Boundary
///
/// Engine-specific codes (SQLite result codes here) should be interpreted
/// exactly once, at the driver boundary. Everything above the driver deals
/// only in the crate's taxonomy, so swapping the SQL engine means swapping
/// this translation — not auditing every call site.
///
/// # Rust Pattern: From Trait
///
/// Implementing `From<rusqlite::Error>` enables the `?` operator to convert
/// engine errors automatically inside the worker threads:
///
/// ```rust,ignore
/// fn ping(conn: &Connection) -> Result<()> {
///     conn.query_row("SELECT 1", [], |_| Ok(()))?; // rusqlite::Error -> Error
///     Ok(())
/// }
/// ```
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Error::Transient(err),
                ErrorCode::ConstraintViolation => Error::Constraint(err),
                _ => Error::Sqlite(err),
            },
            _ => Error::Sqlite(err),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
///
/// # Rust Pattern: Type Aliases
///
/// Defining `type Result<T> = std::result::Result<T, Error>` means:
/// - Functions return `Result<Foo>` instead of `Result<Foo, Error>`
/// - Less typing, clearer intent
/// - Standard pattern used by most Rust libraries
///
/// # Example
///
/// ```rust,ignore
/// use revkv::Result;
///
/// async fn newest_revision(store: &revkv::RevKv) -> Result<i64> {
///     Ok(store.current_revision().await?.get())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
