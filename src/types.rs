//! # Domain Types for revkv
//!
//! This module defines the core types used throughout revkv. These types
//! model the revision-log domain: revisions, log rows, the derived
//! key/value views, and watch events.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! We use the "newtype pattern" for [`Revision`] — wrapping the raw `i64`
//! in a single-field struct. This provides:
//!
//! - **Type safety**: Can't accidentally pass a lease or a count where a
//!   revision is expected
//! - **Self-documenting code**: Function signatures tell you what they expect
//! - **Encapsulation**: Zero-sentinel logic lives in one place
//!
//! ## Row vs. Derived View
//!
//! Two shapes of the same data appear throughout the crate:
//!
//! - [`KvRow`] is the storage truth — one row of the `kine` table with all
//!   of its MVCC bookkeeping columns (`created`, `deleted`,
//!   `create_revision`, `prev_revision`, `old_value`).
//! - [`KeyValue`] is what an etcd-shaped caller sees: key, value, lease,
//!   and the two revisions that matter to clients. Deriving it applies the
//!   create-revision carry-forward rule (see [`KvRow::effective_create_revision`]).
//!
//! ## Invariants
//!
//! These types encode the log's core invariants:
//!
//! - [`Revision`]: strictly increasing, assigned by the SQL engine, never
//!   reused; zero is a valid sentinel ("no revision")
//! - [`KvRow`]: `prev_revision` names the row it superseded (or zero);
//!   `created` implies no live predecessor, `deleted` implies one
//! - Gap rows (`gap-<id>`) are tombstones that exist only to close holes in
//!   the id sequence; they are never surfaced as events

use std::fmt;

use rusqlite::types::Value;

use crate::error::{Error, Result};

/// Key prefix of synthetic rows inserted to close id gaps.
pub const GAP_KEY_PREFIX: &str = "gap-";

/// Key of the sentinel row whose `prev_revision` holds the compact
/// watermark.
pub const COMPACT_REV_KEY: &str = "compact_rev_key";

// =============================================================================
// Revision
// =============================================================================

/// A revision number: the id of a log row, also used as a logical clock.
///
/// # What Is a Revision?
///
/// Every change to every key becomes one row of the log, and the row's id
/// *is* the revision: a single monotonic counter across all keys. A read
/// "at revision R" means "as of the moment row R was committed". The
/// sequence may contain gaps where a write transaction failed after id
/// allocation; the watch poller fills those (see the watch module).
///
/// # Rust Pattern: Newtype + Copy
///
/// `Revision` wraps an `i64` and derives `Copy` because it is small and
/// passed around constantly. The newtype keeps it from being confused with
/// the other `i64`s in the API (leases, counts, limits).
///
/// # Why Zero Is Valid
///
/// Zero is a sentinel everywhere a revision is optional: "no previous row"
/// in `prev_revision`, "at the current revision" in reads, "from the start"
/// in watches. Keeping it in-band avoids `Option<Revision>` on every other
/// field.
///
/// # Example
///
/// ```rust
/// use revkv::Revision;
///
/// let rev = Revision::new(42);
/// assert_eq!(rev.get(), 42);
/// assert!(!rev.is_zero());
/// assert!(Revision::ZERO.is_zero());
///
/// // Revisions are ordered like the log itself.
/// assert!(Revision::new(41) < rev);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(i64);

impl Revision {
    /// The zero sentinel ("no revision").
    pub const ZERO: Revision = Revision(0);

    /// Wraps a raw id.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub fn get(&self) -> i64 {
        self.0
    }

    /// True for the zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Revision {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// =============================================================================
// Log Rows
// =============================================================================

/// One row of the `kine` table: a single versioned change to one key.
///
/// # The Five Row Shapes
///
/// | Shape | `created` | `deleted` | `value` | `old_value` |
/// |-------|-----------|-----------|---------|-------------|
/// | Create | 1 | 0 | payload | NULL |
/// | Update | 0 | 0 | payload | superseded payload |
/// | Tombstone | 0 | 1 | NULL | superseded payload |
/// | Gap fill | 0 | 1 | NULL | NULL |
/// | Sentinel | 0 | 0 | NULL | NULL |
///
/// # Invariants
///
/// - `prev_revision` is the id of the immediately preceding row for the
///   same key, or zero if none survives (first write, or history
///   compacted away).
/// - `created` implies the key had no live predecessor at insert time;
///   `deleted` implies it had one.
/// - `value` is `NULL` only on tombstones and gap rows; an *empty* value
///   written by a caller is stored as an empty, non-NULL blob. The two are
///   distinguishable on read.
///
/// # Example
///
/// ```rust,ignore
/// let row = store.get("/registry/pods/web").await?.expect("live key");
/// println!(
///     "{} @ revision {} (created at {})",
///     row.name,
///     row.id,
///     row.to_key_value().create_revision,
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRow {
    /// The revision assigned to this change.
    pub id: Revision,
    /// The user key.
    pub name: String,
    /// This row creates the key (no live predecessor).
    pub created: bool,
    /// This row tombstones the key.
    pub deleted: bool,
    /// Id of the creating row of the key's current life-cycle, zero on
    /// create rows (their own id is the root).
    pub create_revision: Revision,
    /// Id of the previous live row for the key, zero if none.
    pub prev_revision: Revision,
    /// Opaque lease id, stored verbatim. Not enforced here.
    pub lease: i64,
    /// Payload. `None` on tombstones and gap rows.
    pub value: Option<Vec<u8>>,
    /// Payload this row superseded. `None` on pure creates.
    pub old_value: Option<Vec<u8>>,
}

impl KvRow {
    /// True for synthetic rows minted to close id gaps.
    ///
    /// # Why Gap Rows Exist
    ///
    /// The SQL engine allocates ids inside write transactions, so a failed
    /// transaction can consume an id without leaving a row. Watchers tail
    /// the log by id; a permanently missing id would look like an event
    /// that never arrives. The poller closes the hole with a synthetic
    /// tombstone named `gap-<id>` — present in the table, invisible in
    /// every API result.
    pub fn is_gap(&self) -> bool {
        is_gap_key(&self.name)
    }

    /// The effective create revision after carry-forward.
    ///
    /// # The Carry-Forward Rule
    ///
    /// Create rows store `create_revision = 0` and are their own life-cycle
    /// root, so the *effective* root of a create row is its own id. Updates
    /// and tombstones copy the root forward from their predecessor. This
    /// means a key deleted and re-created gets a fresh `create_revision` —
    /// exactly etcd's behavior.
    pub fn effective_create_revision(&self) -> Revision {
        if self.created {
            self.id
        } else {
            self.create_revision
        }
    }

    /// Derives the caller-facing view of this row.
    pub fn to_key_value(&self) -> KeyValue {
        KeyValue {
            key: self.name.clone(),
            create_revision: self.effective_create_revision(),
            mod_revision: self.id,
            lease: self.lease,
            value: self.value.clone().unwrap_or_default(),
        }
    }

    /// Reconstructs the superseded view, if this row superseded one.
    ///
    /// Returns `None` on pure creates (`prev_revision = 0`): there was
    /// nothing before, so there is nothing to reconstruct.
    pub fn to_prev_key_value(&self) -> Option<KeyValue> {
        if self.prev_revision.is_zero() {
            return None;
        }
        Some(KeyValue {
            key: self.name.clone(),
            create_revision: self.effective_create_revision(),
            mod_revision: self.prev_revision,
            lease: self.lease,
            value: self.old_value.clone().unwrap_or_default(),
        })
    }

    /// Decodes a row from the driver's column values, in the canonical
    /// column order: `id, name, created, deleted, create_revision,
    /// prev_revision, lease, value, old_value`.
    ///
    /// # Why Decode from Generic Values?
    ///
    /// The driver stays schema-agnostic (it materializes whatever columns a
    /// statement selects); the knowledge of what a `kine` row *means* lives
    /// here, next to the type it produces. A wrong column count is a
    /// `Schema` error — it can only mean statement/schema drift, never bad
    /// user input.
    pub fn from_values(values: &[Value]) -> Result<Self> {
        if values.len() != 9 {
            return Err(Error::Schema(format!(
                "expected 9 row columns, got {}",
                values.len()
            )));
        }
        Ok(Self {
            id: Revision::new(decode_i64(&values[0])?),
            name: decode_text(&values[1])?,
            created: decode_i64(&values[2])? != 0,
            deleted: decode_i64(&values[3])? != 0,
            create_revision: Revision::new(decode_i64(&values[4])?),
            prev_revision: Revision::new(decode_i64(&values[5])?),
            lease: decode_i64(&values[6])?,
            value: decode_blob(&values[7])?,
            old_value: decode_blob(&values[8])?,
        })
    }
}

/// True if `name` is a gap-fill key.
pub fn is_gap_key(name: &str) -> bool {
    name.starts_with(GAP_KEY_PREFIX)
}

// =============================================================================
// Derived Views
// =============================================================================

/// The etcd-shaped view of a key at one revision.
///
/// # Relationship to KvRow
///
/// `KeyValue` is what clients reason about: "this key, this value, created
/// at revision X, last modified at revision Y". It is always *derived*
/// from a [`KvRow`] — never stored — so the carry-forward rule is applied
/// in exactly one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The user key.
    pub key: String,
    /// Revision of the row that started this key's current life-cycle.
    pub create_revision: Revision,
    /// Revision of the row this view was derived from.
    pub mod_revision: Revision,
    /// Opaque lease id.
    pub lease: i64,
    /// Payload (empty for tombstone-derived views).
    pub value: Vec<u8>,
}

/// The kind of change a watch event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A key was created or updated.
    Put,
    /// A key was tombstoned.
    Delete,
}

/// A single change delivered to a watch subscription.
///
/// # One Row, One Event
///
/// Events are derived row-by-row from the log tail: `deleted = 0` rows
/// become `Put`, `deleted = 1` rows become `Delete`. No join with earlier
/// history is needed — each row already carries the superseded payload in
/// `old_value`, so `prev_kv` is reconstructed locally.
///
/// # Example
///
/// ```rust,ignore
/// let mut sub = store.watch("/registry/", Revision::ZERO).await?;
/// while let Some(event) = sub.next().await {
///     let event = event?;
///     match event.kind {
///         EventKind::Put => println!("put {} @ {}", event.kv.key, event.revision()),
///         EventKind::Delete => println!("del {} @ {}", event.kv.key, event.revision()),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Event {
    /// Put or Delete.
    pub kind: EventKind,
    /// The key's state at this event's revision.
    pub kv: KeyValue,
    /// The state this event superseded, if any survives in the row.
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    /// Derives an event from a log row.
    pub fn from_row(row: &KvRow) -> Self {
        let kind = if row.deleted {
            EventKind::Delete
        } else {
            EventKind::Put
        };
        Self {
            kind,
            kv: row.to_key_value(),
            prev_kv: row.to_prev_key_value(),
        }
    }

    /// The revision this event happened at.
    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }
}

// =============================================================================
// Value Decoding
// =============================================================================

fn decode_i64(value: &Value) -> Result<i64> {
    match value {
        Value::Integer(v) => Ok(*v),
        Value::Null => Ok(0),
        other => Err(Error::Schema(format!(
            "expected integer column, got {other:?}"
        ))),
    }
}

fn decode_text(value: &Value) -> Result<String> {
    match value {
        Value::Text(s) => Ok(s.clone()),
        other => Err(Error::Schema(format!("expected text column, got {other:?}"))),
    }
}

fn decode_blob(value: &Value) -> Result<Option<Vec<u8>>> {
    match value {
        Value::Null => Ok(None),
        Value::Blob(b) => Ok(Some(b.clone())),
        // Values written as text by external tooling still read back.
        Value::Text(s) => Ok(Some(s.clone().into_bytes())),
        other => Err(Error::Schema(format!("expected blob column, got {other:?}"))),
    }
}

/// Decodes an integer scalar, mapping NULL to zero (aggregates over an
/// empty table come back as NULL).
pub(crate) fn decode_scalar_i64(value: &Value) -> Result<i64> {
    decode_i64(value)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Vec<Value> {
        vec![
            Value::Integer(4),
            Value::Text("foo".into()),
            Value::Integer(0),
            Value::Integer(0),
            Value::Integer(2),
            Value::Integer(3),
            Value::Integer(0),
            Value::Blob(b"new".to_vec()),
            Value::Blob(b"old".to_vec()),
        ]
    }

    #[test]
    fn decodes_update_row() {
        let row = KvRow::from_values(&sample_row()).unwrap();
        assert_eq!(row.id, Revision::new(4));
        assert_eq!(row.name, "foo");
        assert!(!row.created);
        assert_eq!(row.prev_revision, Revision::new(3));
        assert_eq!(row.value.as_deref(), Some(&b"new"[..]));
        assert_eq!(row.old_value.as_deref(), Some(&b"old"[..]));
    }

    /// The carry-forward rule, create side: a create row is its own
    /// life-cycle root even though the column stores zero.
    #[test]
    fn create_row_is_its_own_lifecycle_root() {
        let mut values = sample_row();
        values[2] = Value::Integer(1); // created
        values[4] = Value::Integer(0); // create_revision stored as zero
        let row = KvRow::from_values(&values).unwrap();
        assert_eq!(row.effective_create_revision(), Revision::new(4));
        assert_eq!(row.to_key_value().create_revision, Revision::new(4));
    }

    /// The carry-forward rule, update side: the stored root wins.
    #[test]
    fn update_row_carries_create_revision_forward() {
        let row = KvRow::from_values(&sample_row()).unwrap();
        assert_eq!(row.effective_create_revision(), Revision::new(2));
    }

    #[test]
    fn tombstone_derives_delete_event_with_prev() {
        let mut values = sample_row();
        values[3] = Value::Integer(1); // deleted
        values[7] = Value::Null; // value NULL on tombstones
        let row = KvRow::from_values(&values).unwrap();
        let event = Event::from_row(&row);
        assert_eq!(event.kind, EventKind::Delete);
        assert!(event.kv.value.is_empty());
        let prev = event.prev_kv.expect("tombstone supersedes a live row");
        assert_eq!(prev.mod_revision, Revision::new(3));
        assert_eq!(prev.value, b"old".to_vec());
    }

    #[test]
    fn create_row_has_no_prev() {
        let mut values = sample_row();
        values[2] = Value::Integer(1);
        values[5] = Value::Integer(0); // prev_revision zero
        values[8] = Value::Null;
        let row = KvRow::from_values(&values).unwrap();
        assert!(row.to_prev_key_value().is_none());
    }

    /// Gap detection is a prefix test on the whole key, not a substring
    /// search — user keys may legitimately contain "gap-".
    #[test]
    fn gap_keys_are_detected() {
        assert!(is_gap_key("gap-17"));
        assert!(!is_gap_key("gapless"));
        assert!(!is_gap_key("/registry/pods/gap-17"));
    }

    /// Empty-but-present and absent are different states and must stay
    /// distinguishable through a round trip.
    #[test]
    fn empty_value_is_distinct_from_null() {
        let mut values = sample_row();
        values[7] = Value::Blob(Vec::new());
        let row = KvRow::from_values(&values).unwrap();
        assert_eq!(row.value, Some(Vec::new()));

        values[7] = Value::Null;
        let row = KvRow::from_values(&values).unwrap();
        assert_eq!(row.value, None);
    }

    #[test]
    fn wrong_column_count_is_a_schema_error() {
        let err = KvRow::from_values(&[Value::Integer(1)]).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
