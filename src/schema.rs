//! # Schema & Migrations
//!
//! The entire persistent state is one logical table:
//!
//! ```text
//! kine
//! ┌───────────────────┬──────────────────────────────────────────────┐
//! │ id                │ revision; assigned by the engine, monotonic  │
//! │ name              │ user key                                     │
//! │ created, deleted  │ life-cycle flags (0/1)                       │
//! │ create_revision   │ id of the life-cycle root (0 on creates)     │
//! │ prev_revision     │ id of the previous live row (0 if none)      │
//! │ lease             │ opaque lease id, stored verbatim             │
//! │ value, old_value  │ payload / superseded payload (BLOB, NULL-able)│
//! └───────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! plus a `(name, id)` unique index, a sentinel row
//! (`compact_rev_key`, inserted with explicit id 0 so it never occupies
//! log-id space) whose `prev_revision` holds the compact watermark, and
//! a small `revkv_meta` table tracking how many migrations have been
//! applied.
//!
//! ## Design Decisions
//!
//! ### Why does the sentinel get id 0?
//!
//! The marker has to live somewhere, and a dedicated metadata table
//! would need its own plumbing. Placing it *in* the log at id 0 keeps
//! one table, while staying below AUTOINCREMENT's range — the first
//! user write is revision 1, and tail reads (`id > ?`) can never
//! surface the marker.
//!
//! ### Why track an applied count instead of probing structure?
//!
//! Either satisfies the idempotence contract; a counter in a metadata
//! table additionally distinguishes "older database, apply the rest"
//! from "newer database, refuse to open", which structural probing
//! cannot.
//!
//! ## Migration Strategy
//!
//! Migrations are an ordered list of idempotent statements, applied in
//! order and counted in `revkv_meta`. Append only — never reorder or
//! rewrite a shipped entry. A database reporting more applied
//! migrations than this binary knows is from a newer release and
//! refuses to open rather than guess.

use rusqlite::types::Value;
use tracing::{debug, info};

use crate::driver::Driver;
use crate::error::{Error, Result};

/// The metadata table. Created unconditionally before any migration
/// runs.
const CREATE_META: &str = "\
CREATE TABLE IF NOT EXISTS revkv_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

/// The revision log.
///
/// `AUTOINCREMENT` matters: ids of deleted rows must never be reused,
/// or compaction would corrupt watch positions. `value`/`old_value` are
/// NULL-able — a tombstone has no value, a pure create has no old
/// value, and an *empty* caller value is stored as an empty blob, which
/// is distinct from NULL.
const CREATE_KINE: &str = "\
CREATE TABLE IF NOT EXISTS kine (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    created         INTEGER,
    deleted         INTEGER,
    create_revision INTEGER,
    prev_revision   INTEGER,
    lease           INTEGER,
    value           BLOB,
    old_value       BLOB
)";

/// The one secondary index: every per-key scan is `name = ?` (or a name
/// range) narrowed by id, so `(name, id)` covers the MVCC self-join,
/// the CAS subqueries, and the prefix tail reads.
const CREATE_NAME_ID_INDEX: &str = "\
CREATE UNIQUE INDEX IF NOT EXISTS kine_name_index ON kine (name, id)";

/// The compact-watermark sentinel.
///
/// Inserted with explicit id 0, below AUTOINCREMENT's range, so the
/// first user write still gets revision 1 and tail reads (`id > ?`)
/// never surface the marker. Its `prev_revision` is advanced in place
/// by the compactor.
const INSERT_COMPACT_SENTINEL: &str = "\
INSERT INTO kine (id, name, created, deleted, create_revision, prev_revision, lease, value, old_value)
SELECT 0, 'compact_rev_key', 0, 0, 0, 0, 0, NULL, NULL
WHERE NOT EXISTS (SELECT 1 FROM kine WHERE name = 'compact_rev_key')";

/// Ordered migration list. Append only — never reorder or edit an
/// entry that has shipped.
const MIGRATIONS: &[&str] = &[CREATE_KINE, CREATE_NAME_ID_INDEX, INSERT_COMPACT_SENTINEL];

/// Ensures the schema exists and is current.
///
/// Idempotent: every migration statement is a no-op when its effect is
/// already present, and the applied count is tracked in `revkv_meta`.
///
/// # Errors
///
/// `Error::Schema` when the database was written by a newer release;
/// any driver error if a statement fails. Both are fatal at open time.
pub async fn migrate(driver: &Driver) -> Result<()> {
    driver.execute("create_meta", CREATE_META, vec![]).await?;

    let applied = applied_migrations(driver).await?;
    if applied > MIGRATIONS.len() {
        return Err(Error::Schema(format!(
            "database has {applied} migrations applied, this build knows {}",
            MIGRATIONS.len()
        )));
    }
    if applied == MIGRATIONS.len() {
        debug!(applied, "schema is current");
        return Ok(());
    }

    for (index, statement) in MIGRATIONS.iter().enumerate().skip(applied) {
        driver.execute("migration", statement, vec![]).await?;
        driver
            .execute(
                "migration_version",
                "INSERT OR REPLACE INTO revkv_meta (key, value) VALUES ('schema_version', ?)",
                vec![Value::Text((index + 1).to_string())],
            )
            .await?;
    }
    info!(
        from = applied,
        to = MIGRATIONS.len(),
        "applied schema migrations"
    );
    Ok(())
}

/// Number of migrations already applied, zero for a fresh database.
async fn applied_migrations(driver: &Driver) -> Result<usize> {
    let rows = driver
        .query(
            "schema_version",
            "SELECT value FROM revkv_meta WHERE key = 'schema_version'",
            vec![],
        )
        .await?;
    match rows.first().and_then(|row| row.first()) {
        Some(Value::Text(text)) => text
            .parse()
            .map_err(|_| Error::Schema(format!("unparseable schema version {text:?}"))),
        Some(other) => Err(Error::Schema(format!(
            "unexpected schema version value {other:?}"
        ))),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::Metrics;
    use crate::types::COMPACT_REV_KEY;
    use std::sync::Arc;

    async fn open_driver(path: &std::path::Path) -> Driver {
        let config = Config::new(path);
        Driver::open(&config, Arc::new(Metrics::new()))
            .await
            .expect("open driver")
    }

    #[tokio::test]
    async fn migrate_creates_table_index_and_sentinel() {
        let dir = tempfile::tempdir().expect("temp dir");
        let driver = open_driver(&dir.path().join("schema.db")).await;
        migrate(&driver).await.expect("migrate");

        let tables = driver
            .query(
                "sqlite_master",
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                vec![],
            )
            .await
            .expect("list tables");
        let names: Vec<_> = tables.iter().map(|row| row[0].clone()).collect();
        assert!(names.contains(&Value::Text("kine".into())));
        assert!(names.contains(&Value::Text("revkv_meta".into())));

        let sentinel = driver
            .query(
                "sentinel",
                "SELECT id, prev_revision FROM kine WHERE name = ?",
                vec![Value::Text(COMPACT_REV_KEY.into())],
            )
            .await
            .expect("sentinel row");
        assert_eq!(sentinel.len(), 1);
        assert_eq!(sentinel[0][0], Value::Integer(0));
        assert_eq!(sentinel[0][1], Value::Integer(0));

        driver.close().await;
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("schema.db");

        {
            let driver = open_driver(&path).await;
            migrate(&driver).await.expect("first migrate");
            driver.close().await;
        }
        {
            let driver = open_driver(&path).await;
            migrate(&driver).await.expect("second migrate");

            // Still exactly one sentinel row.
            let rows = driver
                .query(
                    "sentinel_count",
                    "SELECT COUNT(*) FROM kine WHERE name = ?",
                    vec![Value::Text(COMPACT_REV_KEY.into())],
                )
                .await
                .expect("count");
            assert_eq!(rows[0][0], Value::Integer(1));
            driver.close().await;
        }
    }

    #[tokio::test]
    async fn newer_database_refuses_to_open() {
        let dir = tempfile::tempdir().expect("temp dir");
        let driver = open_driver(&dir.path().join("schema.db")).await;
        migrate(&driver).await.expect("migrate");

        driver
            .execute(
                "bump_version",
                "INSERT OR REPLACE INTO revkv_meta (key, value) VALUES ('schema_version', '99')",
                vec![],
            )
            .await
            .expect("bump version");

        let err = migrate(&driver).await.unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        driver.close().await;
    }

    #[tokio::test]
    async fn first_user_insert_gets_revision_one() {
        let dir = tempfile::tempdir().expect("temp dir");
        let driver = open_driver(&dir.path().join("schema.db")).await;
        migrate(&driver).await.expect("migrate");

        let result = driver
            .execute(
                "insert",
                "INSERT INTO kine (name, created, deleted, create_revision, prev_revision, lease, value, old_value) \
                 VALUES ('foo', 1, 0, 0, 0, 0, X'31', NULL)",
                vec![],
            )
            .await
            .expect("insert");
        assert_eq!(result.last_insert_id, 1, "sentinel must not consume revision 1");
        driver.close().await;
    }
}
