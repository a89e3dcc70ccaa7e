#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use revkv::{Config, RevKv};

static INIT_LOGGING: Once = Once::new();

/// Installs a tracing subscriber once per test binary, honoring
/// `RUST_LOG` (e.g. `RUST_LOG=revkv=trace cargo test` to see every
/// statement the driver issues).
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A configuration tuned for tests: fast polling, explicit compaction
/// only.
pub fn fast_config(path: impl Into<PathBuf>) -> Config {
    let mut config = Config::new(path);
    config.poll_interval = Some(Duration::from_millis(20));
    config.compact_interval = Some(Duration::ZERO);
    config
}

/// Opens a store backed by a fresh temp file. Keep the `TempDir` alive
/// for the duration of the test.
pub async fn open_store(name: &str) -> (tempfile::TempDir, PathBuf, RevKv) {
    init_logging();
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join(name);
    let store = RevKv::open(fast_config(&path)).await.expect("open store");
    (dir, path, store)
}

/// A raw read-write connection to a store's database file, for tests
/// that need to inspect or manipulate rows directly.
pub fn open_raw(path: &Path) -> rusqlite::Connection {
    rusqlite::Connection::open(path).expect("open raw connection")
}

/// Polls `f` until it returns `Some`, panicking after `timeout`.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Counts rows in the log matching a key name.
pub fn count_rows_named(conn: &rusqlite::Connection, name: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM kine WHERE name = ?",
        [name],
        |row| row.get(0),
    )
    .expect("count rows")
}

/// True if a row with the given id exists.
pub fn row_exists(conn: &rusqlite::Connection, id: i64) -> bool {
    conn.query_row("SELECT COUNT(*) FROM kine WHERE id = ?", [id], |row| {
        row.get::<_, i64>(0)
    })
    .expect("row exists query")
        > 0
}
