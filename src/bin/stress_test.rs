//! revkv stress test binary.
//!
//! Hammers the store with concurrent compare-and-swap writers while one
//! watch subscription tails everything, then verifies the revision-log
//! invariants directly against the database file.
//!
//! Run with: `cargo run --release --bin stress_test -- [OPTIONS]`
//!
//! ```bash
//! # Default: 100 keys, 1000 writes, 10 concurrent tasks
//! cargo run --release --bin stress_test
//!
//! # Same-key contention
//! cargo run --release --bin stress_test -- --same-key --writes 1000 --concurrency 20
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use revkv::{Config, RevKv, Revision};

struct StressConfig {
    /// Number of distinct keys written to.
    num_keys: usize,
    /// Total writes to attempt.
    num_writes: usize,
    /// Concurrent writer tasks.
    concurrency: usize,
    /// All tasks fight over one key.
    same_key: bool,
    /// Database path (temp file if unset).
    db_path: Option<String>,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            num_keys: 100,
            num_writes: 1000,
            concurrency: 10,
            same_key: false,
            db_path: None,
        }
    }
}

fn parse_args() -> StressConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = StressConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--keys" | "-k" => {
                i += 1;
                config.num_keys = args[i].parse().expect("invalid --keys value");
            }
            "--writes" | "-w" => {
                i += 1;
                config.num_writes = args[i].parse().expect("invalid --writes value");
            }
            "--concurrency" | "-c" => {
                i += 1;
                config.concurrency = args[i].parse().expect("invalid --concurrency value");
            }
            "--same-key" => {
                config.same_key = true;
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"revkv stress test

Usage: stress_test [OPTIONS]

Options:
  -k, --keys <N>        Number of distinct keys (default: 100)
  -w, --writes <N>      Total writes to attempt (default: 1000)
  -c, --concurrency <N> Concurrent writer tasks (default: 10)
  --same-key            All tasks contend on a single key
  -d, --db <PATH>       Database path (default: temp file)
  -h, --help            Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("unknown argument: {arg}");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() {
    let config = parse_args();

    println!("revkv stress test");
    println!("=================");
    println!("Keys:        {}", config.num_keys);
    println!("Writes:      {}", config.num_writes);
    println!("Concurrency: {}", config.concurrency);
    println!(
        "Mode:        {}",
        if config.same_key {
            "same-key contention"
        } else {
            "multi-key"
        }
    );

    let temp_dir = std::env::temp_dir().join(format!("revkv-stress-{}", std::process::id()));
    std::fs::create_dir_all(&temp_dir).expect("create temp dir");
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| temp_dir.join("stress.db").to_string_lossy().to_string());
    println!("Database:    {db_path}");
    println!();

    let mut store_config = Config::new(&db_path);
    store_config.poll_interval = Some(Duration::from_millis(20));
    let store = RevKv::open(store_config).await.expect("open store");

    // One subscription tails everything written below /stress/.
    let mut watch = store
        .watch("/stress/", Revision::ZERO)
        .await
        .expect("start watch");
    let watched = Arc::new(AtomicU64::new(0));
    let watcher = {
        let watched = watched.clone();
        tokio::spawn(async move {
            let mut last_id = 0;
            while let Some(event) = watch.next().await {
                let event = event.expect("watch event");
                let id = event.revision().get();
                assert!(id > last_id, "watch ids must strictly increase");
                last_id = id;
                watched.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    let written = Arc::new(AtomicU64::new(0));
    let cas_misses = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    println!("Starting stress test...");
    let start = Instant::now();

    let mut handles = Vec::new();
    let writes_per_task = config.num_writes / config.concurrency;
    for task_id in 0..config.concurrency {
        let store = store.clone();
        let written = written.clone();
        let cas_misses = cas_misses.clone();
        let errors = errors.clone();
        let num_keys = config.num_keys;
        let same_key = config.same_key;

        handles.push(tokio::spawn(async move {
            for i in 0..writes_per_task {
                let key = if same_key {
                    "/stress/contended".to_string()
                } else {
                    format!("/stress/{}", (task_id * writes_per_task + i) % num_keys)
                };
                let value = format!("task-{task_id}-write-{i}");

                // Create-or-CAS-update, one round: read the head, write
                // against it, count a miss when someone else got there
                // first.
                let outcome = match store.get(&key).await {
                    Ok(None) => store.create(&key, value.as_bytes(), 0).await,
                    Ok(Some(head)) => store.update(&key, value.as_bytes(), head.id, 0).await,
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(Some(_)) => {
                        written.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(None) => {
                        cas_misses.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.await.expect("writer task");
    }

    let elapsed = start.elapsed();
    let written = written.load(Ordering::Relaxed);
    let miss_count = cas_misses.load(Ordering::Relaxed);
    let error_count = errors.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Writes applied:  {written}");
    println!("CAS misses:      {miss_count}");
    println!("Errors:          {error_count}");
    println!("Duration:        {elapsed:?}");
    println!(
        "Throughput:      {:.2} writes/sec",
        written as f64 / elapsed.as_secs_f64()
    );
    println!();

    // Wait for the watcher to drain everything that was applied.
    println!("Draining watch...");
    let drain_deadline = Instant::now() + Duration::from_secs(30);
    while watched.load(Ordering::Relaxed) < written {
        assert!(
            Instant::now() < drain_deadline,
            "watch fell behind: {} of {written} events",
            watched.load(Ordering::Relaxed)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("  Watch delivered:   {} events ✓", watched.load(Ordering::Relaxed));

    store.shutdown().await;
    watcher.await.expect("watcher task");

    // Verify invariants directly against the file.
    println!("Verifying invariants...");
    let conn = rusqlite::Connection::open_with_flags(
        &db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .expect("open read-only connection");

    let row_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM kine WHERE name LIKE '/stress/%'",
            [],
            |row| row.get(0),
        )
        .expect("count rows");
    assert_eq!(row_count as u64, written, "one log row per applied write");
    println!("  Log rows:          {row_count} ✓");

    // Every row's prev_revision must point at the previous row for the
    // same key (nothing was compacted during the run).
    let names: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT DISTINCT name FROM kine WHERE name LIKE '/stress/%'")
            .expect("prepare names");
        stmt.query_map([], |row| row.get(0))
            .expect("query names")
            .collect::<Result<Vec<_>, _>>()
            .expect("collect names")
    };
    for name in &names {
        let rows: Vec<(i64, i64, i64)> = {
            let mut stmt = conn
                .prepare("SELECT id, prev_revision, created FROM kine WHERE name = ? ORDER BY id")
                .expect("prepare chain");
            stmt.query_map([name], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .expect("query chain")
            .collect::<Result<Vec<_>, _>>()
            .expect("collect chain")
        };
        let mut prev_id = 0;
        for (id, prev_revision, _created) in rows {
            assert_eq!(
                prev_revision, prev_id,
                "broken revision chain for {name}: row {id} points at {prev_revision}, expected {prev_id}"
            );
            prev_id = id;
        }
    }
    println!("  Revision chains:   intact across {} keys ✓", names.len());

    println!();
    println!("Stress test PASSED ✓");
}
