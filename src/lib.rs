//! # revkv — an etcd-shaped key/value store over a SQL revision log
//!
//! revkv stores every change to every key as one row of a single
//! append-only table (`kine`). The row id is the **revision**: a
//! monotonic logical clock assigned by the SQL engine. On top of that
//! log it provides the etcd primitives — conditional Create / Update /
//! Delete, MVCC range reads at a revision, counts, and watches — plus
//! background compaction of obsolete history.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      RevKv (async facade)                       │
//! │      create/update/delete · list/count · watch · compact        │
//! └──────┬──────────────────────┬──────────────────────┬────────────┘
//!        │                      │                      │
//!        ▼                      ▼                      ▼
//! ┌─────────────┐      ┌───────────────┐      ┌────────────────┐
//! │   Engine    │      │  Watch poller │      │   Compactor    │
//! │ (SQL stmt   │◄─────┤ (tails log,   │      │ (trims window, │
//! │  set, MVCC) │      │  fills gaps)  │      │  moves marker) │
//! └──────┬──────┘      └───────┬───────┘      └───────┬────────┘
//!        └──────────────┬──────┴──────────────────────┘
//!                       ▼
//!               ┌──────────────┐
//!               │    Driver    │  retry · param rewrite · stmt cache
//!               │ (thread pool)│  1 writer + N reader connections
//!               └──────┬───────┘
//!                      ▼
//!                SQLite (WAL)
//! ```
//!
//! ## Core invariants
//!
//! 1. Revisions strictly increase and are never reused; the sequence
//!    may contain gaps, which the watch poller closes with `gap-<id>`
//!    tombstones.
//! 2. Every row's `prev_revision` names the row it superseded (or zero).
//! 3. Writes are single conditional inserts — the SQL engine arbitrates
//!    every race; a compare-and-swap miss is `Ok(None)`, never an error.
//! 4. The compact watermark only advances; reads below it fail
//!    `Compacted`.
//! 5. Per watch subscription, delivered event ids strictly increase,
//!    starting just above the subscription's start revision.
//!
//! ## Module map
//!
//! - [`api`]: the [`RevKv`] handle — open, operations, shutdown
//! - [`engine`]: the revision-log statement set and MVCC semantics
//! - [`watch`]: the shared poller and subscriptions
//! - [`driver`]: connection pool, retries, parameter rewriting
//! - [`schema`]: the `kine` table and its migrations
//! - [`config`] / [`error`] / [`types`] / [`metrics`]: the supporting cast

/// Store facade and lifecycle.
pub mod api;

/// Configuration and tunables.
pub mod config;

/// Connection pool, retry policy, and parameter-style rewriting.
pub mod driver;

/// The revision-log engine: SQL statement set and MVCC semantics.
pub mod engine;

/// The crate-wide error taxonomy.
pub mod error;

/// Per-engine Prometheus metrics.
pub mod metrics;

/// Schema DDL and migrations.
pub mod schema;

/// Domain types: revisions, log rows, derived views, events.
pub mod types;

/// Watch subscriptions and the shared log poller.
pub mod watch;

mod compact;

pub use api::RevKv;
pub use config::{Config, ParamStyle, PoolConfig};
pub use driver::Driver;
pub use engine::Engine;
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use types::{Event, EventKind, KeyValue, KvRow, Revision};
pub use watch::{Subscription, WatchHub};
