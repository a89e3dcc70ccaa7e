//! # Configuration
//!
//! All tunables for the store, the connection pool, and the background
//! tasks. Raw fields keep whatever the caller set (including zero and
//! negative sentinels); the accessor methods apply the documented
//! defaults and floors, so the rest of the crate only ever reads through
//! them.
//!
//! | Option | Default | Notes |
//! |--------|---------|-------|
//! | `compact_interval` | 5 min | zero disables the compactor |
//! | `compact_retention` | 1000 revisions | recent window kept live for watchers |
//! | `poll_interval` | 1 s | watch poll period |
//! | `watch_query_timeout` | 20 s | floored at 5 s |
//! | `pool.max_idle` | 0 → driver default (2) | negative → keep no idle connections |
//! | `pool.max_open` | 0 → number of CPUs | clamped to 1..=16 reader threads |
//! | `param_style` | `?` | or numbered (`$1`, `@1`, `?1`) |
//! | `lock_writes` | off | process-wide mutex around writes |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default compaction period.
pub const DEFAULT_COMPACT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default number of recent revisions the periodic compactor keeps live.
pub const DEFAULT_COMPACT_RETENTION: i64 = 1000;

/// Default watch poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-poll SQL timeout.
pub const DEFAULT_WATCH_QUERY_TIMEOUT: Duration = Duration::from_secs(20);

/// Lower bound on the per-poll SQL timeout.
pub const MIN_WATCH_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle-connection count used when the caller leaves `max_idle` at zero.
/// Matches the conventional SQL-pool default.
pub const DEFAULT_MAX_IDLE_CONNS: usize = 2;

/// Parameter placeholder style for the SQL engine.
///
/// Statements are authored with positional `?` placeholders; when the
/// engine wants numbered parameters the driver rewrites the text once at
/// registration time (`? ? ?` becomes `$1 $2 $3`, or `@1`/`?1` for the
/// other prefixes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamStyle {
    /// Plain positional `?` placeholders. No rewriting.
    Positional,
    /// Numbered placeholders built from the given prefix character.
    Numbered(char),
}

impl Default for ParamStyle {
    fn default() -> Self {
        ParamStyle::Positional
    }
}

/// Connection-pool sizing.
///
/// The pool is a writer thread plus a set of reader threads, each owning
/// one SQL connection, so the knobs translate as: `max_open` bounds the
/// reader-thread count, `max_idle`/`max_idle_time` control how many
/// reader connections stay open across idle periods, and `max_lifetime`
/// recycles a reader connection by age.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections kept open while idle. `0` means the driver default
    /// (two); negative means none are kept.
    pub max_idle: i32,

    /// Upper bound on concurrently open reader connections. `0` means
    /// one per CPU, clamped to 1..=16.
    pub max_open: usize,

    /// Maximum age of a connection before it is recycled. Zero disables.
    #[serde(default)]
    pub max_lifetime: Option<Duration>,

    /// How long a surplus connection may sit idle before being closed.
    /// Zero disables.
    #[serde(default)]
    pub max_idle_time: Option<Duration>,
}

impl PoolConfig {
    /// Normalized idle-connection count: `0` → driver default, negative
    /// → zero.
    pub fn idle_conns(&self) -> usize {
        if self.max_idle < 0 {
            0
        } else if self.max_idle == 0 {
            DEFAULT_MAX_IDLE_CONNS
        } else {
            self.max_idle as usize
        }
    }
}

/// Top-level store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path of the SQLite database file. Created if absent.
    pub path: PathBuf,

    /// Period between compaction passes. `None` uses the default;
    /// `Some(ZERO)` disables the compactor.
    #[serde(default)]
    pub compact_interval: Option<Duration>,

    /// Number of recent revisions the periodic compactor leaves intact.
    #[serde(default)]
    pub compact_retention: Option<i64>,

    /// Watch poll period.
    #[serde(default)]
    pub poll_interval: Option<Duration>,

    /// Timeout on the tail query issued by each watch poll.
    #[serde(default)]
    pub watch_query_timeout: Option<Duration>,

    /// Connection-pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Parameter placeholder style.
    #[serde(default)]
    pub param_style: ParamStyle,

    /// Serialize all writes behind a process-wide mutex. For engines
    /// without internal single-writer discipline; readers never take it.
    #[serde(default)]
    pub lock_writes: bool,
}

impl Config {
    /// A configuration with defaults for everything but the path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compact_interval: None,
            compact_retention: None,
            poll_interval: None,
            watch_query_timeout: None,
            pool: PoolConfig::default(),
            param_style: ParamStyle::default(),
            lock_writes: false,
        }
    }

    /// Effective compaction period. `None` if compaction is disabled.
    pub fn compact_interval(&self) -> Option<Duration> {
        match self.compact_interval {
            None => Some(DEFAULT_COMPACT_INTERVAL),
            Some(v) if v.is_zero() => None,
            Some(v) => Some(v),
        }
    }

    /// Effective compaction retention window.
    pub fn compact_retention(&self) -> i64 {
        match self.compact_retention {
            Some(v) if v >= 0 => v,
            _ => DEFAULT_COMPACT_RETENTION,
        }
    }

    /// Effective watch poll period.
    pub fn poll_interval(&self) -> Duration {
        match self.poll_interval {
            Some(v) if !v.is_zero() => v,
            _ => DEFAULT_POLL_INTERVAL,
        }
    }

    /// Effective per-poll SQL timeout, floored at
    /// [`MIN_WATCH_QUERY_TIMEOUT`].
    pub fn watch_query_timeout(&self) -> Duration {
        match self.watch_query_timeout {
            Some(v) if v >= MIN_WATCH_QUERY_TIMEOUT => v,
            _ => DEFAULT_WATCH_QUERY_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_interval_defaults_and_disables() {
        let mut cfg = Config::new(":memory:");
        assert_eq!(cfg.compact_interval(), Some(DEFAULT_COMPACT_INTERVAL));

        cfg.compact_interval = Some(Duration::ZERO);
        assert_eq!(cfg.compact_interval(), None);

        cfg.compact_interval = Some(Duration::from_secs(30));
        assert_eq!(cfg.compact_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn watch_query_timeout_is_floored() {
        let mut cfg = Config::new(":memory:");
        assert_eq!(cfg.watch_query_timeout(), DEFAULT_WATCH_QUERY_TIMEOUT);

        // Below the floor falls back to the default.
        cfg.watch_query_timeout = Some(Duration::from_secs(1));
        assert_eq!(cfg.watch_query_timeout(), DEFAULT_WATCH_QUERY_TIMEOUT);

        cfg.watch_query_timeout = Some(Duration::from_secs(7));
        assert_eq!(cfg.watch_query_timeout(), Duration::from_secs(7));
    }

    #[test]
    fn poll_interval_defaults() {
        let mut cfg = Config::new(":memory:");
        assert_eq!(cfg.poll_interval(), DEFAULT_POLL_INTERVAL);

        cfg.poll_interval = Some(Duration::from_millis(50));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn idle_conns_normalization() {
        let mut pool = PoolConfig::default();
        assert_eq!(pool.idle_conns(), DEFAULT_MAX_IDLE_CONNS);

        pool.max_idle = -1;
        assert_eq!(pool.idle_conns(), 0);

        pool.max_idle = 7;
        assert_eq!(pool.idle_conns(), 7);
    }
}
