//! # Watch / Poll Pipeline
//!
//! Change streams are derived by tailing the log — there is no push
//! channel from the SQL engine. A single poller serves every
//! subscription:
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   watch(prefix) ──►│            Poller            │
//!   (control mpsc)   │                              │
//!                    │  tick: After(last_seen, 500) │
//!                    │   ├─ derive Put/Delete       │
//!                    │   ├─ advance last_seen       │
//!                    │   ├─ note + fill id gaps     │
//!                    │   └─ fan out by prefix ──────┼──► bounded mpsc per
//!                    └──────────────────────────────┘    subscriber
//! ```
//!
//! ## Guarantees
//!
//! - Per subscription, event ids are strictly increasing, starting at
//!   the least id greater than the subscription's `start_rev`.
//! - A subscription older than the compact watermark is rejected with
//!   `Compacted` at creation.
//! - A subscriber that stops draining its buffer is torn down; its
//!   stream yields a final `SlowConsumer` error after the buffered
//!   events. Rewatch from a fresh revision to resume.
//!
//! ## Gaps
//!
//! The id sequence can have holes where a write transaction failed
//! after id allocation. The poller never stalls on one: it advances
//! past, remembers the missing ids, and — after a one-interval grace
//! for transactions still in flight — mints `gap-<id>` tombstones so
//! the log itself records that the id is unreachable. Gap rows are
//! never fanned out. A fill that loses the race to a real write fails
//! its unique constraint and is dropped.
//!
//! ## Why Pull-Based?
//!
//! Polling looks naive next to a push channel, but it is load-bearing
//! here: the poll loop is the *only* place gaps can be detected (a
//! missing id never generates a notification by definition), and it
//! keeps one tail query serving every subscriber instead of one per
//! watch. A notification layer could reduce idle polling, but it would
//! sit on top of this loop, not replace it.
//!
//! ## Rust Concepts
//!
//! - **Actor loop**: the poller owns all mutable watch state; the only
//!   way in is a control message, so there are no locks around the
//!   subscriber table
//! - **Bounded `mpsc` per subscriber**: the delivery buffer doubles as
//!   the backpressure boundary — `try_send` failing *is* the slow
//!   consumer signal
//! - **`oneshot` terminal error**: a full buffer can't carry its own
//!   error, so teardown parks it on a side channel the subscription
//!   checks after draining
//! - **`futures::Stream`**: subscriptions also work with `StreamExt`
//!   combinators for callers that prefer them over `next()`

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch as shutdown_signal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::engine::{prefix_range, Engine};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::types::{Event, KvRow, Revision};

/// Capacity of each subscription's delivery buffer.
pub const WATCH_BUFFER: usize = 1024;

/// Rows fetched per tail query. A full batch triggers an immediate
/// re-poll.
const POLL_BATCH_LIMIT: i64 = 500;

/// Capacity of the subscribe control channel.
const CONTROL_CHANNEL_SIZE: usize = 64;

// =============================================================================
// Subscriptions
// =============================================================================

/// A live change stream for one prefix.
///
/// Consume with [`Subscription::next`] or as a `futures::Stream`. The
/// stream ends (`None`) on store shutdown; it yields one terminal
/// `Err(SlowConsumer)` if the poller had to abandon it.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Result<Event>>,
    term: Option<oneshot::Receiver<Error>>,
}

impl Subscription {
    /// Receives the next event, waiting for one if none is buffered.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(event))` — the next matching change, in id order
    /// - `Some(Err(SlowConsumer))` — this subscription was torn down;
    ///   no further events follow
    /// - `None` — the store shut down (or the terminal error was
    ///   already consumed)
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut sub = store.watch("/registry/", Revision::ZERO).await?;
    /// while let Some(event) = sub.next().await {
    ///     match event {
    ///         Ok(event) => apply(event),
    ///         Err(err) => {
    ///             // Slow consumer: resync with a list + fresh watch.
    ///             eprintln!("watch ended: {err}");
    ///             break;
    ///         }
    ///     }
    /// }
    /// ```
    pub async fn next(&mut self) -> Option<Result<Event>> {
        match self.rx.recv().await {
            Some(item) => Some(item),
            None => match self.term.take() {
                Some(term) => match term.await {
                    Ok(err) => Some(Err(err)),
                    Err(_) => None,
                },
                None => None,
            },
        }
    }

    /// Receives a buffered event without waiting.
    pub fn try_next(&mut self) -> Option<Result<Event>> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Result<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
            Poll::Ready(None) => match this.term.as_mut() {
                Some(term) => match Pin::new(term).poll(cx) {
                    Poll::Ready(Ok(err)) => {
                        this.term = None;
                        Poll::Ready(Some(Err(err)))
                    }
                    Poll::Ready(Err(_)) => {
                        this.term = None;
                        Poll::Ready(None)
                    }
                    Poll::Pending => Poll::Pending,
                },
                None => Poll::Ready(None),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A subscriber as tracked by the poller.
struct Subscriber {
    /// Range bounds precomputed from the prefix.
    start: String,
    end: String,
    /// Greatest event id delivered so far; starts at the subscription's
    /// `start_rev`, so earlier ids are dropped even across replays.
    delivered: i64,
    tx: mpsc::Sender<Result<Event>>,
    term: Option<oneshot::Sender<Error>>,
}

impl Subscriber {
    fn wants(&self, key: &str) -> bool {
        key >= self.start.as_str() && key < self.end.as_str()
    }
}

// =============================================================================
// Watch hub (public entry point)
// =============================================================================

/// Handle for creating subscriptions. Cheap to clone.
#[derive(Clone)]
pub struct WatchHub {
    engine: Arc<Engine>,
    control_tx: mpsc::Sender<Subscriber>,
}

impl WatchHub {
    /// Subscribes to changes under `prefix`, starting after
    /// `start_rev`.
    ///
    /// `start_rev = 0` means "from the beginning of retained history".
    /// A non-zero `start_rev` below the compact watermark is rejected
    /// with `Compacted`.
    pub async fn watch(&self, prefix: &str, start_rev: Revision) -> Result<Subscription> {
        let (compact, current) = self.engine.compact_revision().await?;
        if !start_rev.is_zero() && start_rev.get() < compact.get() {
            return Err(Error::Compacted {
                revision: start_rev.get(),
                compact_revision: compact.get(),
            });
        }
        trace!(prefix, %start_rev, %current, "starting watch");

        let (start, end) = prefix_range(prefix);
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let (term_tx, term_rx) = oneshot::channel();
        let subscriber = Subscriber {
            start,
            end,
            delivered: start_rev.get(),
            tx,
            term: Some(term_tx),
        };
        self.control_tx
            .send(subscriber)
            .await
            .map_err(|_| Error::Closed)?;
        Ok(Subscription {
            rx,
            term: Some(term_rx),
        })
    }
}

// =============================================================================
// Poller
// =============================================================================

/// Spawns the shared poller task and returns the hub that feeds it.
pub(crate) fn spawn_poller(
    engine: Arc<Engine>,
    metrics: Arc<Metrics>,
    poll_interval: Duration,
    query_timeout: Duration,
    shutdown: shutdown_signal::Receiver<bool>,
) -> (WatchHub, JoinHandle<()>) {
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
    let hub = WatchHub {
        engine: Arc::clone(&engine),
        control_tx,
    };
    let poller = Poller {
        engine,
        metrics,
        poll_interval,
        query_timeout,
        control_rx,
        shutdown,
        subscribers: Vec::new(),
        last_seen: 0,
        gaps: BTreeMap::new(),
    };
    let handle = tokio::spawn(poller.run());
    (hub, handle)
}

struct Poller {
    engine: Arc<Engine>,
    metrics: Arc<Metrics>,
    poll_interval: Duration,
    query_timeout: Duration,
    control_rx: mpsc::Receiver<Subscriber>,
    shutdown: shutdown_signal::Receiver<bool>,
    subscribers: Vec<Subscriber>,
    /// Greatest id this poller has observed (or rewound to).
    last_seen: i64,
    /// Missing ids and when they were first noticed.
    gaps: BTreeMap<i64, Instant>,
}

impl Poller {
    async fn run(mut self) {
        self.last_seen = match self.engine.current_revision().await {
            Ok(rev) => rev.get(),
            Err(err) => {
                warn!(error = %err, "failed to read current revision at poller start");
                0
            }
        };
        debug!(last_seen = self.last_seen, "watch poller started");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                maybe = self.control_rx.recv() => match maybe {
                    Some(subscriber) => self.add_subscriber(subscriber),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.prune_closed();
                    self.poll_tick().await;
                }
            }
        }
        debug!("watch poller stopped");
    }

    fn add_subscriber(&mut self, subscriber: Subscriber) {
        // Rewind to serve retained history, but never below the compact
        // watermark: compaction legitimately removed those ids, and
        // replaying across the boundary would misread pruned ids as
        // fillable gaps.
        let floor = self
            .engine
            .cached_compact_revision()
            .get()
            .max(subscriber.delivered);
        if floor < self.last_seen {
            trace!(from = self.last_seen, to = floor, "rewinding poller for new subscriber");
            self.last_seen = floor;
        }
        self.metrics.watch_subscribers.inc();
        self.subscribers.push(subscriber);
    }

    fn prune_closed(&mut self) {
        let before = self.subscribers.len();
        self.subscribers.retain(|sub| !sub.tx.is_closed());
        for _ in self.subscribers.len()..before {
            self.metrics.watch_subscribers.dec();
        }
    }

    async fn poll_tick(&mut self) {
        loop {
            let tail = self
                .engine
                .after(Revision::new(self.last_seen), POLL_BATCH_LIMIT);
            let batch = match tokio::time::timeout(self.query_timeout, tail).await {
                Ok(Ok(rows)) => rows,
                Ok(Err(err)) => {
                    warn!(error = %err, "watch poll query failed");
                    return;
                }
                Err(_) => {
                    let err = Error::Canceled("watch query timed out");
                    warn!(error = %err, timeout = ?self.query_timeout, "watch poll query timed out");
                    return;
                }
            };

            let full = batch.len() as i64 >= POLL_BATCH_LIMIT;
            if batch.is_empty() {
                self.fill_expired_gaps().await;
                self.fill_tail().await;
                return;
            }
            self.process_batch(batch);
            self.fill_expired_gaps().await;
            if !full {
                return;
            }
            // A capped batch means more rows are already waiting.
        }
    }

    fn process_batch(&mut self, batch: Vec<KvRow>) {
        for row in batch {
            let id = row.id.get();
            for missing in (self.last_seen + 1)..id {
                self.gaps.entry(missing).or_insert_with(Instant::now);
            }
            self.gaps.remove(&id);
            self.last_seen = id;

            // Gap rows close holes in the id sequence; they are not
            // changes to any key.
            if row.is_gap() {
                continue;
            }
            self.fan_out(Event::from_row(&row));
        }
    }

    fn fan_out(&mut self, event: Event) {
        let id = event.revision().get();
        let mut dead: Vec<(usize, bool)> = Vec::new();
        for (index, sub) in self.subscribers.iter_mut().enumerate() {
            if id <= sub.delivered || !sub.wants(&event.kv.key) {
                continue;
            }
            match sub.tx.try_send(Ok(event.clone())) {
                Ok(()) => {
                    sub.delivered = id;
                    self.metrics.watch_events_total.inc();
                }
                Err(TrySendError::Full(_)) => dead.push((index, true)),
                Err(TrySendError::Closed(_)) => dead.push((index, false)),
            }
        }
        for (index, slow) in dead.into_iter().rev() {
            let mut sub = self.subscribers.swap_remove(index);
            self.metrics.watch_subscribers.dec();
            if slow {
                warn!(
                    prefix = %sub.start,
                    delivered = sub.delivered,
                    "terminating slow watch subscriber"
                );
                if let Some(term) = sub.term.take() {
                    let _ = term.send(Error::SlowConsumer {
                        buffered: WATCH_BUFFER,
                    });
                }
            }
        }
    }

    /// Quiet tick safety net: ids were allocated past `last_seen` but
    /// no rows came back, so mint tombstones up to the current
    /// revision. Collisions with rows that appear concurrently are
    /// lost races and ignored.
    async fn fill_tail(&mut self) {
        let current = match self.engine.current_revision().await {
            Ok(rev) => rev.get(),
            Err(err) => {
                warn!(error = %err, "failed to read current revision for tail fill");
                return;
            }
        };
        for id in (self.last_seen + 1)..=current {
            self.fill_one(id).await;
        }
    }

    async fn fill_expired_gaps(&mut self) {
        if self.gaps.is_empty() {
            return;
        }
        // One full interval of grace: the id's transaction may still be
        // in flight.
        let grace = self.poll_interval;
        let expired: Vec<i64> = self
            .gaps
            .iter()
            .filter(|(_, first_seen)| first_seen.elapsed() >= grace)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.fill_one(id).await;
        }
    }

    async fn fill_one(&mut self, id: i64) {
        match self.engine.fill(Revision::new(id)).await {
            Ok(()) => {
                debug!(id, "filled log gap");
                self.gaps.remove(&id);
            }
            Err(err) if err.is_constraint() => {
                // A real row won the id; it will be read as usual.
                self.gaps.remove(&id);
            }
            Err(err) => warn!(id, error = %err, "gap fill failed"),
        }
    }
}
