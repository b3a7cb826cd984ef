//! Fixed-cadence polling of the call feed into the reconciling store.
//!
//! A [`Poller`] owns the single writer handle of the store. Every cycle
//! fetches a snapshot, reconciles it inside one store transaction, then
//! publishes the fetched snapshot as the current [`LiveView`]. Cycles never
//! overlap: the scheduled loop and [`Poller::poll_once`] share one guard.

mod source;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use callwatch_core::{
    now_utc, CallRecord, CallwatchError, HistoryOptions, ReconcileReport, Result,
};
use callwatch_store_sqlite::SqliteCallStore;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub use source::{HttpSnapshotSource, SnapshotSource, DEFAULT_FEED_URL};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Bounds only the fetch; an in-flight reconcile is never cut short.
    pub fetch_timeout: Option<Duration>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
        }
    }
}

/// What live-view consumers see: the last successfully fetched snapshot, as
/// reported by the feed, plus the most recent cycle failure if any.
#[derive(Debug, Clone, Default)]
pub struct LiveView {
    pub snapshot: Arc<Vec<CallRecord>>,
    pub fetched_at: Option<OffsetDateTime>,
    pub last_error: Option<CallwatchError>,
    pub completed_cycles: u64,
}

struct Shared<S> {
    source: S,
    store: Arc<Mutex<SqliteCallStore>>,
    config: PollerConfig,
    live: watch::Sender<LiveView>,
    cycle_guard: tokio::sync::Mutex<()>,
}

pub struct Poller<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Poller<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: SnapshotSource + 'static> Poller<S> {
    pub fn new(source: S, store: SqliteCallStore, config: PollerConfig) -> Self {
        Self::with_shared_store(source, Arc::new(Mutex::new(store)), config)
    }

    pub fn with_shared_store(
        source: S,
        store: Arc<Mutex<SqliteCallStore>>,
        config: PollerConfig,
    ) -> Self {
        let (live, _) = watch::channel(LiveView::default());
        Self {
            shared: Arc::new(Shared {
                source,
                store,
                config,
                live,
                cycle_guard: tokio::sync::Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> PollerConfig {
        self.shared.config
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LiveView> {
        self.shared.live.subscribe()
    }

    #[must_use]
    pub fn live_view(&self) -> LiveView {
        self.shared.live.borrow().clone()
    }

    /// Runs one fetch, reconcile and publish cycle.
    ///
    /// Waits for any cycle already in flight. A failed fetch aborts before
    /// the store is touched and leaves the published snapshot as it was.
    ///
    /// # Errors
    /// [`CallwatchError::Network`] when the fetch fails or times out,
    /// [`CallwatchError::Storage`] when the reconcile transaction fails.
    pub async fn poll_once(&self) -> Result<ReconcileReport> {
        let _cycle = self.shared.cycle_guard.lock().await;

        let snapshot = match self.fetch().await {
            Ok(records) => Arc::new(records),
            Err(err) => {
                warn!(error = %err, "snapshot fetch failed, keeping previous live view");
                self.record_error(&err);
                return Err(err);
            }
        };
        let fetched_at = now_utc();

        let store = Arc::clone(&self.shared.store);
        let records = Arc::clone(&snapshot);
        let reconciled = tokio::task::spawn_blocking(move || {
            let mut store = store
                .lock()
                .map_err(|_| CallwatchError::Storage("store mutex poisoned".to_string()))?;
            store.reconcile(&records)
        })
        .await
        .map_err(|err| CallwatchError::Storage(format!("reconcile task failed: {err}")))
        .and_then(|outcome| outcome);

        let report = match reconciled {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "reconcile failed, snapshot not published");
                self.record_error(&err);
                return Err(err);
            }
        };

        self.shared.live.send_modify(|view| {
            view.snapshot = snapshot;
            view.fetched_at = Some(fetched_at);
            view.last_error = None;
            view.completed_cycles += 1;
        });
        debug!(live_calls = report.snapshot_rows, "live view published");
        Ok(report)
    }

    /// Runs a history query against the store between reconcile batches.
    ///
    /// # Errors
    /// Propagates storage failures from the query.
    pub async fn history(&self, options: HistoryOptions) -> Result<Vec<CallRecord>> {
        let store = Arc::clone(&self.shared.store);
        tokio::task::spawn_blocking(move || {
            let store = store
                .lock()
                .map_err(|_| CallwatchError::Storage("store mutex poisoned".to_string()))?;
            store.query_history(&options)
        })
        .await
        .map_err(|err| CallwatchError::Storage(format!("history task failed: {err}")))?
    }

    /// Spawns the scheduled loop on the current tokio runtime. The first
    /// cycle runs immediately.
    #[must_use]
    pub fn start(&self) -> PollerHandle<S> {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let poller = self.clone();
        let interval = self.shared.config.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
            info!(interval_ms, "poller started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Failures are already logged and published to the live view.
                        let _ = poller.poll_once().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("poller stopped");
        });

        PollerHandle {
            poller: self.clone(),
            shutdown,
            task,
        }
    }

    async fn fetch(&self) -> Result<Vec<CallRecord>> {
        match self.shared.config.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, self.shared.source.fetch())
                .await
                .map_err(|_| {
                    CallwatchError::Network(format!(
                        "snapshot fetch timed out after {} ms",
                        limit.as_millis()
                    ))
                })?,
            None => self.shared.source.fetch().await,
        }
    }

    fn record_error(&self, err: &CallwatchError) {
        self.shared.live.send_modify(|view| {
            view.last_error = Some(err.clone());
        });
    }
}

/// Running scheduled loop. Dropping the handle also stops the loop.
pub struct PollerHandle<S> {
    poller: Poller<S>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<S: SnapshotSource + 'static> PollerHandle<S> {
    #[must_use]
    pub fn poller(&self) -> &Poller<S> {
        &self.poller
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LiveView> {
        self.poller.subscribe()
    }

    /// Triggers a cycle outside the schedule, serialized with the loop.
    ///
    /// # Errors
    /// Same as [`Poller::poll_once`].
    pub async fn poll_now(&self) -> Result<ReconcileReport> {
        self.poller.poll_once().await
    }

    /// Stops the loop once any in-flight cycle has finished.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "poller task ended abnormally");
        }
    }
}
