//! Ingestion engine
//!
//! Wires the historical fetcher, the feed connection, the flush scheduler
//! and the reconciler into one single-writer task:
//!
//! ```text
//!  HistoricalFetcher ──initial load──┐
//!                                    ▼
//!  FeedConnection ──updates──► FlushScheduler ──batch──► Reconciler ──► watch<SeriesSnapshot>
//!        │                                                  │
//!        └──connectivity──► watch<bool>          first gap ─┴─► backfill task ─┐
//!                                                    ▲                         │
//!                                                    └──────── merge ◄─────────┘
//! ```
//!
//! Only the engine task mutates the series. Historical calls run on
//! spawned tasks and report back over a channel, so a slow fetch never
//! holds up a flush.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Local, TimeZone};
use kline_types::candle::Candle;
use kline_types::errors::FetchError;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{FeedConfig, HistoryStart};
use crate::connection::{shutdown_signalled, ConnectionHandle, ConnectionState, FeedConnection, StreamConnector};
use crate::events::FeedEvent;
use crate::gap::{BackfillRequest, Gap};
use crate::historical::{load_initial, HistoricalFetcher};
use crate::metrics::EngineMetrics;
use crate::reconciler::Reconciler;
use crate::scheduler::{FlushOutcome, FlushScheduler, PauseGate};

/// Wall-clock source in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// [`Clock`] backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Immutable view of the series as of one publish.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesSnapshot {
    /// Advances every time the series changes.
    pub version: u64,
    pub candles: Vec<Candle>,
}

impl SeriesSnapshot {
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.first()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

/// Start of the initial historical window.
pub fn history_start_ms(config: &FeedConfig, now_ms: i64) -> i64 {
    let retention_start = now_ms.saturating_sub(config.retention_ms());
    match config.history_start {
        HistoryStart::Retention => retention_start,
        HistoryStart::StartOfDay => local_start_of_day(now_ms)
            .map(|sod| sod.max(retention_start))
            .unwrap_or(retention_start),
    }
}

fn local_start_of_day(now_ms: i64) -> Option<i64> {
    let now = Local.timestamp_millis_opt(now_ms).single()?;
    let midnight = now.date_naive().and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Engine builder. [`FeedEngine::start`] spawns the tasks.
pub struct FeedEngine {
    config: FeedConfig,
    fetcher: Arc<dyn HistoricalFetcher>,
    connector: Arc<dyn StreamConnector>,
    clock: Arc<dyn Clock>,
}

impl FeedEngine {
    pub fn new(config: FeedConfig, fetcher: Arc<dyn HistoricalFetcher>, connector: Arc<dyn StreamConnector>) -> Self {
        Self {
            config,
            fetcher,
            connector,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start the initial load, the feed connection and the flush loop.
    pub fn start(self) -> EngineHandle {
        let metrics = Arc::new(EngineMetrics::new());
        let gate = PauseGate::new();

        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (series_tx, series_rx) = watch::channel(Arc::new(SeriesSnapshot::default()));
        let (connected_tx, connected_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connection = FeedConnection::new(&self.config, self.connector, feed_tx, metrics.clone()).spawn();
        let state_rx = connection.subscribe_state();

        info!(
            symbol = %self.config.symbol,
            stream = %self.config.stream_name(),
            flush_ms = self.config.flush_interval.as_millis() as u64,
            retention_buckets = self.config.retention_buckets(),
            "FeedEngine started"
        );

        let engine = EngineLoop {
            reconciler: Reconciler::new(self.config.retention_ms()),
            scheduler: FlushScheduler::new(self.config.flush_interval, gate.clone()),
            config: self.config,
            fetcher: self.fetcher,
            clock: self.clock,
            metrics: metrics.clone(),
            series_tx,
            connected_tx,
            internal_tx,
            history_ready: false,
            backfill_in_flight: false,
        };
        let task = tokio::spawn(engine.run(feed_rx, internal_rx, connection, shutdown_rx));

        EngineHandle {
            view: EngineView {
                series: series_rx,
                connected: connected_rx,
                connection_state: state_rx,
                gate,
                metrics,
            },
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

/// Read side of a running engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineView {
    series: watch::Receiver<Arc<SeriesSnapshot>>,
    connected: watch::Receiver<bool>,
    connection_state: watch::Receiver<ConnectionState>,
    gate: PauseGate,
    metrics: Arc<EngineMetrics>,
}

impl EngineView {
    /// Latest published series.
    pub fn series(&self) -> Arc<SeriesSnapshot> {
        self.series.borrow().clone()
    }

    /// Receiver notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SeriesSnapshot>> {
        self.series.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Receiver notified on every connectivity change.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.borrow()
    }

    /// Pause or resume flushing; returns the previous value.
    pub fn set_paused(&self, paused: bool) -> bool {
        let previous = self.gate.set(paused);
        if previous != paused {
            info!(paused, "Flush pause toggled");
        }
        previous
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }
}

/// Owner handle of a running engine.
pub struct EngineHandle {
    view: EngineView,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn view(&self) -> EngineView {
        self.view.clone()
    }

    pub fn series(&self) -> Arc<SeriesSnapshot> {
        self.view.series()
    }

    pub fn is_connected(&self) -> bool {
        self.view.is_connected()
    }

    pub fn set_paused(&self, paused: bool) -> bool {
        self.view.set_paused(paused)
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        self.view.metrics()
    }

    /// Tear the engine down and wait for it. Safe to call more than once.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Engine task failed");
            }
            info!("FeedEngine stopped");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Results of historical calls running off the engine task.
enum HistoryEvent {
    Loaded(Result<Vec<Candle>, FetchError>),
    Backfilled {
        gap: Gap,
        result: Result<Vec<Candle>, FetchError>,
    },
}

struct EngineLoop {
    config: FeedConfig,
    fetcher: Arc<dyn HistoricalFetcher>,
    clock: Arc<dyn Clock>,
    reconciler: Reconciler,
    scheduler: FlushScheduler,
    metrics: Arc<EngineMetrics>,
    series_tx: watch::Sender<Arc<SeriesSnapshot>>,
    connected_tx: watch::Sender<bool>,
    internal_tx: mpsc::UnboundedSender<HistoryEvent>,
    /// Gap passes wait for the initial load to settle.
    history_ready: bool,
    backfill_in_flight: bool,
}

impl EngineLoop {
    async fn run(
        mut self,
        mut feed_rx: mpsc::UnboundedReceiver<FeedEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<HistoryEvent>,
        mut connection: ConnectionHandle,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.spawn_initial_load();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => break,
                Some(event) = internal_rx.recv() => self.on_history(event),
                Some(event) = feed_rx.recv() => self.on_feed(event),
                outcome = self.scheduler.tick() => self.on_flush(outcome),
            }
        }

        let EngineLoop {
            scheduler,
            series_tx,
            connected_tx,
            ..
        } = self;

        // Flush timer first, then the connection's timers and socket.
        let unflushed = scheduler.pending();
        drop(scheduler);
        connection.stop().await;

        // Observers last.
        connected_tx.send_replace(false);
        drop(feed_rx);
        drop(internal_rx);
        drop(connected_tx);
        drop(series_tx);
        debug!(unflushed, "Engine loop exited");
    }

    fn spawn_initial_load(&self) {
        let now = self.clock.now_ms();
        let start = history_start_ms(&self.config, now);
        let fetcher = self.fetcher.clone();
        let tx = self.internal_tx.clone();
        let page_limit = self.config.page_limit;
        let attempts = self.config.initial_load_attempts;
        let backoff = self.config.initial_load_backoff;

        debug!(start_ms = start, end_ms = now, "Starting initial historical load");
        tokio::spawn(async move {
            let result = load_initial(fetcher, start, now, page_limit, attempts, backoff).await;
            let _ = tx.send(HistoryEvent::Loaded(result));
        });
    }

    fn on_feed(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Update(candle) => {
                self.metrics.record_buffered();
                self.scheduler.push(candle);
            }
            FeedEvent::Connectivity(connected) => {
                self.connected_tx.send_replace(connected);
                info!(connected, "Connectivity changed");
            }
        }
    }

    fn on_flush(&mut self, outcome: FlushOutcome) {
        let batch = match outcome {
            FlushOutcome::Drained(batch) => batch,
            FlushOutcome::Empty => return,
            FlushOutcome::Paused { pending } => {
                self.metrics.record_paused_tick();
                debug!(pending, "Flush paused");
                return;
            }
        };

        let started = Instant::now();
        let now = self.clock.now_ms();
        let report = self.reconciler.apply_updates(batch, now);
        if report.changed() {
            self.publish();
        }
        self.metrics.record_flush(
            report.inserted,
            report.merged,
            report.rejected,
            report.evicted,
            started.elapsed().as_micros() as u64,
        );
        debug!(
            received = report.received,
            inserted = report.inserted,
            merged = report.merged,
            evicted = report.evicted,
            version = self.reconciler.version(),
            "Batch applied"
        );

        if let Some(gap) = report.gap {
            self.request_backfill(gap, now);
        }
    }

    fn on_history(&mut self, event: HistoryEvent) {
        let now = self.clock.now_ms();
        match event {
            HistoryEvent::Loaded(Ok(candles)) => {
                let loaded = self.reconciler.load_history(candles, now);
                self.metrics.record_history(loaded);
                self.publish();
                self.history_ready = true;
                info!(loaded, total = self.reconciler.len(), "Series seeded from history");

                let gap = self.reconciler.first_gap().or_else(|| self.reconciler.trailing_gap(now));
                if let Some(gap) = gap {
                    self.request_backfill(gap, now);
                }
            }
            HistoryEvent::Loaded(Err(err)) => {
                self.history_ready = true;
                error!(error = %err, "Initial historical load failed, series starts from live data");
            }
            HistoryEvent::Backfilled { gap, result } => {
                self.backfill_in_flight = false;
                match result {
                    Ok(fetched) => {
                        let returned = fetched.len();
                        let inserted = self.reconciler.merge_backfill(fetched, now);
                        self.metrics.record_backfill(inserted);
                        if inserted > 0 {
                            self.publish();
                        }
                        info!(gap_start = gap.start_ms, gap_end = gap.end_ms, returned, inserted, "Backfill merged");
                    }
                    Err(err) => {
                        self.metrics.record_backfill_failed();
                        warn!(
                            gap_start = gap.start_ms,
                            gap_end = gap.end_ms,
                            error = %err,
                            "Backfill failed, gap left for next pass"
                        );
                    }
                }
            }
        }
    }

    /// Issue one backfill unless one is already running.
    fn request_backfill(&mut self, gap: Gap, now_ms: i64) {
        if !self.history_ready || self.backfill_in_flight {
            return;
        }
        self.backfill_in_flight = true;
        self.metrics.record_backfill_issued();

        let request = BackfillRequest::plan(gap, now_ms, self.config.page_limit);
        let fetcher = self.fetcher.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = request.execute(fetcher.as_ref()).await;
            let _ = tx.send(HistoryEvent::Backfilled { gap, result });
        });
    }

    fn publish(&self) {
        let snapshot = SeriesSnapshot {
            version: self.reconciler.version(),
            candles: self.reconciler.snapshot(),
        };
        self.series_tx.send_replace(Arc::new(snapshot));
    }
}
