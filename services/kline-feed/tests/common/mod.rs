//! Shared fixtures for engine-level tests: a manual clock, an in-memory
//! historical source and a connector whose sessions are fed by the test.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kline_feed::engine::{Clock, EngineView, SeriesSnapshot};
use kline_feed::{FeedConfig, HistoricalFetcher, StreamConnector, StreamSession};
use kline_types::candle::{align_to_bucket, Candle, INTERVAL_MS};
use kline_types::errors::{FetchError, TransportError};
use tokio::sync::mpsc;

/// Minute-aligned reference time.
pub const T: i64 = 1_708_123_440_000;
pub const STREAM: &str = "btcusdt@kline_1m";

pub fn minute(n: i64) -> i64 {
    T + n * INTERVAL_MS
}

pub fn closed(m: i64, price: f64) -> Candle {
    Candle::closed(minute(m), price, price, price, price, 1.0)
}

pub fn kline_frame(bucket: i64, price: f64, is_closed: bool) -> String {
    format!(
        r#"{{"stream":"{STREAM}","data":{{"e":"kline","k":{{"t":{bucket},"o":"{price}","h":"{price}","l":"{price}","c":"{price}","v":"1","x":{is_closed}}}}}}}"#
    )
}

pub fn test_config() -> FeedConfig {
    FeedConfig {
        flush_interval: Duration::from_millis(500),
        reconnect_delay: Duration::from_secs(5),
        initial_load_backoff: Duration::from_millis(100),
        ..FeedConfig::default()
    }
}

/// Clock moved by hand.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now_ms: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(now_ms)))
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Historical source answering from an in-memory "exchange" series.
#[derive(Default)]
pub struct StubExchange {
    truth: Mutex<BTreeMap<i64, Candle>>,
    /// Candles only served to the n-th fetch call onward.
    late: Mutex<Vec<(usize, Candle)>>,
    calls: Mutex<Vec<(i64, i64, usize)>>,
    failing: AtomicBool,
}

impl StubExchange {
    pub fn new(candles: impl IntoIterator<Item = Candle>) -> Arc<Self> {
        let exchange = Self::default();
        exchange.publish(candles);
        Arc::new(exchange)
    }

    pub fn publish(&self, candles: impl IntoIterator<Item = Candle>) {
        let mut truth = self.truth.lock().unwrap();
        for c in candles {
            truth.insert(c.bucket_start, c);
        }
    }

    /// Publish candles that calls before `first_call` (0-based) do not see.
    pub fn publish_from_call(&self, first_call: usize, candles: impl IntoIterator<Item = Candle>) {
        let mut late = self.late.lock().unwrap();
        late.extend(candles.into_iter().map(|c| (first_call, c)));
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(i64, i64, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoricalFetcher for StubExchange {
    async fn fetch(&self, start: i64, end: i64, max: usize) -> Result<Vec<Candle>, FetchError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((start, end, max));
            calls.len() - 1
        };
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Status {
                url: "stub".to_string(),
                status: 503,
            });
        }
        let mut visible = self.truth.lock().unwrap().clone();
        for (first_call, c) in self.late.lock().unwrap().iter() {
            if call >= *first_call {
                visible.entry(c.bucket_start).or_insert(*c);
            }
        }
        Ok(visible
            .range(align_to_bucket(start)..=end)
            .map(|(_, c)| *c)
            .take(max)
            .collect())
    }
}

/// Connector handing out sessions the test writes into.
///
/// Dropping a session's sender closes that session; with no sessions
/// queued, a connect yields a session that never delivers.
#[derive(Default)]
pub struct ChannelConnector {
    sessions: Mutex<VecDeque<mpsc::UnboundedReceiver<String>>>,
}

impl ChannelConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue one session; frames sent on the returned sender are delivered.
    pub fn queue_session(&self) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().unwrap().push_back(rx);
        tx
    }
}

struct ChannelSession {
    frames: Option<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl StreamSession for ChannelSession {
    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        match self.frames.as_mut() {
            Some(rx) => rx.recv().await.map(Ok),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.frames = None;
    }
}

#[async_trait]
impl StreamConnector for ChannelConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn StreamSession>, TransportError> {
        let frames = self.sessions.lock().unwrap().pop_front();
        Ok(Box::new(ChannelSession { frames }))
    }
}

/// Wait (in paused time) until a published snapshot satisfies `predicate`.
pub async fn wait_for_series<F>(view: &EngineView, predicate: F) -> Arc<SeriesSnapshot>
where
    F: Fn(&SeriesSnapshot) -> bool,
{
    let mut rx = view.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if predicate(&snapshot) {
                return snapshot;
            }
            if rx.changed().await.is_err() {
                panic!("Engine stopped before the series matched");
            }
        }
    })
    .await;
    waited.expect("Timed out waiting for series")
}

/// Wait until the connectivity flag equals `expected`.
pub async fn wait_for_connectivity(view: &EngineView, expected: bool) {
    let mut rx = view.connectivity();
    let waited = tokio::time::timeout(Duration::from_secs(600), async {
        while *rx.borrow_and_update() != expected {
            if rx.changed().await.is_err() {
                panic!("Engine stopped before connectivity became {expected}");
            }
        }
    })
    .await;
    waited.expect("Timed out waiting for connectivity");
}

pub fn buckets(snapshot: &SeriesSnapshot) -> Vec<i64> {
    snapshot.candles.iter().map(|c| c.bucket_start).collect()
}

pub fn is_contiguous(snapshot: &SeriesSnapshot) -> bool {
    snapshot
        .candles
        .windows(2)
        .all(|w| w[1].bucket_start - w[0].bucket_start == INTERVAL_MS)
}
