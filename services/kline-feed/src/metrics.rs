//! Observability and metrics for the kline feed
//!
//! Counters for the feed connection, the flush loop and backfills, plus
//! flush latency percentiles. Exported as a flat map for the status
//! endpoint.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Core metrics for the ingestion engine.
pub struct EngineMetrics {
    // Feed connection
    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
    pub rotations: AtomicU64,
    pub messages_received: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub stale_updates: AtomicU64,

    // Flush loop
    pub updates_buffered: AtomicU64,
    pub flushes: AtomicU64,
    pub paused_ticks: AtomicU64,
    pub candles_inserted: AtomicU64,
    pub candles_merged: AtomicU64,
    pub candles_rejected: AtomicU64,
    pub candles_evicted: AtomicU64,
    pub flush_latency_us: Mutex<LatencyTracker>,

    // Historical
    pub history_loaded: AtomicU64,
    pub backfills_issued: AtomicU64,
    pub backfills_failed: AtomicU64,
    pub candles_backfilled: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            connects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            malformed_messages: AtomicU64::new(0),
            stale_updates: AtomicU64::new(0),
            updates_buffered: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            paused_ticks: AtomicU64::new(0),
            candles_inserted: AtomicU64::new(0),
            candles_merged: AtomicU64::new(0),
            candles_rejected: AtomicU64::new(0),
            candles_evicted: AtomicU64::new(0),
            flush_latency_us: Mutex::new(LatencyTracker::new(1000)),
            history_loaded: AtomicU64::new(0),
            backfills_issued: AtomicU64::new(0),
            backfills_failed: AtomicU64::new(0),
            candles_backfilled: AtomicU64::new(0),
        }
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self, rotated: bool) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        if rotated {
            self.rotations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffered(&self) {
        self.updates_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_paused_tick(&self) {
        self.paused_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one applied batch.
    pub fn record_flush(&self, inserted: usize, merged: usize, rejected: usize, evicted: usize, latency_us: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.candles_inserted.fetch_add(inserted as u64, Ordering::Relaxed);
        self.candles_merged.fetch_add(merged as u64, Ordering::Relaxed);
        self.candles_rejected.fetch_add(rejected as u64, Ordering::Relaxed);
        self.candles_evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        if let Ok(mut tracker) = self.flush_latency_us.lock() {
            tracker.record(latency_us);
        }
    }

    pub fn record_history(&self, candles: usize) {
        self.history_loaded.store(candles as u64, Ordering::Relaxed);
    }

    pub fn record_backfill_issued(&self) {
        self.backfills_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backfill(&self, inserted: usize) {
        self.candles_backfilled.fetch_add(inserted as u64, Ordering::Relaxed);
    }

    pub fn record_backfill_failed(&self) {
        self.backfills_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters = [
            ("connects", &self.connects),
            ("disconnects", &self.disconnects),
            ("rotations", &self.rotations),
            ("messages_received", &self.messages_received),
            ("malformed_messages", &self.malformed_messages),
            ("stale_updates", &self.stale_updates),
            ("updates_buffered", &self.updates_buffered),
            ("flushes", &self.flushes),
            ("paused_ticks", &self.paused_ticks),
            ("candles_inserted", &self.candles_inserted),
            ("candles_merged", &self.candles_merged),
            ("candles_rejected", &self.candles_rejected),
            ("candles_evicted", &self.candles_evicted),
            ("history_loaded", &self.history_loaded),
            ("backfills_issued", &self.backfills_issued),
            ("backfills_failed", &self.backfills_failed),
            ("candles_backfilled", &self.candles_backfilled),
        ];

        let mut m: BTreeMap<String, u64> = counters
            .iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect();

        if let Ok(tracker) = self.flush_latency_us.lock() {
            if let Some(avg) = tracker.average() {
                m.insert("flush_latency_avg_us".to_string(), avg);
            }
            if let Some(p50) = tracker.percentile(50) {
                m.insert("flush_latency_p50_us".to_string(), p50);
            }
            if let Some(p99) = tracker.percentile(99) {
                m.insert("flush_latency_p99_us".to_string(), p99);
            }
        }
        m
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    /// Record a latency sample, evicting the oldest when full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p.min(100) as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }
}
