//! Series reconciliation
//!
//! Owns the authoritative series: one candle per minute bucket, ascending,
//! bounded by the retention window. Live batches, the initial load and
//! backfills all funnel through here so every published view is
//! unique-by-bucket and sorted.

use std::collections::BTreeMap;

use kline_types::candle::{align_to_bucket, Candle};
use tracing::{debug, warn};

use crate::gap::{self, Gap};

/// Outcome of applying one flushed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub received: usize,
    /// New buckets appended to the series.
    pub inserted: usize,
    /// Existing buckets updated by the merge rule.
    pub merged: usize,
    /// Invalid candles dropped before merging.
    pub rejected: usize,
    /// Buckets trimmed by retention.
    pub evicted: usize,
    /// First gap left in the series after the batch, if any.
    pub gap: Option<Gap>,
}

impl ApplyReport {
    pub fn changed(&self) -> bool {
        self.inserted + self.merged + self.evicted > 0
    }
}

/// Single-writer owner of the candle series.
#[derive(Debug)]
pub struct Reconciler {
    candles: BTreeMap<i64, Candle>,
    retention_ms: i64,
    version: u64,
}

impl Reconciler {
    pub fn new(retention_ms: i64) -> Self {
        Self {
            candles: BTreeMap::new(),
            retention_ms,
            version: 0,
        }
    }

    /// Seed (or re-seed) from a historical load.
    ///
    /// Historical rows are merged with whatever live data already arrived.
    /// Rows for the still-open current minute are skipped: the REST source
    /// reports them as closed even though they are still moving.
    pub fn load_history(&mut self, candles: Vec<Candle>, now_ms: i64) -> usize {
        let current = align_to_bucket(now_ms);
        let mut loaded = 0;
        for candle in candles.into_iter().filter(|c| c.bucket() < current) {
            if !candle.is_valid() {
                warn!(bucket = candle.bucket_start, "Skipping invalid historical candle");
                continue;
            }
            self.upsert(candle);
            loaded += 1;
        }
        let evicted = self.trim(now_ms);
        self.bump();
        debug!(loaded, evicted, total = self.candles.len(), "History loaded into series");
        loaded
    }

    /// Apply one flushed batch in arrival order.
    pub fn apply_updates(&mut self, batch: Vec<Candle>, now_ms: i64) -> ApplyReport {
        let mut report = ApplyReport {
            received: batch.len(),
            ..ApplyReport::default()
        };

        for candle in batch {
            if !candle.is_valid() {
                warn!(bucket = candle.bucket_start, "Rejecting invalid candle update");
                report.rejected += 1;
                continue;
            }
            if self.upsert(candle) {
                report.inserted += 1;
            } else {
                report.merged += 1;
            }
        }

        report.evicted = self.trim(now_ms);
        report.gap = self.first_gap();
        if report.changed() {
            self.bump();
        }
        report
    }

    /// Merge backfilled candles, never overwriting buckets already held.
    ///
    /// Partials for past minutes are kept as-is; see [`gap::fill_missing`].
    pub fn merge_backfill(&mut self, fetched: Vec<Candle>, now_ms: i64) -> usize {
        let current = align_to_bucket(now_ms);
        let floor = self.retention_floor(now_ms);
        let usable = fetched
            .into_iter()
            .filter(|c| c.is_valid() && c.bucket() < current && c.bucket() > floor);

        let inserted = gap::fill_missing(&mut self.candles, usable);
        let evicted = self.trim(now_ms);
        if inserted + evicted > 0 {
            self.bump();
        }
        inserted
    }

    /// Drop buckets whose age has reached the retention window.
    pub fn trim(&mut self, now_ms: i64) -> usize {
        let floor = self.retention_floor(now_ms);
        let before = self.candles.len();
        self.candles = self.candles.split_off(&floor.saturating_add(1));
        before - self.candles.len()
    }

    /// First gap between consecutive buckets.
    pub fn first_gap(&self) -> Option<Gap> {
        gap::find_first_gap(self.candles.keys())
    }

    /// Missing buckets between the newest candle and the current minute.
    pub fn trailing_gap(&self, now_ms: i64) -> Option<Gap> {
        gap::find_trailing_gap(self.last().map(|c| c.bucket_start), now_ms)
    }

    /// Ordered copy of the series.
    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.values().next_back()
    }

    /// Incremented on every change to the series.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn retention_floor(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.retention_ms)
    }

    /// Merge into the series; `true` when the bucket was new.
    fn upsert(&mut self, incoming: Candle) -> bool {
        let bucket = incoming.bucket();
        let existing = self.candles.get(&bucket);
        let is_new = existing.is_none();
        let merged = Candle::merge(existing, &incoming);
        self.candles.insert(bucket, merged);
        is_new
    }

    fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}
