//! Gap detection and backfill
//!
//! Walks the ordered series for missing minute buckets and repairs the
//! first one found with a single bounded historical call. One gap per
//! pass: the next flush schedules the next pass, so several gaps heal
//! over successive passes.

use std::collections::BTreeMap;

use kline_types::candle::{align_to_bucket, Candle, INTERVAL_MS};
use kline_types::errors::FetchError;
use serde::Serialize;
use tracing::debug;

use crate::historical::HistoricalFetcher;

/// Extra buckets requested around a gap to absorb boundary rounding.
const BACKFILL_MARGIN: usize = 2;

/// A run of missing buckets between two present ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Gap {
    /// Bucket present just before the gap.
    pub start_ms: i64,
    /// Bucket present (or expected, for the live edge) just after the gap.
    pub end_ms: i64,
}

impl Gap {
    /// Distance between the two boundary buckets.
    pub fn span_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    /// Number of buckets missing strictly between the boundaries.
    pub fn missing_buckets(&self) -> usize {
        usize::try_from(self.span_ms() / INTERVAL_MS - 1).unwrap_or(0)
    }

    /// Candles to request: `ceil(span / 1m) + 2`.
    pub fn candles_to_fetch(&self) -> usize {
        let buckets = (self.span_ms() + INTERVAL_MS - 1).div_euclid(INTERVAL_MS);
        usize::try_from(buckets).unwrap_or(0) + BACKFILL_MARGIN
    }
}

/// First pair of consecutive buckets more than one interval apart.
pub fn find_first_gap<'a, I>(buckets: I) -> Option<Gap>
where
    I: IntoIterator<Item = &'a i64>,
{
    let mut iter = buckets.into_iter().copied();
    let mut prev = iter.next()?;
    for bucket in iter {
        if bucket - prev > INTERVAL_MS {
            return Some(Gap {
                start_ms: prev,
                end_ms: bucket,
            });
        }
        prev = bucket;
    }
    None
}

/// Missing closed buckets between the newest candle and the current minute.
pub fn find_trailing_gap(last_bucket: Option<i64>, now_ms: i64) -> Option<Gap> {
    let current = align_to_bucket(now_ms);
    let last = last_bucket?;
    if current - last > INTERVAL_MS {
        Some(Gap {
            start_ms: last,
            end_ms: current,
        })
    } else {
        None
    }
}

/// A bounded historical request that repairs one gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRequest {
    pub gap: Gap,
    pub range_start_ms: i64,
    pub range_end_ms: i64,
    pub max_candles: usize,
}

impl BackfillRequest {
    /// Anchor the request at `now - count` minutes.
    ///
    /// A gap that starts before that window is older than the live edge;
    /// the request is then anchored at the gap start so it still converges.
    /// The candle count is capped at `page_limit`; larger gaps shrink pass
    /// by pass.
    pub fn plan(gap: Gap, now_ms: i64, page_limit: usize) -> Self {
        let max_candles = gap.candles_to_fetch().min(page_limit.max(1));
        let window_ms = max_candles as i64 * INTERVAL_MS;
        let anchored_start = now_ms - window_ms;

        let (range_start_ms, range_end_ms) = if gap.start_ms < anchored_start {
            (gap.start_ms, gap.start_ms + window_ms)
        } else {
            (anchored_start, now_ms)
        };

        Self {
            gap,
            range_start_ms,
            range_end_ms,
            max_candles,
        }
    }

    /// Issue the historical call.
    pub async fn execute(&self, fetcher: &dyn HistoricalFetcher) -> Result<Vec<Candle>, FetchError> {
        debug!(
            gap_start = self.gap.start_ms,
            gap_end = self.gap.end_ms,
            range_start = self.range_start_ms,
            range_end = self.range_end_ms,
            max_candles = self.max_candles,
            "Issuing backfill fetch"
        );
        fetcher
            .fetch(self.range_start_ms, self.range_end_ms, self.max_candles)
            .await
    }
}

/// Merge fetched candles into the series, skipping buckets already held.
///
/// A held bucket is never replaced, even a partial left over from before a
/// disconnect whose minute has since closed. It stays partial until the
/// stream re-delivers it; live data always takes precedence over fetched
/// rows.
///
/// Returns the number of candles inserted.
pub fn fill_missing(series: &mut BTreeMap<i64, Candle>, fetched: impl IntoIterator<Item = Candle>) -> usize {
    let mut inserted = 0;
    for candle in fetched {
        let bucket = candle.bucket();
        if let std::collections::btree_map::Entry::Vacant(slot) = series.entry(bucket) {
            slot.insert(Candle {
                bucket_start: bucket,
                ..candle
            });
            inserted += 1;
        }
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const T: i64 = 1_708_123_440_000;

    fn minute(n: i64) -> i64 {
        T + n * INTERVAL_MS
    }

    fn series(minutes: &[i64]) -> BTreeMap<i64, Candle> {
        minutes
            .iter()
            .map(|&m| (minute(m), Candle::closed(minute(m), 1.0, 1.0, 1.0, 1.0, 1.0)))
            .collect()
    }

    #[test]
    fn test_contiguous_series_has_no_gap() {
        let s = series(&[0, 1, 2, 3]);
        assert_eq!(find_first_gap(s.keys()), None);
        assert_eq!(find_first_gap(series(&[]).keys()), None);
        assert_eq!(find_first_gap(series(&[5]).keys()), None);
    }

    #[test]
    fn test_single_missing_bucket_is_a_gap() {
        let s = series(&[0, 1, 3]);
        let gap = find_first_gap(s.keys()).unwrap();
        assert_eq!(gap, Gap { start_ms: minute(1), end_ms: minute(3) });
        assert_eq!(gap.missing_buckets(), 1);
        assert_eq!(gap.candles_to_fetch(), 4);
    }

    #[test]
    fn test_only_first_gap_is_reported() {
        let s = series(&[0, 2, 3, 7]);
        let gap = find_first_gap(s.keys()).unwrap();
        assert_eq!(gap, Gap { start_ms: minute(0), end_ms: minute(2) });
    }

    #[test]
    fn test_candle_count_rounds_up() {
        let gap = Gap {
            start_ms: T,
            end_ms: T + 2 * INTERVAL_MS + 1,
        };
        assert_eq!(gap.candles_to_fetch(), 3 + BACKFILL_MARGIN);
    }

    #[test]
    fn test_trailing_gap() {
        // Last candle two minutes before the current (open) minute
        assert_eq!(
            find_trailing_gap(Some(minute(0)), minute(2) + 5_000),
            Some(Gap { start_ms: minute(0), end_ms: minute(2) })
        );
        // Last candle is the previous minute: nothing missing
        assert_eq!(find_trailing_gap(Some(minute(1)), minute(2) + 5_000), None);
        assert_eq!(find_trailing_gap(None, minute(2)), None);
    }

    #[test]
    fn test_plan_anchors_at_now() {
        let gap = Gap { start_ms: minute(7), end_ms: minute(9) };
        let now = minute(10) + 30_000;
        let req = BackfillRequest::plan(gap, now, 1000);

        assert_eq!(req.max_candles, 4);
        assert_eq!(req.range_end_ms, now);
        assert_eq!(req.range_start_ms, now - 4 * INTERVAL_MS);
        assert!(req.range_start_ms <= minute(8));
    }

    #[test]
    fn test_plan_anchors_old_gap_at_its_start() {
        let gap = Gap { start_ms: minute(0), end_ms: minute(3) };
        let now = minute(600);
        let req = BackfillRequest::plan(gap, now, 1000);

        assert_eq!(req.range_start_ms, minute(0));
        assert_eq!(req.range_end_ms, minute(5));
        assert_eq!(req.max_candles, 5);
    }

    #[test]
    fn test_plan_caps_at_page_limit() {
        let gap = Gap { start_ms: minute(0), end_ms: minute(2000) };
        let req = BackfillRequest::plan(gap, minute(2001), 1000);
        assert_eq!(req.max_candles, 1000);
    }

    #[test]
    fn test_fill_missing_skips_present_buckets() {
        let mut s = series(&[0, 1, 3]);
        let live = Candle::partial(minute(3), 9.0, 9.0, 9.0, 9.0, 9.0);
        s.insert(minute(3), live);

        let fetched = vec![
            Candle::closed(minute(1), 5.0, 5.0, 5.0, 5.0, 5.0),
            Candle::closed(minute(2), 2.0, 2.0, 2.0, 2.0, 2.0),
            Candle::closed(minute(3), 3.0, 3.0, 3.0, 3.0, 3.0),
        ];
        let inserted = fill_missing(&mut s, fetched);

        assert_eq!(inserted, 1);
        assert_eq!(s.len(), 4);
        assert_eq!(s[&minute(1)].open, 1.0);
        assert_eq!(s[&minute(2)].open, 2.0);
        assert_eq!(s[&minute(3)], live);
        assert_eq!(find_first_gap(s.keys()), None);
    }

    struct Recorder {
        calls: Mutex<Vec<(i64, i64, usize)>>,
    }

    #[async_trait]
    impl HistoricalFetcher for Recorder {
        async fn fetch(&self, start: i64, end: i64, max: usize) -> Result<Vec<Candle>, FetchError> {
            self.calls.lock().unwrap().push((start, end, max));
            Ok(vec![Candle::closed(minute(2), 2.0, 2.0, 2.0, 2.0, 2.0)])
        }
    }

    #[tokio::test]
    async fn test_execute_issues_planned_call() {
        let fetcher = Recorder {
            calls: Mutex::new(Vec::new()),
        };
        let gap = Gap { start_ms: minute(1), end_ms: minute(3) };
        let req = BackfillRequest::plan(gap, minute(4), 1000);

        let fetched = req.execute(&fetcher).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(
            fetcher.calls.lock().unwrap().as_slice(),
            &[(req.range_start_ms, req.range_end_ms, req.max_candles)]
        );
    }
}
