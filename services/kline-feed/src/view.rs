//! Consumer views over a published series
//!
//! Pure functions the display layer calls on a snapshot: range selection
//! for zoom controls, close-price and percent-change series, and the
//! fixed-width chart window.

use kline_types::candle::{align_to_bucket, Candle, INTERVAL_MS};
use serde::Serialize;

/// Visible time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSelection {
    /// Everything retained.
    All,
    /// The last `n` minutes up to now.
    LastMinutes(u32),
}

impl RangeSelection {
    /// `(start, end)` domain in epoch milliseconds, or `None` for
    /// [`RangeSelection::All`].
    pub fn domain(&self, now_ms: i64) -> Option<(i64, i64)> {
        match *self {
            RangeSelection::All => None,
            RangeSelection::LastMinutes(n) => Some((now_ms - i64::from(n) * INTERVAL_MS, now_ms)),
        }
    }

    /// Candles whose bucket falls inside the domain.
    pub fn select<'a>(&self, candles: &'a [Candle], now_ms: i64) -> &'a [Candle] {
        let Some((start, end)) = self.domain(now_ms) else {
            return candles;
        };
        let lo = candles.partition_point(|c| c.bucket_start < align_to_bucket(start));
        let hi = candles.partition_point(|c| c.bucket_start <= end);
        &candles[lo..hi.max(lo)]
    }
}

/// One point of a line series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub time_ms: i64,
    pub value: f64,
}

/// Close price per candle.
pub fn price_points(candles: &[Candle]) -> Vec<PricePoint> {
    candles
        .iter()
        .map(|c| PricePoint {
            time_ms: c.bucket_start,
            value: c.close,
        })
        .collect()
}

/// Percent change of each close relative to the first candle's close.
///
/// Empty when the first close is zero.
pub fn percent_change_points(candles: &[Candle]) -> Vec<PricePoint> {
    let Some(base) = candles.first().map(|c| c.close).filter(|b| *b != 0.0) else {
        return Vec::new();
    };
    candles
        .iter()
        .map(|c| PricePoint {
            time_ms: c.bucket_start,
            value: (c.close - base) / base * 100.0,
        })
        .collect()
}

/// The last `limit` candles, ending at the current minute.
///
/// When the current minute has no candle yet, a flat candle at the last
/// close is appended so the chart's right edge stays at "now".
pub fn chart_window(candles: &[Candle], limit: usize, now_ms: i64) -> Vec<Candle> {
    if limit == 0 {
        return Vec::new();
    }
    let current = align_to_bucket(now_ms);
    let mut window: Vec<Candle> = candles.iter().filter(|c| c.bucket_start <= current).copied().collect();

    if let Some(last) = window.last().copied() {
        if last.bucket_start < current {
            window.push(Candle::flat(current, last.close));
        }
    }

    let skip = window.len().saturating_sub(limit);
    window.split_off(skip)
}
