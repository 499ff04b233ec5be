//! Per-minute OHLCV candle and its merge rule
//!
//! A candle is keyed by its minute bucket (`bucket_start`, epoch
//! milliseconds truncated to the minute boundary). Live updates for the
//! same bucket are folded together with [`Candle::merge`]; once a candle is
//! closed it is terminal and partial updates no longer touch it.

use serde::{Deserialize, Serialize};

/// Length of one bucket in milliseconds.
pub const INTERVAL_MS: i64 = 60_000;

/// Interval label used on the wire (`interval=1m`, `@kline_1m`).
pub const INTERVAL_LABEL: &str = "1m";

/// Align an epoch-millisecond timestamp to its minute bucket (floor).
pub fn align_to_bucket(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(INTERVAL_MS) * INTERVAL_MS
}

/// One minute bucket of price activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Bucket start, epoch milliseconds on a minute boundary.
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Cumulative traded volume within the bucket.
    pub volume: f64,
    /// Final print from the exchange; never reverts to `false`.
    pub is_closed: bool,
}

impl Candle {
    /// A closed candle, as delivered by the historical source.
    pub fn closed(bucket_start: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            bucket_start: align_to_bucket(bucket_start),
            open,
            high,
            low,
            close,
            volume,
            is_closed: true,
        }
    }

    /// A partial (still accumulating) candle.
    pub fn partial(bucket_start: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            is_closed: false,
            ..Self::closed(bucket_start, open, high, low, close, volume)
        }
    }

    /// A partial candle built from a single trade print.
    ///
    /// `cumulative_volume` is the bucket's running volume including this trade.
    pub fn from_trade(timestamp_ms: i64, price: f64, cumulative_volume: f64) -> Self {
        Self::partial(timestamp_ms, price, price, price, price, cumulative_volume)
    }

    /// A flat, open, zero-volume candle carrying `price` on every field.
    pub fn flat(bucket_start: i64, price: f64) -> Self {
        Self::partial(bucket_start, price, price, price, price, 0.0)
    }

    /// The minute bucket this candle belongs to.
    pub fn bucket(&self) -> i64 {
        align_to_bucket(self.bucket_start)
    }

    /// Validate candle integrity (OHLCV invariants).
    pub fn is_valid(&self) -> bool {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        fields.iter().all(|v| v.is_finite())
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= 0.0
    }

    /// Fold `incoming` into the candle already held for the same bucket.
    ///
    /// - no existing candle: `incoming` is taken as-is;
    /// - `incoming` closed: it replaces whatever is held;
    /// - existing closed: partial updates are ignored;
    /// - otherwise high/low widen, close and volume follow `incoming`.
    pub fn merge(existing: Option<&Candle>, incoming: &Candle) -> Candle {
        let incoming = Candle {
            bucket_start: incoming.bucket(),
            ..*incoming
        };

        match existing {
            None => incoming,
            Some(_) if incoming.is_closed => incoming,
            Some(current) if current.is_closed => *current,
            Some(current) => Candle {
                bucket_start: current.bucket(),
                open: current.open,
                high: current.high.max(incoming.high),
                low: current.low.min(incoming.low),
                close: incoming.close,
                volume: incoming.volume,
                is_closed: false,
            },
        }
    }
}


// ── Property-Based Tests ────────────────────────────────────────────
