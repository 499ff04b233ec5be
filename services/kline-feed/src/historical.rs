//! Historical kline fetcher
//!
//! Pulls closed minute candles over a bounded range with one
//! request/response call. The REST response is an array of arrays that
//! positionally encodes `[openTime, open, high, low, close, volume, ...]`;
//! only indices 0..=5 are read.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kline_types::candle::{align_to_bucket, Candle, INTERVAL_MS};
use kline_types::errors::FetchError;
use kline_types::ids::Symbol;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::events::number_value;

/// Source of closed historical candles.
#[async_trait]
pub trait HistoricalFetcher: Send + Sync {
    /// Closed candles covering `[range_start_ms, range_end_ms]`, ascending,
    /// at most `max_candles` of them.
    async fn fetch(
        &self,
        range_start_ms: i64,
        range_end_ms: i64,
        max_candles: usize,
    ) -> Result<Vec<Candle>, FetchError>;
}

/// Fetcher backed by the exchange klines REST endpoint.
pub struct RestKlineFetcher {
    client: reqwest::Client,
    url: String,
    symbol: Symbol,
    interval: &'static str,
}

impl RestKlineFetcher {
    pub fn new(config: &FeedConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| FetchError::Request {
                url: config.klines_url(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            url: config.klines_url(),
            symbol: config.symbol.clone(),
            interval: config.interval_label(),
        })
    }
}

#[async_trait]
impl HistoricalFetcher for RestKlineFetcher {
    async fn fetch(
        &self,
        range_start_ms: i64,
        range_end_ms: i64,
        max_candles: usize,
    ) -> Result<Vec<Candle>, FetchError> {
        if range_start_ms > range_end_ms {
            return Err(FetchError::InvalidRange {
                start_ms: range_start_ms,
                end_ms: range_end_ms,
            });
        }

        let request_error = |e: reqwest::Error| FetchError::Request {
            url: self.url.clone(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("symbol", self.symbol.as_str().to_string()),
                ("interval", self.interval.to_string()),
                ("startTime", range_start_ms.to_string()),
                ("endTime", range_end_ms.to_string()),
                ("limit", max_candles.to_string()),
            ])
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await.map_err(request_error)?;
        let candles = parse_klines(&body, max_candles)?;

        debug!(
            start_ms = range_start_ms,
            end_ms = range_end_ms,
            returned = candles.len(),
            "Historical klines fetched"
        );
        Ok(candles)
    }
}

/// Decode a klines response body into closed candles.
///
/// Rows are sorted ascending, deduplicated by bucket and capped at
/// `max_candles`.
pub fn parse_klines(body: &Value, max_candles: usize) -> Result<Vec<Candle>, FetchError> {
    let rows = body
        .as_array()
        .ok_or_else(|| FetchError::Parse("response is not an array".to_string()))?;

    let mut candles = Vec::with_capacity(rows.len().min(max_candles));
    for (idx, row) in rows.iter().enumerate() {
        let cols = row
            .as_array()
            .filter(|cols| cols.len() >= 6)
            .ok_or_else(|| FetchError::Parse(format!("row {idx} is not an array of 6+ columns")))?;

        let open_time = cols[0]
            .as_i64()
            .ok_or_else(|| FetchError::Parse(format!("row {idx}: invalid open time {}", cols[0])))?;

        let mut values = [0.0f64; 5];
        for (slot, col) in values.iter_mut().zip(&cols[1..6]) {
            *slot = number_value(col)
                .ok_or_else(|| FetchError::Parse(format!("row {idx}: invalid number {col}")))?;
        }
        let [open, high, low, close, volume] = values;

        candles.push(Candle::closed(open_time, open, high, low, close, volume));
    }

    candles.sort_by_key(|c| c.bucket_start);
    candles.dedup_by_key(|c| c.bucket_start);
    candles.truncate(max_candles);
    Ok(candles)
}

/// Split `[start_ms, end_ms]` into ranges of at most `page_limit` buckets.
pub fn page_ranges(start_ms: i64, end_ms: i64, page_limit: usize) -> Vec<(i64, i64)> {
    let page_span = INTERVAL_MS * page_limit.max(1) as i64;
    let mut ranges = Vec::new();
    let mut cursor = align_to_bucket(start_ms);

    while cursor <= end_ms {
        let page_end = (cursor + page_span - 1).min(end_ms);
        ranges.push((cursor, page_end));
        cursor += page_span;
    }
    ranges
}

/// Fetch `[start_ms, end_ms]` page by page.
///
/// Pages are fetched in order; the first failing page fails the whole
/// load.
pub async fn fetch_paged(
    fetcher: &dyn HistoricalFetcher,
    start_ms: i64,
    end_ms: i64,
    page_limit: usize,
) -> Result<Vec<Candle>, FetchError> {
    let mut candles = Vec::new();
    for (page_start, page_end) in page_ranges(start_ms, end_ms, page_limit) {
        let mut page = fetcher.fetch(page_start, page_end, page_limit).await?;
        candles.append(&mut page);
    }
    candles.sort_by_key(|c| c.bucket_start);
    candles.dedup_by_key(|c| c.bucket_start);
    Ok(candles)
}

/// Initial load with bounded retry and doubling backoff.
pub async fn load_initial(
    fetcher: Arc<dyn HistoricalFetcher>,
    start_ms: i64,
    end_ms: i64,
    page_limit: usize,
    attempts: u32,
    backoff: Duration,
) -> Result<Vec<Candle>, FetchError> {
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut last_error = None;

    for attempt in 1..=attempts {
        match fetch_paged(fetcher.as_ref(), start_ms, end_ms, page_limit).await {
            Ok(candles) => {
                info!(
                    attempt,
                    candles = candles.len(),
                    start_ms,
                    end_ms,
                    "Initial historical load complete"
                );
                return Ok(candles);
            }
            Err(err) => {
                warn!(attempt, attempts, error = %err, "Initial historical load failed");
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }

    Err(FetchError::Exhausted {
        attempts,
        last: Box::new(last_error.unwrap_or(FetchError::Parse("no attempt made".to_string()))),
    })
}
