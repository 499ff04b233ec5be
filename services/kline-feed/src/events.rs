//! Wire messages and internal event definitions
//!
//! The push feed delivers combined-stream envelopes
//! `{"stream": "...", "data": {...}}` carrying either kline updates
//! (`data.k = {t, o, h, l, c, v, x}`) or raw trades (`data = {T, p, q}`).
//! Parsing fails closed: anything unexpected becomes a
//! `MalformedMessageError` or `StreamMessage::Unrecognized` and is dropped
//! by the caller, never propagated as a panic.

use kline_types::candle::{align_to_bucket, Candle};
use kline_types::errors::MalformedMessageError;
use serde::Deserialize;
use serde_json::Value;

use crate::config::StreamKind;

/// A decoded push message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Partial or final candle from the kline channel.
    Kline(Candle),
    /// Single trade print from the trade channel.
    Trade(TradePrint),
    /// Any stream other than the subscribed one (or no stream tag at all).
    Unrecognized { stream: Option<String> },
}

/// A single trade print.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradePrint {
    /// Trade time, epoch milliseconds.
    pub trade_time: i64,
    pub price: f64,
    /// Traded quantity, when the feed carries it.
    pub quantity: Option<f64>,
}

/// Events delivered from the feed connection to the engine loop, in
/// arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A candle update for the flush buffer.
    Update(Candle),
    /// Connectivity changed: `true` on connect, `false` on close.
    Connectivity(bool),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    stream: Option<String>,
    data: Option<Value>,
}

/// Decode one raw text frame.
///
/// Only envelopes tagged with `subscribed` are decoded further; the
/// payload shape is chosen by `kind`.
pub fn parse_stream_message(
    raw: &str,
    subscribed: &str,
    kind: StreamKind,
) -> Result<StreamMessage, MalformedMessageError> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| MalformedMessageError::Json(e.to_string()))?;

    if envelope.stream.as_deref() != Some(subscribed) {
        return Ok(StreamMessage::Unrecognized {
            stream: envelope.stream,
        });
    }

    let data = envelope
        .data
        .ok_or(MalformedMessageError::MissingField("data"))?;

    match kind {
        StreamKind::Kline => parse_kline(&data).map(StreamMessage::Kline),
        StreamKind::Trade => parse_trade(&data).map(StreamMessage::Trade),
    }
}

fn parse_kline(data: &Value) -> Result<Candle, MalformedMessageError> {
    let k = data.get("k").ok_or(MalformedMessageError::MissingField("k"))?;

    let bucket_start = field_i64(k, "t")?;
    let is_closed = k
        .get("x")
        .and_then(Value::as_bool)
        .ok_or(MalformedMessageError::MissingField("x"))?;

    let candle = Candle {
        bucket_start: align_to_bucket(bucket_start),
        open: field_f64(k, "o")?,
        high: field_f64(k, "h")?,
        low: field_f64(k, "l")?,
        close: field_f64(k, "c")?,
        volume: field_f64(k, "v")?,
        is_closed,
    };
    Ok(candle)
}

fn parse_trade(data: &Value) -> Result<TradePrint, MalformedMessageError> {
    let quantity = match data.get("q") {
        Some(_) => Some(field_f64(data, "q")?),
        None => None,
    };
    Ok(TradePrint {
        trade_time: field_i64(data, "T")?,
        price: field_f64(data, "p")?,
        quantity,
    })
}

fn field_i64(obj: &Value, field: &'static str) -> Result<i64, MalformedMessageError> {
    let value = obj.get(field).ok_or(MalformedMessageError::MissingField(field))?;
    value.as_i64().ok_or_else(|| MalformedMessageError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Numeric field encoded either as a JSON number or a decimal string.
pub(crate) fn field_f64(obj: &Value, field: &'static str) -> Result<f64, MalformedMessageError> {
    let value = obj.get(field).ok_or(MalformedMessageError::MissingField(field))?;
    number_value(value).ok_or_else(|| MalformedMessageError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Finite number from a JSON number or numeric string.
pub(crate) fn number_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Folds trade prints into partial candles for their minute bucket.
///
/// Keeps the running volume of the current bucket so the emitted candle's
/// volume is cumulative, matching the kline channel's semantics.
#[derive(Debug, Default)]
pub struct TradeAccumulator {
    bucket: Option<i64>,
    volume: f64,
}

impl TradeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one print. Prints for a bucket older than the current one are
    /// dropped (`None`).
    pub fn fold(&mut self, trade: &TradePrint) -> Option<Candle> {
        let bucket = align_to_bucket(trade.trade_time);
        match self.bucket {
            Some(current) if bucket < current => return None,
            Some(current) if bucket == current => {}
            _ => {
                self.bucket = Some(bucket);
                self.volume = 0.0;
            }
        }
        self.volume += trade.quantity.unwrap_or(0.0).max(0.0);
        Some(Candle::from_trade(trade.trade_time, trade.price, self.volume))
    }
}
