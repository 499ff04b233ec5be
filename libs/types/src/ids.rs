//! Identifier types for the kline feed
//!
//! `Symbol` names the single instrument the feed follows; `SessionId`
//! tags one streaming connection cycle so its log lines can be correlated.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::candle::INTERVAL_LABEL;

/// Exchange instrument symbol (e.g. "BTCUSDT").
///
/// Stored upper-case, the way the REST API expects it; stream names use
/// the lower-case form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol, normalizing to upper case.
    ///
    /// # Panics
    /// Panics if the symbol is empty or contains non-alphanumeric characters
    pub fn new(symbol: impl Into<String>) -> Self {
        match Self::try_new(symbol) {
            Some(symbol) => symbol,
            None => panic!("Symbol must be a non-empty alphanumeric string"),
        }
    }

    /// Try to create a Symbol, returning None if invalid
    pub fn try_new(symbol: impl Into<String>) -> Option<Self> {
        let s = symbol.into();
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()) {
            Some(Self(s.to_ascii_uppercase()))
        } else {
            None
        }
    }

    /// Get the symbol string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Combined-stream name of the minute kline channel: `btcusdt@kline_1m`.
    pub fn kline_stream(&self) -> String {
        format!("{}@kline_{}", self.0.to_ascii_lowercase(), INTERVAL_LABEL)
    }

    /// Combined-stream name of the raw trade channel: `btcusdt@trade`.
    pub fn trade_stream(&self) -> String {
        format!("{}@trade", self.0.to_ascii_lowercase())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of one streaming connection cycle
///
/// Uses UUID v7 so session ids sort by the time they were opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
