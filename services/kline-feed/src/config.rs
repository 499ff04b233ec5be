//! Engine configuration
//!
//! Defaults follow the exchange's public endpoints for one symbol at
//! one-minute granularity. Every field can be overridden from `KLINE_*`
//! environment variables by [`FeedConfig::from_env`].

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use kline_types::candle::{INTERVAL_LABEL, INTERVAL_MS};
use kline_types::ids::Symbol;

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("page limit {0} exceeds the exchange maximum of 1440")]
    PageLimitTooLarge(usize),
}

/// Which push channel carries the live updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `<symbol>@kline_1m`: partial and final candles.
    Kline,
    /// `<symbol>@trade`: individual prints folded into partial candles.
    Trade,
}

/// Where the initial historical load starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStart {
    /// `now - retention`.
    Retention,
    /// Local midnight of the current day.
    StartOfDay,
}

/// Configuration for the ingestion engine.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub symbol: Symbol,
    pub stream_kind: StreamKind,
    /// REST base, e.g. `https://api.binance.com`.
    pub rest_base_url: String,
    /// Streaming base, e.g. `wss://stream.binance.com:443`.
    pub ws_base_url: String,
    /// Maximum candles per historical call.
    pub page_limit: usize,
    /// Flush loop period.
    pub flush_interval: Duration,
    /// Fixed delay before a reconnect attempt.
    pub reconnect_delay: Duration,
    /// Forced close-and-reconnect period of a healthy connection.
    pub rotation_interval: Duration,
    /// Sliding retention window of the series.
    pub retention: Duration,
    pub history_start: HistoryStart,
    /// Attempts for the initial historical load (1 = no retry).
    pub initial_load_attempts: u32,
    /// Backoff before the second attempt; doubled afterwards.
    pub initial_load_backoff: Duration,
    /// Timeout applied by the REST client to each request.
    pub http_timeout: Duration,
    /// Bind address of the HTTP surface.
    pub listen_addr: SocketAddr,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbol: Symbol::new("BTCUSDT"),
            stream_kind: StreamKind::Kline,
            rest_base_url: "https://api.binance.com".to_string(),
            ws_base_url: "wss://stream.binance.com:443".to_string(),
            page_limit: 1000,
            flush_interval: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(5),
            rotation_interval: Duration::from_secs(23 * 60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            history_start: HistoryStart::Retention,
            initial_load_attempts: 3,
            initial_load_backoff: Duration::from_secs(1),
            http_timeout: Duration::from_secs(10),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
        }
    }
}

impl FeedConfig {
    /// Defaults overridden by `KLINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(raw) = env_var("KLINE_SYMBOL") {
            cfg.symbol = Symbol::try_new(raw.clone()).ok_or(ConfigError::InvalidValue {
                key: "KLINE_SYMBOL",
                value: raw,
            })?;
        }
        if let Some(raw) = env_var("KLINE_STREAM") {
            cfg.stream_kind = match raw.as_str() {
                "kline" => StreamKind::Kline,
                "trade" => StreamKind::Trade,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "KLINE_STREAM",
                        value: raw,
                    })
                }
            };
        }
        if let Some(raw) = env_var("KLINE_HISTORY_START") {
            cfg.history_start = match raw.as_str() {
                "retention" => HistoryStart::Retention,
                "start_of_day" => HistoryStart::StartOfDay,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "KLINE_HISTORY_START",
                        value: raw,
                    })
                }
            };
        }
        if let Some(raw) = env_var("KLINE_REST_URL") {
            cfg.rest_base_url = raw;
        }
        if let Some(raw) = env_var("KLINE_WS_URL") {
            cfg.ws_base_url = raw;
        }
        if let Some(raw) = env_var("KLINE_LISTEN_ADDR") {
            cfg.listen_addr = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "KLINE_LISTEN_ADDR",
                value: raw,
            })?;
        }

        cfg.page_limit = env_parse("KLINE_PAGE_LIMIT", cfg.page_limit)?;
        cfg.initial_load_attempts = env_parse("KLINE_INITIAL_LOAD_ATTEMPTS", cfg.initial_load_attempts)?;
        cfg.flush_interval = env_millis("KLINE_FLUSH_MS", cfg.flush_interval)?;
        cfg.reconnect_delay = env_millis("KLINE_RECONNECT_MS", cfg.reconnect_delay)?;
        cfg.rotation_interval = env_millis("KLINE_ROTATION_MS", cfg.rotation_interval)?;
        cfg.retention = env_millis("KLINE_RETENTION_MS", cfg.retention)?;
        cfg.initial_load_backoff = env_millis("KLINE_INITIAL_LOAD_BACKOFF_MS", cfg.initial_load_backoff)?;
        cfg.http_timeout = env_millis("KLINE_HTTP_TIMEOUT_MS", cfg.http_timeout)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_limit == 0 {
            return Err(ConfigError::Zero { field: "page_limit" });
        }
        if self.page_limit > 1440 {
            return Err(ConfigError::PageLimitTooLarge(self.page_limit));
        }
        if self.initial_load_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "initial_load_attempts",
            });
        }
        let durations = [
            ("flush_interval", self.flush_interval),
            ("rotation_interval", self.rotation_interval),
            ("retention", self.retention),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }

    /// Kline REST endpoint.
    pub fn klines_url(&self) -> String {
        format!("{}/api/v3/klines", self.rest_base_url.trim_end_matches('/'))
    }

    /// Name of the subscribed combined stream.
    pub fn stream_name(&self) -> String {
        match self.stream_kind {
            StreamKind::Kline => self.symbol.kline_stream(),
            StreamKind::Trade => self.symbol.trade_stream(),
        }
    }

    /// Combined-stream socket URL.
    pub fn stream_url(&self) -> String {
        format!(
            "{}/stream?streams={}",
            self.ws_base_url.trim_end_matches('/'),
            self.stream_name()
        )
    }

    /// Retention window in milliseconds.
    pub fn retention_ms(&self) -> i64 {
        i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX)
    }

    /// Retention window expressed in buckets.
    pub fn retention_buckets(&self) -> usize {
        usize::try_from(self.retention_ms() / INTERVAL_MS).unwrap_or(usize::MAX)
    }

    /// Interval label sent to the REST API.
    pub fn interval_label(&self) -> &'static str {
        INTERVAL_LABEL
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env_var(key) {
        Some(_) => env_parse::<u64>(key, 0).map(Duration::from_millis),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = FeedConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.retention_buckets(), 1440);
        assert_eq!(cfg.interval_label(), "1m");
    }

    #[test]
    fn test_urls() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.klines_url(), "https://api.binance.com/api/v3/klines");
        assert_eq!(
            cfg.stream_url(),
            "wss://stream.binance.com:443/stream?streams=btcusdt@kline_1m"
        );

        let trades = FeedConfig {
            stream_kind: StreamKind::Trade,
            ws_base_url: "wss://example.test/".to_string(),
            ..FeedConfig::default()
        };
        assert_eq!(trades.stream_url(), "wss://example.test/stream?streams=btcusdt@trade");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = FeedConfig {
            page_limit: 0,
            ..FeedConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Zero { field: "page_limit" }));

        let cfg = FeedConfig {
            page_limit: 5000,
            ..FeedConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::PageLimitTooLarge(5000)));

        let cfg = FeedConfig {
            flush_interval: Duration::ZERO,
            ..FeedConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Zero {
                field: "flush_interval"
            })
        );
    }

    #[test]
    fn test_env_parse_reports_key() {
        std::env::set_var("KLINE_TEST_PAGE_LIMIT", "abc");
        let result = env_parse::<usize>("KLINE_TEST_PAGE_LIMIT", 10);
        std::env::remove_var("KLINE_TEST_PAGE_LIMIT");
        assert_eq!(
            result,
            Err(ConfigError::InvalidValue {
                key: "KLINE_TEST_PAGE_LIMIT",
                value: "abc".to_string()
            })
        );
    }
}
