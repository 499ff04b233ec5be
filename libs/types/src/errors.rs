//! Error types for the kline feed
//!
//! Error taxonomy using thiserror. None of these are fatal: transport
//! errors drive the reconnect path, fetch errors leave a gap for the next
//! pass, malformed messages are dropped one at a time.

use thiserror::Error;

/// Top-level feed error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Malformed message: {0}")]
    Malformed(#[from] MalformedMessageError),
}

/// Streaming socket failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Connection closed by peer")]
    Closed,
}

/// Historical pull failures (HTTP or parse)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid kline payload: {0}")]
    Parse(String),

    #[error("Invalid range: start {start_ms} is after end {end_ms}")]
    InvalidRange { start_ms: i64, end_ms: i64 },

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },
}

/// Push payloads that do not have the expected shape
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedMessageError {
    #[error("Invalid JSON: {0}")]
    Json(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid number in field {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = FetchError::Status {
            url: "https://api.example.com/klines".to_string(),
            status: 429,
        };
        assert_eq!(
            err.to_string(),
            "Unexpected HTTP status 429 from https://api.example.com/klines"
        );
    }

    #[test]
    fn test_exhausted_wraps_last_error() {
        let err = FetchError::Exhausted {
            attempts: 3,
            last: Box::new(FetchError::Parse("not an array".to_string())),
        };
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("not an array"));
    }

    #[test]
    fn test_feed_error_from_variants() {
        let transport: FeedError = TransportError::Closed.into();
        assert!(matches!(transport, FeedError::Transport(_)));

        let malformed: FeedError = MalformedMessageError::MissingField("k").into();
        assert!(matches!(malformed, FeedError::Malformed(_)));
        assert_eq!(malformed.to_string(), "Malformed message: Missing field: k");
    }
}
