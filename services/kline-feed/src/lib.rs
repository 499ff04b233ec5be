//! Kline Feed Service
//!
//! Ingests a minute-resolution candle series for one instrument and keeps
//! it consistent:
//! - Initial historical load over a bounded, paged REST pull
//! - Live partial candles from the exchange push stream
//! - Constant-delay reconnects and periodic connection rotation
//! - Gap detection with bounded backfill after disconnects
//! - Batch-atomic flushes with retention trimming and a pause gate
//! - Consumer views and a small HTTP surface for the display layer
//!
//! # Architecture
//!
//! ```text
//!   REST klines            WS stream
//!        │                     │
//!  ┌─────▼──────┐      ┌───────▼───────┐
//!  │ Historical │      │FeedConnection │  ← reconnect, rotation, parse
//!  └─────┬──────┘      └───────┬───────┘
//!        │                     │ updates
//!        │             ┌───────▼───────┐
//!        │             │FlushScheduler │  ← 500ms tick, pause gate
//!        │             └───────┬───────┘
//!        │                     │ batch
//!  ┌─────▼─────────────────────▼──┐
//!  │         Reconciler           │  ← merge, sort, retention
//!  └─────┬─────────────────▲──────┘
//!        │ first gap       │ backfill
//!  ┌─────▼─────┐           │
//!  │    Gap    ├───────────┘
//!  └───────────┘
//!        │
//!  watch<SeriesSnapshot> ──► views / HTTP
//! ```

pub mod api;
pub mod config;
pub mod connection;
pub mod engine;
pub mod events;
pub mod gap;
pub mod historical;
pub mod metrics;
pub mod reconciler;
pub mod scheduler;
pub mod view;

pub use config::{FeedConfig, HistoryStart, StreamKind};
pub use connection::{ConnectionState, StreamConnector, StreamSession, WsConnector};
pub use engine::{Clock, EngineHandle, EngineView, FeedEngine, SeriesSnapshot, SystemClock};
pub use historical::{HistoricalFetcher, RestKlineFetcher};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
