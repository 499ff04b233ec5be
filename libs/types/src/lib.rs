//! Types library for the kline feed
//!
//! Core type definitions shared by the ingestion engine and its consumers:
//! the per-minute candle record with its merge rule, the instrument
//! identifier, and the error taxonomy.
//!
//! # Modules
//! - `candle`: Candle record, minute-bucket alignment, merge rule
//! - `ids`: Instrument symbol and connection session identifiers
//! - `errors`: Error taxonomy (transport, fetch, malformed message)

pub mod candle;
pub mod errors;
pub mod ids;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::candle::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
}
