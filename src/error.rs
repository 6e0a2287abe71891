//! Typed errors callers may need to branch on.
//!
//! Everything else travels as `anyhow::Error` with context attached.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Parameters rejected before touching storage.
    InvalidQuery(String),
    /// Gap-filling would materialize more base candles than allowed.
    SpanTooLarge { buckets: u64, max: u64 },
    /// The store has been shut down.
    StoreClosed,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidQuery(msg) => write!(f, "invalid query: {}", msg),
            Self::SpanTooLarge { buckets, max } => write!(
                f,
                "query span too large: {} base candles (max {})",
                buckets, max
            ),
            Self::StoreClosed => write!(f, "candle store is closed"),
        }
    }
}

impl std::error::Error for QueryError {}
