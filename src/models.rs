//! Core market-data types shared by the bucketer, the bus and the store.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Milliseconds since the Unix epoch (event time).
pub type Millis = i64;

/// A single public trade as delivered on the `"TradePrint"` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePrint {
    pub symbol: String,
    pub price: f64,
    pub qty: f64,
    /// Event time of the trade.
    pub ts_ms: Millis,
}

impl TradePrint {
    pub fn new(symbol: impl Into<String>, price: f64, qty: f64, ts_ms: Millis) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            qty,
            ts_ms,
        }
    }

    /// Prices must be finite and positive, quantities finite and non-negative.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.qty.is_finite() && self.qty >= 0.0
    }
}

/// OHLCV summary of the trades in one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub symbol: String,
    /// Start of the bucket, `[open_time_ms, open_time_ms + resolution)`.
    pub open_time_ms: Millis,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Number of trades folded into this candle (0 for gap-filled candles).
    #[serde(default)]
    pub trade_count: u64,
}

impl Candle {
    /// Zero-volume candle with every price set to `price`.
    pub fn flat(symbol: impl Into<String>, open_time_ms: Millis, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            open_time_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            trade_count: 0,
        }
    }

    /// Open time as a UTC timestamp.
    pub fn open_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.open_time_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// `low <= open, close <= high` and `volume >= 0`.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= 0.0
    }
}

/// Origin of persisted data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Live,
    Backtest,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Live => "live",
            Source::Backtest => "backtest",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Source::Live => "Real-time live trading",
            Source::Backtest => "Historical backtest data",
        }
    }

    pub const ALL: [Source; 2] = [Source::Live, Source::Backtest];
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Source::Live),
            "backtest" => Ok(Source::Backtest),
            other => anyhow::bail!("unknown source '{}' (expected 'live' or 'backtest')", other),
        }
    }
}

/// An append-only entry in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// e.g. `OrderPlaced`, `OrderFilled`, `OrderRejected`.
    pub event_type: String,
    pub timestamp_ms: Millis,
    pub symbol: String,
    pub source: Source,
    /// Opaque payload, stored verbatim and never interpreted by the store.
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEventKind {
    Placed,
    Filled,
    Rejected,
}

impl OrderEventKind {
    /// Event type name used both as bus topic and as `events.event_type`.
    pub fn event_type(&self) -> &'static str {
        match self {
            OrderEventKind::Placed => "OrderPlaced",
            OrderEventKind::Filled => "OrderFilled",
            OrderEventKind::Rejected => "OrderRejected",
        }
    }
}

/// Order lifecycle notification published by brokers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub kind: OrderEventKind,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub filled_qty: f64,
    pub fill_price: Option<f64>,
    pub rejection_reason: Option<String>,
    pub timestamp_ms: Millis,
}

impl OrderEvent {
    /// Payload persisted in `events.data`.
    pub fn payload(&self) -> serde_json::Value {
        match self.kind {
            OrderEventKind::Placed => serde_json::json!({
                "orderId": self.order_id,
                "symbol": self.symbol,
                "qty": self.qty,
                "side": self.side.as_str(),
                "status": "Placed",
            }),
            OrderEventKind::Filled => serde_json::json!({
                "orderId": self.order_id,
                "symbol": self.symbol,
                "filledQty": self.filled_qty,
                "fillPrice": self.fill_price,
                "side": self.side.as_str(),
                "status": "Filled",
            }),
            OrderEventKind::Rejected => serde_json::json!({
                "orderId": self.order_id,
                "symbol": self.symbol,
                "qty": self.qty,
                "side": self.side.as_str(),
                "reason": self.rejection_reason,
            }),
        }
    }
}
