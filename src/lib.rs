//! Candle Store Library
//!
//! Turns a stream of trade prints into OHLCV candles, persists them (and an
//! order event log) in SQLite, and serves range queries at any resolution.
//!
//! Data flow:
//!   EventBus "TradePrint" → Bucketer → StoreSink → CandleStore (buffer → flush)
//!   caller → CandleStore::query_candles → cache | storage → gap-fill → aggregate

pub mod aggregate;
pub mod bucketer;
pub mod bus;
pub mod config;
pub mod error;
pub mod models;
pub mod persister;
pub mod recorder;
pub mod store;

pub use bucketer::{Bucketer, BucketerStats, CandleSink, OutOfOrderPolicy};
pub use bus::{BusEvent, EventBus, HandlerId};
pub use config::StoreConfig;
pub use error::QueryError;
pub use models::{Candle, Millis, OrderEvent, OrderEventKind, OrderSide, Source, StoredEvent, TradePrint};
pub use persister::{CandlePersister, ChartAggregator};
pub use recorder::EventRecorder;
pub use store::{CandleQuery, CandleQueryResult, CandleStore, EventQueryResult, StoreStatsSnapshot, StoreSummary};
