//! Trade-to-candle bucketing.
//!
//! A bucket is finalized only when a trade belonging to a later bucket
//! arrives for the same symbol (watermark finalization), or when the
//! bucketer is explicitly flushed. Time is always event time.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::models::{Candle, Millis, TradePrint};

/// Destination for finalized candles.
pub trait CandleSink {
    fn on_candle(&mut self, candle: Candle) -> Result<()>;
}

impl CandleSink for Vec<Candle> {
    fn on_candle(&mut self, candle: Candle) -> Result<()> {
        self.push(candle);
        Ok(())
    }
}

/// What to do with a trade older than the symbol's current bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfOrderPolicy {
    /// Discard the trade and count it.
    #[default]
    Drop,
    /// Fold it into the current bucket regardless of its timestamp.
    Merge,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketerStats {
    pub trades_applied: u64,
    pub candles_emitted: u64,
    pub out_of_order_dropped: u64,
    pub out_of_order_merged: u64,
    pub invalid_dropped: u64,
    pub sink_errors: u64,
}

/// Floor `ts_ms` to an `interval_ms` boundary (correct for negative times).
/// The floor must be representable; see [`checked_bucket_key`].
#[inline]
pub fn bucket_key(ts_ms: Millis, interval_ms: Millis) -> Millis {
    ts_ms.div_euclid(interval_ms) * interval_ms
}

/// `bucket_key`, or `None` when the floor lies below `Millis::MIN`.
#[inline]
pub fn checked_bucket_key(ts_ms: Millis, interval_ms: Millis) -> Option<Millis> {
    ts_ms.checked_sub(ts_ms.rem_euclid(interval_ms))
}

#[derive(Debug, Clone, Default)]
struct CandleBuffer {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    trade_count: u64,
    open_time_ms: Millis,
    has_data: bool,
    /// Holds trades the sink has not seen yet.
    dirty: bool,
}

impl CandleBuffer {
    fn apply(&mut self, price: f64, qty: f64, key: Millis) {
        if !self.has_data {
            self.open = price;
            self.high = price;
            self.low = price;
            self.close = price;
            self.volume = qty;
            self.trade_count = 1;
            self.open_time_ms = key;
            self.has_data = true;
        } else {
            self.high = self.high.max(price);
            self.low = self.low.min(price);
            self.close = price;
            self.volume += qty;
            self.trade_count += 1;
        }
        self.dirty = true;
    }

    fn reset(&mut self) {
        self.has_data = false;
        self.dirty = false;
        self.volume = 0.0;
        self.trade_count = 0;
    }

    fn to_candle(&self, symbol: &str) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            open_time_ms: self.open_time_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            trade_count: self.trade_count,
        }
    }
}

#[derive(Debug, Default)]
struct SymbolState {
    bucket: Option<Millis>,
    buffer: CandleBuffer,
}

/// Per-symbol OHLCV state machine feeding a [`CandleSink`].
pub struct Bucketer<S: CandleSink> {
    interval_ms: Millis,
    policy: OutOfOrderPolicy,
    symbols: HashMap<String, SymbolState>,
    sink: S,
    stats: BucketerStats,
}

impl<S: CandleSink> Bucketer<S> {
    pub fn new(interval_ms: Millis, sink: S) -> Self {
        Self::with_policy(interval_ms, OutOfOrderPolicy::default(), sink)
    }

    pub fn with_policy(interval_ms: Millis, policy: OutOfOrderPolicy, sink: S) -> Self {
        assert!(interval_ms > 0, "bucket interval must be positive");
        Self {
            interval_ms,
            policy,
            symbols: HashMap::new(),
            sink,
            stats: BucketerStats::default(),
        }
    }

    pub fn interval_ms(&self) -> Millis {
        self.interval_ms
    }

    pub fn stats(&self) -> &BucketerStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Advance the state of `trade.symbol`.
    pub fn on_trade(&mut self, trade: &TradePrint) {
        if !trade.is_valid() {
            self.stats.invalid_dropped += 1;
            debug!(symbol = %trade.symbol, price = trade.price, qty = trade.qty, "Dropping invalid trade");
            return;
        }

        let Some(key) = checked_bucket_key(trade.ts_ms, self.interval_ms) else {
            self.stats.invalid_dropped += 1;
            debug!(symbol = %trade.symbol, ts_ms = trade.ts_ms, "Dropping trade with unbucketable timestamp");
            return;
        };
        let state = self.symbols.entry(trade.symbol.clone()).or_default();

        match state.bucket {
            Some(current) if key < current => match self.policy {
                OutOfOrderPolicy::Drop => {
                    self.stats.out_of_order_dropped += 1;
                    debug!(
                        symbol = %trade.symbol,
                        ts_ms = trade.ts_ms,
                        current_bucket = current,
                        "Dropping out-of-order trade"
                    );
                    return;
                }
                OutOfOrderPolicy::Merge => {
                    self.stats.out_of_order_merged += 1;
                    state.buffer.apply(trade.price, trade.qty, current);
                    self.stats.trades_applied += 1;
                    return;
                }
            },
            Some(current) if key != current => {
                if state.buffer.dirty {
                    let candle = state.buffer.to_candle(&trade.symbol);
                    Self::emit(&mut self.sink, &mut self.stats, candle);
                }
                state.buffer.reset();
            }
            _ => {}
        }

        state.bucket = Some(key);
        state.buffer.apply(trade.price, trade.qty, key);
        self.stats.trades_applied += 1;
    }

    /// Emit every bucket holding unemitted trades, for all symbols.
    ///
    /// The drained values are kept: a later trade in the same bucket folds
    /// into them and the merged candle is emitted again under the same key.
    pub fn flush(&mut self) {
        let mut symbols: Vec<&String> = self
            .symbols
            .iter()
            .filter(|(_, s)| s.buffer.dirty)
            .map(|(sym, _)| sym)
            .collect();
        symbols.sort();
        let pending: Vec<Candle> = symbols
            .into_iter()
            .map(|sym| self.symbols[sym].buffer.to_candle(sym))
            .collect();

        for candle in pending {
            if let Some(state) = self.symbols.get_mut(&candle.symbol) {
                state.buffer.dirty = false;
            }
            Self::emit(&mut self.sink, &mut self.stats, candle);
        }
    }

    /// Candle with trades not yet handed to the sink, if any.
    pub fn pending(&self, symbol: &str) -> Option<Candle> {
        self.symbols
            .get(symbol)
            .filter(|s| s.buffer.dirty)
            .map(|s| s.buffer.to_candle(symbol))
    }

    fn emit(sink: &mut S, stats: &mut BucketerStats, candle: Candle) {
        let symbol = candle.symbol.clone();
        let open_time_ms = candle.open_time_ms;
        match sink.on_candle(candle) {
            Ok(()) => stats.candles_emitted += 1,
            Err(e) => {
                stats.sink_errors += 1;
                warn!(symbol = %symbol, open_time_ms, error = %e, "Candle sink rejected finalized candle");
            }
        }
    }
}
