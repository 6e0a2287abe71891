//! Bus glue that feeds `TradePrint` events through a [`Bucketer`].
//!
//! Two sinks share the same bucketing code:
//! - [`StoreSink`] buffers finalized candles into a [`CandleStore`]
//! - [`ChartSink`] republishes them on the `ChartCandle` topic

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::bucketer::{Bucketer, BucketerStats, CandleSink, OutOfOrderPolicy};
use crate::bus::{BusEvent, EventBus, HandlerId, TOPIC_CHART_CANDLE, TOPIC_TRADE_PRINT};
use crate::models::{Candle, Millis, Source};
use crate::store::CandleStore;

/// Buffers candles in the store at a fixed resolution and source.
pub struct StoreSink {
    store: Arc<CandleStore>,
    resolution_ms: Millis,
    source: Source,
}

impl StoreSink {
    pub fn new(store: Arc<CandleStore>, resolution_ms: Millis, source: Source) -> Self {
        Self {
            store,
            resolution_ms,
            source,
        }
    }
}

impl CandleSink for StoreSink {
    fn on_candle(&mut self, candle: Candle) -> Result<()> {
        let symbol = candle.symbol.clone();
        self.store
            .add_candle(&symbol, self.resolution_ms, candle, self.source)
    }
}

/// Publishes candles for live chart consumers.
pub struct ChartSink {
    bus: Arc<EventBus>,
}

impl ChartSink {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl CandleSink for ChartSink {
    fn on_candle(&mut self, candle: Candle) -> Result<()> {
        self.bus
            .publish(TOPIC_CHART_CANDLE, &BusEvent::ChartCandle(candle));
        Ok(())
    }
}

/// A bucketer subscribed to the `TradePrint` topic.
pub struct TradeSubscription<S: CandleSink + Send + 'static> {
    bus: Arc<EventBus>,
    bucketer: Arc<Mutex<Bucketer<S>>>,
    malformed_dropped: Arc<AtomicU64>,
    handler: Mutex<Option<HandlerId>>,
}

impl<S: CandleSink + Send + 'static> TradeSubscription<S> {
    pub fn new(bus: Arc<EventBus>, bucketer: Bucketer<S>) -> Self {
        Self {
            bus,
            bucketer: Arc::new(Mutex::new(bucketer)),
            malformed_dropped: Arc::new(AtomicU64::new(0)),
            handler: Mutex::new(None),
        }
    }

    /// Subscribe. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut handler = self.handler.lock();
        if handler.is_some() {
            return false;
        }

        let bucketer = Arc::clone(&self.bucketer);
        let malformed = Arc::clone(&self.malformed_dropped);
        let id = self.bus.subscribe(TOPIC_TRADE_PRINT, move |event| match event {
            BusEvent::TradePrint(trade) => bucketer.lock().on_trade(trade),
            other => {
                malformed.fetch_add(1, Ordering::Relaxed);
                debug!(event = ?other, "Ignoring non-trade event on TradePrint topic");
            }
        });
        *handler = Some(id);
        true
    }

    /// Unsubscribe and drain every partial bucket into the sink.
    /// Returns false if not running.
    pub fn stop(&self) -> bool {
        let Some(id) = self.handler.lock().take() else {
            return false;
        };
        self.bus.unsubscribe(TOPIC_TRADE_PRINT, id);
        self.bucketer.lock().flush();
        true
    }

    pub fn is_running(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn malformed_dropped(&self) -> u64 {
        self.malformed_dropped.load(Ordering::Relaxed)
    }

    pub fn bucketer_stats(&self) -> BucketerStats {
        self.bucketer.lock().stats().clone()
    }

    pub fn pending(&self, symbol: &str) -> Option<Candle> {
        self.bucketer.lock().pending(symbol)
    }
}

/// Trade prints → candles → [`CandleStore`].
///
/// Candles are bucketed at the store's `base_resolution_ms`, the only
/// resolution the read path serves from.
pub struct CandlePersister {
    store: Arc<CandleStore>,
    subscription: TradeSubscription<StoreSink>,
}

impl CandlePersister {
    pub fn new(bus: Arc<EventBus>, store: Arc<CandleStore>, source: Source) -> Self {
        Self::with_policy(bus, store, source, OutOfOrderPolicy::default())
    }

    pub fn with_policy(
        bus: Arc<EventBus>,
        store: Arc<CandleStore>,
        source: Source,
        policy: OutOfOrderPolicy,
    ) -> Self {
        let interval_ms = store.config().base_resolution_ms;
        let sink = StoreSink::new(Arc::clone(&store), interval_ms, source);
        let bucketer = Bucketer::with_policy(interval_ms, policy, sink);
        Self {
            store,
            subscription: TradeSubscription::new(bus, bucketer),
        }
    }

    pub fn start(&self) {
        if self.subscription.start() {
            info!("Candle persister started");
        }
    }

    /// Drain partial buckets and flush the store so everything received so
    /// far is durable.
    pub fn stop(&self) -> Result<()> {
        if !self.subscription.stop() {
            return Ok(());
        }
        self.store.flush_all()?;
        let stats = self.subscription.bucketer_stats();
        info!(
            trades = stats.trades_applied,
            candles = stats.candles_emitted,
            out_of_order_dropped = stats.out_of_order_dropped,
            malformed_dropped = self.malformed_dropped(),
            "Candle persister stopped"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.subscription.is_running()
    }

    pub fn malformed_dropped(&self) -> u64 {
        self.subscription.malformed_dropped()
    }

    pub fn stats(&self) -> BucketerStats {
        self.subscription.bucketer_stats()
    }
}

impl Drop for CandlePersister {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "Error stopping candle persister");
        }
    }
}

/// Trade prints → candles → `ChartCandle` topic.
pub struct ChartAggregator {
    subscription: TradeSubscription<ChartSink>,
}

impl ChartAggregator {
    pub fn new(bus: Arc<EventBus>, interval_ms: Millis) -> Self {
        let bucketer = Bucketer::new(interval_ms, ChartSink::new(Arc::clone(&bus)));
        Self {
            subscription: TradeSubscription::new(bus, bucketer),
        }
    }

    pub fn start(&self) {
        self.subscription.start();
    }

    pub fn stop(&self) {
        self.subscription.stop();
    }

    pub fn stats(&self) -> BucketerStats {
        self.subscription.bucketer_stats()
    }
}

impl Drop for ChartAggregator {
    fn drop(&mut self) {
        self.subscription.stop();
    }
}
