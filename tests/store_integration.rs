//! Integration tests for the candle store
//!
//! Exercise the public API end to end: bus → bucketer → store → query, on
//! both in-memory and file-backed databases.

use std::sync::Arc;

use candle_store::bus::{TOPIC_ORDER_FILLED, TOPIC_ORDER_PLACED, TOPIC_TRADE_PRINT};
use candle_store::store::schema::SCHEMA_VERSION;
use candle_store::{
    BusEvent, Candle, CandlePersister, CandleStore, EventBus, EventRecorder, OrderEvent,
    OrderEventKind, OrderSide, Source, StoreConfig, TradePrint,
};

fn memory_store(threshold: usize) -> CandleStore {
    let mut config = StoreConfig::with_path(":memory:");
    config.candle_buffer_size = threshold;
    config.event_buffer_size = threshold;
    CandleStore::open_memory_with(config).unwrap()
}

fn candle(symbol: &str, t: i64, price: f64) -> Candle {
    Candle {
        symbol: symbol.to_string(),
        open_time_ms: t,
        open: price,
        high: price + 2.0,
        low: price - 2.0,
        close: price + 1.0,
        volume: 1.5,
        trade_count: 4,
    }
}

fn publish_trade(bus: &EventBus, price: f64, qty: f64, ts_ms: i64) {
    bus.publish(
        TOPIC_TRADE_PRINT,
        &BusEvent::TradePrint(TradePrint::new("BTCUSD", price, qty, ts_ms)),
    );
}

#[test]
fn btcusd_trades_become_one_queryable_candle() {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(memory_store(50_000));
    let persister = CandlePersister::new(Arc::clone(&bus), Arc::clone(&store), Source::Live);
    persister.start();

    publish_trade(&bus, 100.0, 1.0, 0);
    publish_trade(&bus, 110.0, 2.0, 500);
    publish_trade(&bus, 90.0, 1.0, 1000);

    store.flush_all().unwrap();
    let candles = store.query_candles("BTCUSD", 1000, 0, 999).unwrap();

    assert_eq!(candles.len(), 1);
    let c = &candles[0];
    assert_eq!(c.open_time_ms, 0);
    assert_eq!((c.open, c.high, c.low, c.close), (100.0, 110.0, 100.0, 110.0));
    assert_eq!(c.volume, 3.0);
    assert_eq!(c.trade_count, 2);
}

#[test]
fn threshold_of_three_auto_flushes() {
    let store = memory_store(3);
    for i in 0..3 {
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", i * 1000, 100.0), Source::Backtest)
            .unwrap();
    }
    assert_eq!(store.count_candles("BTCUSD").unwrap(), 3);

    store
        .add_candle("BTCUSD", 1000, candle("BTCUSD", 3000, 100.0), Source::Backtest)
        .unwrap();
    assert_eq!(store.count_candles("BTCUSD").unwrap(), 3);

    store.flush_candles().unwrap();
    assert_eq!(store.count_candles("BTCUSD").unwrap(), 4);
}

#[test]
fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("candles.db");
    let config = StoreConfig::with_path(path.to_string_lossy());

    {
        let store = CandleStore::open(config.clone()).unwrap();
        store
            .add_candle("ETHUSD", 1000, candle("ETHUSD", 5000, 20.0), Source::Live)
            .unwrap();
        store
            .add_event("OrderPlaced", 5000, "ETHUSD", Source::Live, serde_json::json!({"orderId": "a"}))
            .unwrap();
        store.shutdown().unwrap();
    }
    assert!(path.exists());

    {
        // Nothing flushed explicitly; drop must persist the buffer.
        let store = CandleStore::open(config.clone()).unwrap();
        store
            .add_candle("ETHUSD", 1000, candle("ETHUSD", 6000, 21.0), Source::Live)
            .unwrap();
    }

    let store = CandleStore::open(config).unwrap();
    let summary = store.summary().unwrap();
    assert_eq!(summary.schema_version, SCHEMA_VERSION);
    assert_eq!(summary.symbols.len(), 1);
    assert_eq!(summary.symbols[0].candle_count, 2);
    assert_eq!(summary.event_count, 1);

    let candles = store.query_candles("ETHUSD", 1000, 5000, 6999).unwrap();
    assert_eq!(candles.len(), 2);
    assert_eq!(candles[1].open, 21.0);
}

#[test]
fn cache_never_exceeds_configured_entries() {
    let mut config = StoreConfig::with_path(":memory:");
    config.max_candle_cache_entries = 3;
    let store = CandleStore::open_memory_with(config).unwrap();

    for i in 0..10 {
        let symbol = format!("SYM{}", i);
        store
            .add_candle(&symbol, 1000, candle(&symbol, 0, 10.0), Source::Backtest)
            .unwrap();
    }
    store.flush_all().unwrap();

    for i in 0..10 {
        let symbol = format!("SYM{}", i);
        assert_eq!(store.query_candles(&symbol, 1000, 0, 999).unwrap().len(), 1);
        assert!(store.cached_queries().0 <= 3);
    }
    assert_eq!(store.cached_queries().0, 3);
    assert_eq!(store.stats().cache_evictions, 7);

    // SYM0 was evicted first, SYM9 is still cached.
    store.query_candles("SYM0", 1000, 0, 999).unwrap();
    store.query_candles("SYM9", 1000, 0, 999).unwrap();
    let stats = store.stats();
    assert_eq!(stats.cache_misses, 11);
    assert_eq!(stats.cache_hits, 1);
}

#[test]
fn truncated_results_carry_flag() {
    let store = memory_store(1000);
    for i in 0..20 {
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", i * 1000, 50.0), Source::Backtest)
            .unwrap();
    }
    store.flush_all().unwrap();

    let cut = store
        .query_candles_limited("BTCUSD", 1000, 0, 19_999, 7)
        .unwrap();
    assert_eq!(cut.candles.len(), 7);
    assert!(cut.is_truncated);

    let whole = store
        .query_candles_limited("BTCUSD", 5000, 0, 19_999, 7)
        .unwrap();
    assert_eq!(whole.candles.len(), 4);
    assert!(!whole.is_truncated);
    assert_eq!(whole.candles[0].volume, 7.5);
}

#[test]
fn writes_after_query_are_visible() {
    let store = memory_store(1000);
    store
        .add_candle("BTCUSD", 1000, candle("BTCUSD", 0, 10.0), Source::Backtest)
        .unwrap();
    store.flush_all().unwrap();
    assert_eq!(store.query_candles("BTCUSD", 1000, 0, 9999).unwrap().len(), 1);

    store
        .add_candle("BTCUSD", 1000, candle("BTCUSD", 4000, 12.0), Source::Backtest)
        .unwrap();
    store.flush_all().unwrap();

    let candles = store.query_candles("BTCUSD", 1000, 0, 9999).unwrap();
    assert_eq!(candles.len(), 5);
    // gap candles carry the previous close
    assert_eq!(candles[2].open, 11.0);
    assert_eq!(candles[2].volume, 0.0);
}

#[test]
fn recorder_fill_is_immediately_queryable() {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(memory_store(50_000));
    let recorder = EventRecorder::new(Arc::clone(&bus), Arc::clone(&store), Source::Backtest);
    recorder.start();

    let placed = OrderEvent {
        kind: OrderEventKind::Placed,
        order_id: "o-1".into(),
        symbol: "BTCUSD".into(),
        side: OrderSide::Sell,
        qty: 1.0,
        filled_qty: 0.0,
        fill_price: None,
        rejection_reason: None,
        timestamp_ms: 10,
    };
    let filled = OrderEvent {
        kind: OrderEventKind::Filled,
        filled_qty: 1.0,
        fill_price: Some(99.0),
        timestamp_ms: 20,
        ..placed.clone()
    };
    bus.publish(TOPIC_ORDER_PLACED, &BusEvent::Order(placed));
    bus.publish(TOPIC_ORDER_FILLED, &BusEvent::Order(filled));

    let events = store.query_events("BTCUSD", 0, 100, &[]).unwrap();
    let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["OrderPlaced", "OrderFilled"]);
    assert_eq!(events[1].data["orderId"], "o-1");
}

#[test]
fn concurrent_writers_flushers_and_readers_lose_nothing() {
    const WRITERS: usize = 4;
    const PER_WRITER: i64 = 400;

    let store = memory_store(64);

    std::thread::scope(|s| {
        for w in 0..WRITERS {
            let store = &store;
            s.spawn(move || {
                let symbol = format!("W{}", w);
                for i in 0..PER_WRITER {
                    store
                        .add_candle(&symbol, 1000, candle(&symbol, i * 1000, 10.0), Source::Live)
                        .unwrap();
                }
            });
        }

        let store = &store;
        s.spawn(move || {
            for _ in 0..50 {
                store.flush_all().unwrap();
                std::thread::yield_now();
            }
        });

        for r in 0..2 {
            s.spawn(move || {
                let symbol = format!("W{}", r);
                for _ in 0..50 {
                    let candles = store
                        .query_candles(&symbol, 5000, 0, PER_WRITER * 1000)
                        .unwrap();
                    assert!(candles.len() as i64 <= PER_WRITER / 5 + 1);
                }
            });
        }
    });

    store.flush_all().unwrap();
    for w in 0..WRITERS {
        assert_eq!(
            store.count_candles(&format!("W{}", w)).unwrap(),
            PER_WRITER as u64
        );
    }
    let stats = store.stats();
    assert_eq!(stats.rows_lost, 0);
    assert_eq!(stats.candles_flushed, WRITERS as u64 * PER_WRITER as u64);
    assert_eq!(store.pending(), (0, 0));
}
