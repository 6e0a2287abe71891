//! Candle & Event Store
//!
//! SQLite persistence for finalized candles and the typed event log, with
//! buffered writes and a bounded read cache.
//!
//! Locking:
//! - buffer lock: pending write buffers (producers hold it only to push)
//! - storage lock: the SQLite connection (flush, query, clear)
//! - cache lock: query result caches (readers only)
//!
//! No call ever holds two of these at once. Flushers additionally take the
//! flush gate first, which orders batches and lets `shutdown` wait for an
//! in-flight flush.

mod cache;
mod query;
pub mod schema;

pub use query::{CandleQuery, CandleQueryResult, EventQueryResult};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

use crate::config::StoreConfig;
use crate::error::QueryError;
use crate::models::{Candle, Millis, Source, StoredEvent};
use cache::QueryCaches;

const UPSERT_CANDLE_SQL: &str = r#"
INSERT INTO candles (
    symbol, resolution_ms, open_time_ms, source,
    open, high, low, close, volume, trade_count
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(symbol, resolution_ms, open_time_ms, source) DO UPDATE SET
    open = excluded.open,
    high = excluded.high,
    low = excluded.low,
    close = excluded.close,
    volume = excluded.volume,
    trade_count = excluded.trade_count,
    ingestion_time = CURRENT_TIMESTAMP
"#;

const INSERT_EVENT_SQL: &str = r#"
INSERT INTO events (event_type, timestamp_ms, symbol, source, data)
VALUES (?1, ?2, ?3, ?4, ?5)
"#;

/// A candle waiting in the write buffer.
#[derive(Debug, Clone)]
struct PendingCandle {
    symbol: String,
    resolution_ms: Millis,
    source: Source,
    candle: Candle,
}

#[derive(Debug, Default)]
struct WriteBuffers {
    candles: Vec<PendingCandle>,
    events: Vec<StoredEvent>,
}

/// Store counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub candles_buffered: AtomicU64,
    pub events_buffered: AtomicU64,
    pub candles_flushed: AtomicU64,
    pub events_flushed: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub rows_lost: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatsSnapshot {
    pub candles_buffered: u64,
    pub events_buffered: u64,
    pub candles_flushed: u64,
    pub events_flushed: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub rows_lost: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
}

impl StoreStats {
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StoreStatsSnapshot {
            candles_buffered: get(&self.candles_buffered),
            events_buffered: get(&self.events_buffered),
            candles_flushed: get(&self.candles_flushed),
            events_flushed: get(&self.events_flushed),
            flushes: get(&self.flushes),
            flush_failures: get(&self.flush_failures),
            rows_lost: get(&self.rows_lost),
            cache_hits: get(&self.cache_hits),
            cache_misses: get(&self.cache_misses),
            cache_evictions: get(&self.cache_evictions),
        }
    }
}

/// Per-symbol coverage of stored candles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSummary {
    pub symbol: String,
    pub resolution_ms: Millis,
    pub candle_count: u64,
    pub first_open_time_ms: Millis,
    pub last_open_time_ms: Millis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub db_path: String,
    pub schema_version: i64,
    pub symbols: Vec<SymbolSummary>,
    pub event_count: u64,
    pub pending_candles: usize,
    pub pending_events: usize,
}

/// Durable candle/event store.
pub struct CandleStore {
    config: StoreConfig,
    conn: Mutex<Connection>,
    buffers: Mutex<WriteBuffers>,
    caches: Mutex<QueryCaches>,
    flush_gate: Mutex<()>,
    /// Bumped after every committed flush or clear.
    epoch: AtomicU64,
    closed: AtomicBool,
    stats: StoreStats,
}

impl CandleStore {
    /// Open or create the store at `config.db_path` and migrate its schema.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let path = Path::new(&config.db_path);

        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory for {}", config.db_path)
                })?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(&config.db_path, flags)
            .with_context(|| format!("Failed to open candle database: {}", config.db_path))?;

        let store = Self::from_connection(conn, config)?;
        info!(path = %store.config.db_path, "Candle store opened");
        Ok(store)
    }

    /// Open in-memory storage with default settings (for testing).
    pub fn open_memory() -> Result<Self> {
        Self::open_memory_with(StoreConfig::with_path(":memory:"))
    }

    /// Open in-memory storage with custom thresholds (for testing).
    pub fn open_memory_with(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, config)
    }

    fn from_connection(mut conn: Connection, config: StoreConfig) -> Result<Self> {
        schema::configure(&conn, config.busy_timeout_ms)?;
        schema::migrate(&mut conn).context("Candle store schema migration failed")?;

        Ok(Self {
            caches: Mutex::new(QueryCaches::new(
                config.max_candle_cache_entries,
                config.max_event_cache_entries,
            )),
            config,
            conn: Mutex::new(conn),
            buffers: Mutex::new(WriteBuffers::default()),
            flush_gate: Mutex::new(()),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stats: StoreStats::default(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(QueryError::StoreClosed.into());
        }
        Ok(())
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    // =========================================================================
    // WRITE PATH
    // =========================================================================

    /// Buffer a finalized candle. Triggers a candle flush once the buffer
    /// reaches `candle_buffer_size`.
    pub fn add_candle(
        &self,
        symbol: &str,
        resolution_ms: Millis,
        candle: Candle,
        source: Source,
    ) -> Result<()> {
        self.ensure_open()?;

        let pending = {
            let mut buffers = self.buffers.lock();
            buffers.candles.push(PendingCandle {
                symbol: symbol.to_string(),
                resolution_ms,
                source,
                candle,
            });
            buffers.candles.len()
        };
        self.stats.candles_buffered.fetch_add(1, Ordering::Relaxed);

        if pending >= self.config.candle_buffer_size {
            self.flush_candles()?;
        }
        Ok(())
    }

    /// Buffer an event. Triggers an event flush once the buffer reaches
    /// `event_buffer_size`.
    pub fn add_event(
        &self,
        event_type: &str,
        timestamp_ms: Millis,
        symbol: &str,
        source: Source,
        data: serde_json::Value,
    ) -> Result<()> {
        self.ensure_open()?;

        let pending = {
            let mut buffers = self.buffers.lock();
            buffers.events.push(StoredEvent {
                event_type: event_type.to_string(),
                timestamp_ms,
                symbol: symbol.to_string(),
                source,
                data,
            });
            buffers.events.len()
        };
        self.stats.events_buffered.fetch_add(1, Ordering::Relaxed);

        if pending >= self.config.event_buffer_size {
            self.flush_events()?;
        }
        Ok(())
    }

    /// Number of cached query results `(candles, events)`.
    pub fn cached_queries(&self) -> (usize, usize) {
        let caches = self.caches.lock();
        (caches.candles.len(), caches.events.len())
    }

    /// Items currently waiting in the write buffers `(candles, events)`.
    pub fn pending(&self) -> (usize, usize) {
        let buffers = self.buffers.lock();
        (buffers.candles.len(), buffers.events.len())
    }

    pub fn flush_all(&self) -> Result<()> {
        let _gate = self.flush_gate.lock();
        let candles = self.flush_candles_gated();
        let events = self.flush_events_gated();
        candles?;
        events?;
        Ok(())
    }

    /// Write all buffered candles in one transaction. Returns rows written.
    pub fn flush_candles(&self) -> Result<usize> {
        let _gate = self.flush_gate.lock();
        self.flush_candles_gated()
    }

    /// Write all buffered events in one transaction. Returns rows written.
    pub fn flush_events(&self) -> Result<usize> {
        let _gate = self.flush_gate.lock();
        self.flush_events_gated()
    }

    fn flush_candles_gated(&self) -> Result<usize> {
        let batch = std::mem::take(&mut self.buffers.lock().candles);
        if batch.is_empty() {
            return Ok(0);
        }

        let result = {
            let mut conn = self.conn.lock();
            insert_candles(&mut conn, &batch)
        };
        self.record_flush("candles", batch.len(), &self.stats.candles_flushed, result)
    }

    fn flush_events_gated(&self) -> Result<usize> {
        let batch = std::mem::take(&mut self.buffers.lock().events);
        if batch.is_empty() {
            return Ok(0);
        }

        let result = {
            let mut conn = self.conn.lock();
            insert_events(&mut conn, &batch)
        };
        self.record_flush("events", batch.len(), &self.stats.events_flushed, result)
    }

    fn record_flush(
        &self,
        kind: &'static str,
        batch_len: usize,
        flushed: &AtomicU64,
        result: Result<()>,
    ) -> Result<usize> {
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(()) => {
                flushed.fetch_add(batch_len as u64, Ordering::Relaxed);
                self.bump_epoch();
                debug!(kind, rows = batch_len, "Flushed write buffer");
                Ok(batch_len)
            }
            Err(e) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .rows_lost
                    .fetch_add(batch_len as u64, Ordering::Relaxed);
                error!(kind, rows_lost = batch_len, error = %e, "Flush failed, batch discarded");
                Err(e)
            }
        }
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// Drop caches, pending buffers and every stored candle/event.
    pub fn clear_all(&self) -> Result<()> {
        let _gate = self.flush_gate.lock();

        self.caches.lock().clear();
        {
            let mut buffers = self.buffers.lock();
            buffers.candles.clear();
            buffers.events.clear();
        }
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM candles", [])?;
            tx.execute("DELETE FROM events", [])?;
            tx.commit().context("Failed to clear candle store")?;
        }
        self.bump_epoch();

        info!(path = %self.config.db_path, "Cleared all candle store data");
        Ok(())
    }

    /// Flush everything and refuse further writes and queries. Waits for
    /// any in-flight flush first.
    pub fn shutdown(&self) -> Result<()> {
        let _gate = self.flush_gate.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let candles = self.flush_candles_gated();
        let events = self.flush_events_gated();
        info!(path = %self.config.db_path, "Candle store shut down");
        candles?;
        events?;
        Ok(())
    }

    // =========================================================================
    // METADATA
    // =========================================================================

    /// Distinct symbols with stored candles.
    pub fn symbols(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT symbol FROM candles ORDER BY symbol")?;
        let symbols = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(symbols)
    }

    /// First and last stored open time for a symbol at a resolution.
    pub fn time_coverage(
        &self,
        symbol: &str,
        resolution_ms: Millis,
    ) -> Result<Option<(Millis, Millis)>> {
        let conn = self.conn.lock();
        let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(open_time_ms), MAX(open_time_ms) FROM candles
             WHERE symbol = ?1 AND resolution_ms = ?2",
            params![symbol, resolution_ms],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(min.zip(max))
    }

    pub fn count_candles(&self, symbol: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM candles WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn count_events(&self, symbol: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn summary(&self) -> Result<StoreSummary> {
        let (pending_candles, pending_events) = self.pending();

        let conn = self.conn.lock();
        let schema_version = schema::read_version(&conn)?;
        let mut stmt = conn.prepare(
            "SELECT symbol, resolution_ms, COUNT(*), MIN(open_time_ms), MAX(open_time_ms)
             FROM candles
             GROUP BY symbol, resolution_ms
             ORDER BY symbol, resolution_ms",
        )?;
        let symbols = stmt
            .query_map([], |row| {
                Ok(SymbolSummary {
                    symbol: row.get(0)?,
                    resolution_ms: row.get(1)?,
                    candle_count: row.get::<_, i64>(2)? as u64,
                    first_open_time_ms: row.get(3)?,
                    last_open_time_ms: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let event_count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;

        Ok(StoreSummary {
            db_path: self.config.db_path.clone(),
            schema_version,
            symbols,
            event_count: event_count as u64,
            pending_candles,
            pending_events,
        })
    }
}

impl Drop for CandleStore {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.flush_all() {
            error!(error = %e, "Error flushing candle store on drop");
        }
    }
}

fn insert_candles(conn: &mut Connection, batch: &[PendingCandle]) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    {
        let mut stmt = tx.prepare_cached(UPSERT_CANDLE_SQL)?;
        for p in batch {
            let c = &p.candle;
            stmt.execute(params![
                p.symbol,
                p.resolution_ms,
                c.open_time_ms,
                p.source.as_str(),
                c.open,
                c.high,
                c.low,
                c.close,
                c.volume,
                c.trade_count as i64,
            ])
            .with_context(|| {
                format!("Failed to insert candle {} @ {}", p.symbol, c.open_time_ms)
            })?;
        }
    }
    // An early return above drops `tx`, which rolls back.
    tx.commit().context("Failed to commit candle batch")?;
    Ok(())
}

fn insert_events(conn: &mut Connection, batch: &[StoredEvent]) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    {
        let mut stmt = tx.prepare_cached(INSERT_EVENT_SQL)?;
        for event in batch {
            let data = serde_json::to_string(&event.data)?;
            stmt.execute(params![
                event.event_type,
                event.timestamp_ms,
                event.symbol,
                event.source.as_str(),
                data,
            ])
            .with_context(|| {
                format!("Failed to insert {} event for {}", event.event_type, event.symbol)
            })?;
        }
    }
    tx.commit().context("Failed to commit event batch")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(symbol: &str, t: Millis, price: f64, volume: f64) -> Candle {
        Candle {
            symbol: symbol.into(),
            open_time_ms: t,
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price + 0.5,
            volume,
            trade_count: 3,
        }
    }

    fn small_store(threshold: usize) -> CandleStore {
        let mut config = StoreConfig::with_path(":memory:");
        config.candle_buffer_size = threshold;
        config.event_buffer_size = threshold;
        CandleStore::open_memory_with(config).unwrap()
    }

    #[test]
    fn test_open_memory() {
        let store = CandleStore::open_memory().unwrap();
        assert!(store.symbols().unwrap().is_empty());
        assert_eq!(store.pending(), (0, 0));
    }

    #[test]
    fn test_buffered_until_flush() {
        let store = small_store(100);
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 0, 100.0, 1.0), Source::Backtest)
            .unwrap();
        assert_eq!(store.count_candles("BTCUSD").unwrap(), 0);
        assert_eq!(store.pending(), (1, 0));

        assert_eq!(store.flush_candles().unwrap(), 1);
        assert_eq!(store.count_candles("BTCUSD").unwrap(), 1);
        assert_eq!(store.pending(), (0, 0));
    }

    #[test]
    fn test_auto_flush_at_threshold() {
        let store = small_store(3);
        for i in 0..3 {
            store
                .add_candle("BTCUSD", 1000, candle("BTCUSD", i * 1000, 100.0, 1.0), Source::Backtest)
                .unwrap();
        }
        assert_eq!(store.count_candles("BTCUSD").unwrap(), 3);

        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 3000, 100.0, 1.0), Source::Backtest)
            .unwrap();
        assert_eq!(store.count_candles("BTCUSD").unwrap(), 3);
        assert_eq!(store.pending(), (1, 0));

        store.flush_all().unwrap();
        assert_eq!(store.count_candles("BTCUSD").unwrap(), 4);
    }

    #[test]
    fn test_event_auto_flush() {
        let store = small_store(2);
        store
            .add_event("OrderPlaced", 1, "BTCUSD", Source::Live, serde_json::json!({"a": 1}))
            .unwrap();
        assert_eq!(store.count_events("BTCUSD").unwrap(), 0);
        store
            .add_event("OrderFilled", 2, "BTCUSD", Source::Live, serde_json::json!({"a": 2}))
            .unwrap();
        assert_eq!(store.count_events("BTCUSD").unwrap(), 2);
    }

    #[test]
    fn test_duplicate_candle_last_write_wins() {
        let store = small_store(100);
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 0, 100.0, 1.0), Source::Backtest)
            .unwrap();
        store.flush_all().unwrap();
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 0, 200.0, 9.0), Source::Backtest)
            .unwrap();
        store.flush_all().unwrap();

        assert_eq!(store.count_candles("BTCUSD").unwrap(), 1);
        let candles = store.query_candles("BTCUSD", 1000, 0, 999).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open, 200.0);
        assert_eq!(candles[0].volume, 9.0);
    }

    #[test]
    fn test_same_bucket_different_sources_kept_apart() {
        let store = small_store(100);
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 0, 100.0, 1.0), Source::Backtest)
            .unwrap();
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 0, 100.0, 2.0), Source::Live)
            .unwrap();
        store.flush_all().unwrap();
        assert_eq!(store.count_candles("BTCUSD").unwrap(), 2);
    }

    #[test]
    fn test_clear_all() {
        let store = small_store(100);
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 0, 100.0, 1.0), Source::Backtest)
            .unwrap();
        store.flush_all().unwrap();
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 1000, 100.0, 1.0), Source::Backtest)
            .unwrap();
        store
            .add_event("OrderPlaced", 1, "BTCUSD", Source::Backtest, serde_json::json!({}))
            .unwrap();
        assert_eq!(store.query_candles("BTCUSD", 1000, 0, 999).unwrap().len(), 1);

        store.clear_all().unwrap();

        assert_eq!(store.pending(), (0, 0));
        assert_eq!(store.count_candles("BTCUSD").unwrap(), 0);
        assert_eq!(store.count_events("BTCUSD").unwrap(), 0);
        assert!(store.query_candles("BTCUSD", 1000, 0, 999).unwrap().is_empty());
    }

    #[test]
    fn test_shutdown_flushes_and_closes() {
        let store = small_store(100);
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 0, 100.0, 1.0), Source::Backtest)
            .unwrap();
        store.shutdown().unwrap();

        assert!(store.is_closed());
        assert_eq!(store.count_candles("BTCUSD").unwrap(), 1);
        let err = store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 1000, 100.0, 1.0), Source::Backtest)
            .unwrap_err();
        assert_eq!(err.downcast_ref::<QueryError>(), Some(&QueryError::StoreClosed));
        store.shutdown().unwrap();
    }

    #[test]
    fn test_failed_flush_counts_lost_rows() {
        let store = small_store(100);
        store
            .add_candle("BTCUSD", 1000, candle("BTCUSD", 0, 100.0, 1.0), Source::Backtest)
            .unwrap();
        store.conn.lock().execute_batch("DROP TABLE candles").unwrap();

        assert!(store.flush_candles().is_err());
        let stats = store.stats();
        assert_eq!(stats.flush_failures, 1);
        assert_eq!(stats.rows_lost, 1);
        assert_eq!(store.pending(), (0, 0));
    }

    #[test]
    fn test_metadata() {
        let store = small_store(100);
        for (sym, t) in [("BTCUSD", 0), ("BTCUSD", 5000), ("ETHUSD", 2000)] {
            store
                .add_candle(sym, 1000, candle(sym, t, 10.0, 1.0), Source::Backtest)
                .unwrap();
        }
        store.flush_all().unwrap();

        assert_eq!(store.symbols().unwrap(), vec!["BTCUSD", "ETHUSD"]);
        assert_eq!(store.time_coverage("BTCUSD", 1000).unwrap(), Some((0, 5000)));
        assert_eq!(store.time_coverage("BTCUSD", 60_000).unwrap(), None);

        let summary = store.summary().unwrap();
        assert_eq!(summary.schema_version, schema::SCHEMA_VERSION);
        assert_eq!(summary.symbols.len(), 2);
        assert_eq!(summary.symbols[0].candle_count, 2);
    }
}
