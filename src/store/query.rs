//! Read path: cache lookup, storage fallback, gap-fill and aggregation.
//!
//! Candle ranges are widened to whole buckets of the requested resolution
//! before anything else. The candle cache holds folded base-resolution rows,
//! and a hit runs them through the same gap-fill and aggregation as a
//! storage read, so both paths return identical series.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use tracing::debug;

use super::cache::{CacheEntry, CandleCacheKey, EventCacheKey};
use super::CandleStore;
use crate::aggregate::{aggregate, fold_duplicates, gap_fill, truncate};
use crate::bucketer::checked_bucket_key;
use crate::error::QueryError;
use crate::models::{Candle, Millis, Source, StoredEvent};

/// Candle range request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleQuery {
    pub symbol: String,
    pub resolution_ms: Millis,
    pub start_ms: Millis,
    pub end_ms: Millis,
    pub limit: usize,
    /// `None` reads every source and folds rows sharing a bucket.
    pub source: Option<Source>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleQueryResult {
    pub symbol: String,
    pub resolution_ms: Millis,
    pub candles: Vec<Candle>,
    pub is_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQueryResult {
    pub symbol: String,
    pub events: Vec<StoredEvent>,
    pub is_truncated: bool,
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    QueryError::InvalidQuery(msg.into()).into()
}

/// Inclusive range covering every `resolution_ms` bucket touched by
/// `[start_ms, end_ms]`. The end is clamped at `Millis::MAX`.
fn bucket_span(start_ms: Millis, end_ms: Millis, resolution_ms: Millis) -> Result<(Millis, Millis)> {
    let floor = |t: Millis| {
        checked_bucket_key(t, resolution_ms).ok_or_else(|| {
            invalid(format!(
                "{} has no {}ms bucket within the timestamp range",
                t, resolution_ms
            ))
        })
    };
    let start = floor(start_ms)?;
    let end = floor(end_ms)?.saturating_add(resolution_ms - 1);
    Ok((start, end))
}

fn in_range(t: Millis, (start, end): (Millis, Millis)) -> bool {
    start <= t && t <= end
}

fn matches_types(event: &StoredEvent, event_types: &[String]) -> bool {
    event_types.is_empty() || event_types.iter().any(|t| t == &event.event_type)
}

impl CandleStore {
    /// Candles for `[start_ms, end_ms]` at `resolution_ms`, all sources,
    /// capped at `default_query_limit`.
    pub fn query_candles(
        &self,
        symbol: &str,
        resolution_ms: Millis,
        start_ms: Millis,
        end_ms: Millis,
    ) -> Result<Vec<Candle>> {
        let result =
            self.query_candles_limited(symbol, resolution_ms, start_ms, end_ms, self.config.default_query_limit)?;
        Ok(result.candles)
    }

    pub fn query_candles_limited(
        &self,
        symbol: &str,
        resolution_ms: Millis,
        start_ms: Millis,
        end_ms: Millis,
        limit: usize,
    ) -> Result<CandleQueryResult> {
        self.run_candle_query(&CandleQuery {
            symbol: symbol.to_string(),
            resolution_ms,
            start_ms,
            end_ms,
            limit,
            source: None,
        })
    }

    pub fn run_candle_query(&self, query: &CandleQuery) -> Result<CandleQueryResult> {
        self.ensure_open()?;
        self.validate_candle_query(query)?;

        let span = bucket_span(query.start_ms, query.end_ms, query.resolution_ms)?;
        let key = CandleCacheKey {
            symbol: query.symbol.clone(),
            resolution_ms: query.resolution_ms,
            source: query.source,
        };

        let (raw, loaded_at) = match self.cached_candles(&key, span) {
            Some(hit) => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                (hit, None)
            }
            None => {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                let epoch = self.current_epoch();
                (self.load_candles(query, span)?, Some(epoch))
            }
        };

        let base = self.config.base_resolution_ms;
        let dense = gap_fill(&raw, base, span.0, self.config.max_dense_candles)?;
        let mut candles = if query.resolution_ms == base {
            dense
        } else {
            aggregate(&dense, query.resolution_ms)
        };

        if let Some(epoch) = loaded_at {
            let evicted = self.caches.lock().candles.insert(
                key,
                CacheEntry {
                    rows: raw,
                    covered: span,
                    epoch,
                },
            );
            self.stats
                .cache_evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }

        let is_truncated = truncate(&mut candles, query.limit);
        Ok(CandleQueryResult {
            symbol: query.symbol.clone(),
            resolution_ms: query.resolution_ms,
            candles,
            is_truncated,
        })
    }

    fn validate_candle_query(&self, query: &CandleQuery) -> Result<()> {
        if query.symbol.is_empty() {
            return Err(invalid("symbol must not be empty"));
        }
        if query.resolution_ms <= 0 {
            return Err(invalid(format!(
                "resolution_ms must be positive, got {}",
                query.resolution_ms
            )));
        }
        if query.resolution_ms < self.config.base_resolution_ms {
            return Err(invalid(format!(
                "resolution_ms {} is finer than the stored base resolution {}",
                query.resolution_ms, self.config.base_resolution_ms
            )));
        }
        if query.start_ms >= query.end_ms {
            return Err(invalid(format!(
                "start_ms {} must be before end_ms {}",
                query.start_ms, query.end_ms
            )));
        }
        Ok(())
    }

    fn is_fresh(&self, entry_epoch: u64) -> bool {
        !self.config.invalidate_cache_on_flush || entry_epoch == self.current_epoch()
    }

    /// Non-empty fresh cached base rows covering `span`, filtered to it.
    fn cached_candles(&self, key: &CandleCacheKey, span: (Millis, Millis)) -> Option<Vec<Candle>> {
        let caches = self.caches.lock();
        let entry = caches.candles.get(key)?;
        if !self.is_fresh(entry.epoch) || !entry.covers(span.0, span.1) {
            return None;
        }
        let rows: Vec<Candle> = entry
            .rows
            .iter()
            .filter(|c| in_range(c.open_time_ms, span))
            .cloned()
            .collect();
        (!rows.is_empty()).then_some(rows)
    }

    /// Base rows for `span` from storage, sources folded when unfiltered.
    fn load_candles(&self, query: &CandleQuery, span: (Millis, Millis)) -> Result<Vec<Candle>> {
        let base = self.config.base_resolution_ms;

        let raw = {
            let conn = self.conn.lock();
            read_base_candles(&conn, &query.symbol, base, span, query.source)?
        };
        let raw_rows = raw.len();
        let raw = if query.source.is_none() {
            fold_duplicates(raw)
        } else {
            raw
        };

        debug!(
            symbol = %query.symbol,
            resolution_ms = query.resolution_ms,
            raw_rows,
            folded = raw.len(),
            "Candle query served from storage"
        );
        Ok(raw)
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Events for `[start_ms, end_ms]`, oldest first. Empty `event_types`
    /// returns every type.
    pub fn query_events(
        &self,
        symbol: &str,
        start_ms: Millis,
        end_ms: Millis,
        event_types: &[String],
    ) -> Result<Vec<StoredEvent>> {
        let result = self.query_events_limited(
            symbol,
            start_ms,
            end_ms,
            event_types,
            self.config.default_query_limit,
        )?;
        Ok(result.events)
    }

    pub fn query_events_limited(
        &self,
        symbol: &str,
        start_ms: Millis,
        end_ms: Millis,
        event_types: &[String],
        limit: usize,
    ) -> Result<EventQueryResult> {
        self.ensure_open()?;
        if symbol.is_empty() {
            return Err(invalid("symbol must not be empty"));
        }
        if start_ms >= end_ms {
            return Err(invalid(format!(
                "start_ms {} must be before end_ms {}",
                start_ms, end_ms
            )));
        }

        let key = EventCacheKey {
            symbol: symbol.to_string(),
            start_ms,
            end_ms,
        };

        let cached = {
            let caches = self.caches.lock();
            caches
                .events
                .get(&key)
                .filter(|entry| self.is_fresh(entry.epoch))
                .map(|entry| {
                    entry
                        .rows
                        .iter()
                        .filter(|e| matches_types(e, event_types))
                        .cloned()
                        .collect::<Vec<_>>()
                })
        };

        let mut events = match cached {
            Some(rows) if event_types.is_empty() || !rows.is_empty() => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                rows
            }
            _ => {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                let epoch = self.current_epoch();
                let all = {
                    let conn = self.conn.lock();
                    read_events(&conn, symbol, start_ms, end_ms)?
                };
                let filtered = all
                    .iter()
                    .filter(|e| matches_types(e, event_types))
                    .cloned()
                    .collect();

                let evicted = self.caches.lock().events.insert(
                    key,
                    CacheEntry {
                        rows: all,
                        covered: (start_ms, end_ms),
                        epoch,
                    },
                );
                self.stats
                    .cache_evictions
                    .fetch_add(evicted as u64, Ordering::Relaxed);
                filtered
            }
        };

        let is_truncated = truncate(&mut events, limit);
        Ok(EventQueryResult {
            symbol: symbol.to_string(),
            events,
            is_truncated,
        })
    }
}

fn read_base_candles(
    conn: &Connection,
    symbol: &str,
    base_ms: Millis,
    (start_ms, end_ms): (Millis, Millis),
    source: Option<Source>,
) -> Result<Vec<Candle>> {
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Candle> {
        Ok(Candle {
            symbol: symbol.to_string(),
            open_time_ms: row.get(0)?,
            open: row.get(1)?,
            high: row.get(2)?,
            low: row.get(3)?,
            close: row.get(4)?,
            volume: row.get(5)?,
            trade_count: row.get::<_, Option<i64>>(6)?.unwrap_or(0) as u64,
        })
    };

    let candles = match source {
        Some(source) => {
            let mut stmt = conn.prepare_cached(
                "SELECT open_time_ms, open, high, low, close, volume, trade_count
                 FROM candles
                 WHERE symbol = ?1 AND resolution_ms = ?2 AND source = ?3
                   AND open_time_ms BETWEEN ?4 AND ?5
                 ORDER BY open_time_ms ASC",
            )?;
            let rows = stmt
                .query_map(params![symbol, base_ms, source.as_str(), start_ms, end_ms], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        }
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT open_time_ms, open, high, low, close, volume, trade_count
                 FROM candles
                 WHERE symbol = ?1 AND resolution_ms = ?2
                   AND open_time_ms BETWEEN ?3 AND ?4
                 ORDER BY open_time_ms ASC, source ASC",
            )?;
            let rows = stmt
                .query_map(params![symbol, base_ms, start_ms, end_ms], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        }
    };

    candles.with_context(|| format!("Failed to read candles for {}", symbol))
}

fn read_events(
    conn: &Connection,
    symbol: &str,
    start_ms: Millis,
    end_ms: Millis,
) -> Result<Vec<StoredEvent>> {
    let mut stmt = conn.prepare_cached(
        "SELECT event_type, timestamp_ms, source, data
         FROM events
         WHERE symbol = ?1 AND timestamp_ms BETWEEN ?2 AND ?3
         ORDER BY timestamp_ms ASC, event_id ASC",
    )?;
    let rows = stmt
        .query_map(params![symbol, start_ms, end_ms], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("Failed to read events for {}", symbol))?;

    rows.into_iter()
        .map(|(event_type, timestamp_ms, source, data)| -> Result<StoredEvent> {
            let data = serde_json::from_str(&data)
                .with_context(|| format!("Corrupt {} payload at {}", event_type, timestamp_ms))?;
            Ok(StoredEvent {
                event_type,
                timestamp_ms,
                symbol: symbol.to_string(),
                source: source.parse()?,
                data,
            })
        })
        .collect()
}
