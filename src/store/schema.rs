//! Connection setup and versioned schema migration.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::models::Source;

pub const SCHEMA_VERSION: i64 = 1;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
"#;

const SCHEMA_V1: &str = r#"
-- OHLCV candles at any resolution
CREATE TABLE IF NOT EXISTS candles (
    symbol TEXT NOT NULL,
    resolution_ms INTEGER NOT NULL,
    open_time_ms INTEGER NOT NULL,
    source TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    trade_count INTEGER,
    ingestion_time DATETIME DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (symbol, resolution_ms, open_time_ms, source)
);

CREATE INDEX IF NOT EXISTS idx_candles_query
    ON candles(symbol, resolution_ms, open_time_ms);

CREATE INDEX IF NOT EXISTS idx_candles_by_source
    ON candles(source, open_time_ms);

-- Typed event log (order lifecycle etc.), payload stored as JSON text
CREATE TABLE IF NOT EXISTS events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    source TEXT NOT NULL,
    data TEXT NOT NULL,
    ingestion_time DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_events_query
    ON events(symbol, timestamp_ms);

CREATE INDEX IF NOT EXISTS idx_events_by_type
    ON events(event_type, symbol);

CREATE INDEX IF NOT EXISTS idx_events_ingestion
    ON events(ingestion_time);

CREATE TABLE IF NOT EXISTS sources (
    source_id TEXT PRIMARY KEY,
    description TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Apply performance pragmas and the busy timeout.
pub fn configure(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.execute_batch(PRAGMAS)
        .context("Failed to apply database pragmas")?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;

    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap_or_default();
    if journal_mode.to_lowercase() != "wal" {
        warn!(journal_mode = %journal_mode, "WAL mode not active");
    }
    Ok(())
}

/// Recorded schema version, 0 when the database is fresh. Issues no writes.
pub fn read_version(conn: &Connection) -> Result<i64> {
    let has_table: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !has_table {
        return Ok(0);
    }
    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;
    Ok(version.unwrap_or(0))
}

/// Like [`read_version`], creating the version table first.
pub fn current_version(conn: &Connection) -> Result<i64> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;
    read_version(conn)
}

/// Bring the schema up to [`SCHEMA_VERSION`] inside one transaction.
/// Safe to call on every startup.
pub fn migrate(conn: &mut Connection) -> Result<i64> {
    let version = current_version(conn)?;
    if version >= SCHEMA_VERSION {
        return Ok(version);
    }

    let tx = conn.transaction().context("Failed to begin migration")?;
    if version < 1 {
        tx.execute_batch(SCHEMA_V1)
            .context("Failed to create schema v1")?;
        for source in Source::ALL {
            tx.execute(
                "INSERT OR IGNORE INTO sources (source_id, description) VALUES (?1, ?2)",
                params![source.as_str(), source.description()],
            )?;
        }
    }
    tx.execute("DELETE FROM schema_version", [])?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;
    // Dropping `tx` on any `?` above rolls the migration back.
    tx.commit().context("Failed to commit migration")?;

    info!(from = version, to = SCHEMA_VERSION, "Candle store schema migrated");
    Ok(SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_fresh_and_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);
        assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);

        let sources: Vec<String> = conn
            .prepare("SELECT source_id FROM sources ORDER BY source_id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(sources, vec!["backtest", "live"]);
    }

    #[test]
    fn test_read_version_leaves_fresh_database_untouched() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(read_version(&conn).unwrap(), 0);

        let tables: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tables, 0);

        migrate(&mut conn).unwrap();
        assert_eq!(read_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_configure_in_memory() {
        let conn = Connection::open_in_memory().unwrap();
        // In-memory databases report journal_mode=memory; must still succeed.
        configure(&conn, 100).unwrap();
    }
}
