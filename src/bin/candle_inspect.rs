//! Candle Store Inspector CLI
//!
//! Inspect, query, replay into, and reset a candle store database.
//!
//! Usage:
//!   cargo run --bin candle_inspect -- --db ./candles.db summary
//!   cargo run --bin candle_inspect -- --db ./candles.db candles --symbol BTCUSD --start-ms 0 --end-ms 60000
//!   cargo run --bin candle_inspect -- --db ./candles.db events --symbol BTCUSD --start-ms 0 --end-ms 60000 --types OrderFilled
//!   cargo run --bin candle_inspect -- --db ./candles.db replay --file trades.jsonl --source backtest

use anyhow::{Context, Result};
use candle_store::bus::TOPIC_TRADE_PRINT;
use candle_store::{
    BusEvent, Candle, CandlePersister, CandleStore, EventBus, Millis, Source, StoreConfig,
    TradePrint,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "candle_inspect")]
#[command(about = "Inspect and query a candle store database")]
struct Cli {
    /// Path to SQLite database (defaults to config / CANDLE_STORE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Per-symbol candle coverage and event counts
    Summary,

    /// Print candles as JSON lines
    Candles {
        #[arg(long)]
        symbol: String,

        #[arg(long, default_value = "1000")]
        resolution_ms: Millis,

        #[arg(long)]
        start_ms: Millis,

        #[arg(long)]
        end_ms: Millis,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print events as JSON lines
    Events {
        #[arg(long)]
        symbol: String,

        #[arg(long)]
        start_ms: Millis,

        #[arg(long)]
        end_ms: Millis,

        /// Comma-separated event types (all types if omitted)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Replay a JSONL trade file through the bucketer into the store,
    /// bucketed at the store's base resolution
    Replay {
        #[arg(long)]
        file: PathBuf,

        #[arg(long, default_value = "backtest")]
        source: Source,
    },

    /// Delete every stored candle and event
    Clear,
}

/// One trade line. Accepts both exchange-dump (`pair`/`volume`/`time` in
/// seconds) and native (`symbol`/`qty`/`ts_ms`) field names.
#[derive(Debug, Deserialize)]
struct TradeRecord {
    #[serde(alias = "pair")]
    symbol: String,
    price: f64,
    #[serde(alias = "volume")]
    qty: f64,
    #[serde(default)]
    time: Option<f64>,
    #[serde(default)]
    ts_ms: Option<Millis>,
}

impl TradeRecord {
    fn into_trade(self) -> Option<TradePrint> {
        let ts_ms = self
            .ts_ms
            .or_else(|| self.time.map(|secs| (secs * 1000.0).round() as Millis))?;
        Some(TradePrint::new(self.symbol, self.price, self.qty, ts_ms))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CandleLine<'a> {
    open_time: String,
    #[serde(flatten)]
    candle: &'a Candle,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_inspect=info".parse()?)
                .add_directive("candle_store=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = StoreConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    let store = Arc::new(CandleStore::open(config)?);

    match cli.command {
        Commands::Summary => print_summary(&store)?,
        Commands::Candles {
            symbol,
            resolution_ms,
            start_ms,
            end_ms,
            limit,
        } => print_candles(&store, &symbol, resolution_ms, start_ms, end_ms, limit)?,
        Commands::Events {
            symbol,
            start_ms,
            end_ms,
            types,
            limit,
        } => print_events(&store, &symbol, start_ms, end_ms, &types, limit)?,
        Commands::Replay { file, source } => replay(Arc::clone(&store), &file, source)?,
        Commands::Clear => {
            store.clear_all()?;
            println!("Cleared {}", store.config().db_path);
        }
    }

    store.shutdown()
}

fn print_summary(store: &CandleStore) -> Result<()> {
    let summary = store.summary()?;

    println!("=== Candle Store Summary ===");
    println!("Database: {}", summary.db_path);
    println!("Schema version: {}", summary.schema_version);
    println!();

    if summary.symbols.is_empty() {
        println!("  (no candles)");
    }
    for s in &summary.symbols {
        println!(
            "  {:<12} res={}ms  candles={:<8} {} .. {}",
            s.symbol,
            s.resolution_ms,
            s.candle_count,
            format_ms(s.first_open_time_ms),
            format_ms(s.last_open_time_ms),
        );
    }
    println!();
    println!("Events: {}", summary.event_count);
    Ok(())
}

fn print_candles(
    store: &CandleStore,
    symbol: &str,
    resolution_ms: Millis,
    start_ms: Millis,
    end_ms: Millis,
    limit: Option<usize>,
) -> Result<()> {
    let limit = limit.unwrap_or(store.config().default_query_limit);
    let result = store.query_candles_limited(symbol, resolution_ms, start_ms, end_ms, limit)?;

    for candle in &result.candles {
        let line = CandleLine {
            open_time: candle.open_time().to_rfc3339(),
            candle,
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    eprintln!(
        "{} candles{}",
        result.candles.len(),
        if result.is_truncated { " (truncated)" } else { "" }
    );
    Ok(())
}

fn print_events(
    store: &CandleStore,
    symbol: &str,
    start_ms: Millis,
    end_ms: Millis,
    types: &[String],
    limit: Option<usize>,
) -> Result<()> {
    let limit = limit.unwrap_or(store.config().default_query_limit);
    let result = store.query_events_limited(symbol, start_ms, end_ms, types, limit)?;

    for event in &result.events {
        println!("{}", serde_json::to_string(event)?);
    }
    eprintln!(
        "{} events{}",
        result.events.len(),
        if result.is_truncated { " (truncated)" } else { "" }
    );
    Ok(())
}

fn replay(store: Arc<CandleStore>, file: &Path, source: Source) -> Result<()> {
    let reader = BufReader::new(
        std::fs::File::open(file)
            .with_context(|| format!("Failed to open trade file: {}", file.display()))?,
    );

    let bus = Arc::new(EventBus::new());
    let persister = CandlePersister::new(Arc::clone(&bus), store, source);
    persister.start();

    let mut published = 0u64;
    let mut skipped = 0u64;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read trade file")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TradeRecord>(&line)
            .ok()
            .and_then(TradeRecord::into_trade)
        {
            Some(trade) => {
                bus.publish(TOPIC_TRADE_PRINT, &BusEvent::TradePrint(trade));
                published += 1;
            }
            None => {
                skipped += 1;
                warn!(line = idx + 1, "Skipping malformed trade record");
            }
        }
    }

    persister.stop()?;
    let stats = persister.stats();
    info!(
        published,
        skipped,
        candles = stats.candles_emitted,
        out_of_order_dropped = stats.out_of_order_dropped,
        invalid_dropped = stats.invalid_dropped,
        "Replay complete"
    );
    println!(
        "Replayed {} trades ({} skipped) into {} candles",
        published, skipped, stats.candles_emitted
    );
    Ok(())
}

fn format_ms(ms: Millis) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}
