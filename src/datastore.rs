//! Market-data persistence
//!
//! SQLite sink for closed bars and raw ticks, plus CSV tick loading for
//! replay. History written here can be pulled back to warm the rolling
//! store before a live session starts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::store::RollingStore;
use crate::types::{Bar, Resolution, Symbol, Tick};

pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // WAL for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!(path = %db_path.display(), "history store opened");
        Ok(store)
    }

    /// In-memory database, used by tests and throwaway replays.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().expect("history store lock poisoned");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ticks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                datetime TEXT NOT NULL,
                bid REAL NOT NULL,
                bidsize REAL NOT NULL,
                ask REAL NOT NULL,
                asksize REAL NOT NULL,
                last REAL NOT NULL,
                lastsize REAL NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ticks_symbol_dt ON ticks(symbol, datetime)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS bars (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                datetime TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                resolution TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bars_symbol_res_dt ON bars(symbol, resolution, datetime)",
            [],
        )?;

        Ok(())
    }

    pub fn push_tick(&self, tick: &Tick) -> Result<()> {
        let conn = self.conn.lock().expect("history store lock poisoned");
        conn.execute(
            "INSERT INTO ticks (symbol, datetime, bid, bidsize, ask, asksize, last, lastsize)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tick.symbol.as_str(),
                tick.timestamp.to_rfc3339(),
                tick.bid,
                tick.bid_size,
                tick.ask,
                tick.ask_size,
                tick.last,
                tick.last_size,
            ],
        )?;
        Ok(())
    }

    pub fn push_bar(&self, bar: &Bar) -> Result<()> {
        let conn = self.conn.lock().expect("history store lock poisoned");
        conn.execute(
            "INSERT INTO bars (symbol, datetime, open, high, low, close, volume, resolution)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                bar.symbol.as_str(),
                bar.start.to_rfc3339(),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume,
                bar.resolution.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Most recent bars first limited to `limit`, returned oldest first.
    pub fn load_bars(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let conn = self.conn.lock().expect("history store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT datetime, open, high, low, close, volume
             FROM bars WHERE symbol = ?1 AND resolution = ?2
             ORDER BY datetime DESC LIMIT ?3",
        )?;
        let symbol_owned = symbol.clone();
        let rows = stmt.query_map(
            params![symbol.as_str(), resolution.to_string(), limit as i64],
            move |row| {
                let dt: String = row.get(0)?;
                Ok(Bar {
                    symbol: symbol_owned.clone(),
                    start: parse_dt(&dt)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    tick_count: 0,
                    resolution,
                })
            },
        )?;

        let mut bars: Vec<Bar> = rows.collect::<std::result::Result<_, _>>()?;
        bars.reverse();
        Ok(bars)
    }

    pub fn load_ticks(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Tick>> {
        let conn = self.conn.lock().expect("history store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT datetime, bid, bidsize, ask, asksize, last, lastsize
             FROM ticks WHERE symbol = ?1
             ORDER BY datetime DESC LIMIT ?2",
        )?;
        let symbol_owned = symbol.clone();
        let rows = stmt.query_map(params![symbol.as_str(), limit as i64], move |row| {
            let dt: String = row.get(0)?;
            Ok(Tick {
                symbol: symbol_owned.clone(),
                timestamp: parse_dt(&dt)?,
                bid: row.get(1)?,
                bid_size: row.get(2)?,
                ask: row.get(3)?,
                ask_size: row.get(4)?,
                last: row.get(5)?,
                last_size: row.get(6)?,
            })
        })?;

        let mut ticks: Vec<Tick> = rows.collect::<std::result::Result<_, _>>()?;
        ticks.reverse();
        Ok(ticks)
    }

    /// Warm a rolling store with persisted history before live events arrive.
    pub fn preload(
        &self,
        store: &RollingStore,
        symbol: &Symbol,
        resolutions: &[Resolution],
        bar_limit: usize,
    ) -> Result<usize> {
        let mut loaded = 0;
        for &resolution in resolutions {
            for bar in self.load_bars(symbol, resolution, bar_limit)? {
                store.push_bar(Arc::new(bar));
                loaded += 1;
            }
        }
        info!(%symbol, bars = loaded, "preloaded history");
        Ok(loaded)
    }
}

/// A corrupt datetime row is an error, never a silent epoch default.
fn parse_dt(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
    })
}

// =============================================================================
// CSV Tick Loading
// =============================================================================

/// Load ticks from a CSV file with columns
/// `symbol,datetime,bid,bidsize,ask,asksize,last,lastsize`.
pub fn load_ticks_csv(path: impl AsRef<Path>) -> Result<Vec<Tick>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut ticks = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let symbol = record.get(0).context("Missing symbol column")?;
        let dt_str = record.get(1).context("Missing datetime column")?;
        let timestamp = dt_str
            .parse::<DateTime<Utc>>()
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(dt_str, "%Y-%m-%d %H:%M:%S")
                    .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
            })
            .context(format!("Failed to parse datetime: {}", dt_str))?;

        let field = |idx: usize, name: &str| -> Result<f64> {
            record
                .get(idx)
                .context(format!("Missing {} column", name))?
                .parse()
                .context(format!("Failed to parse {}", name))
        };

        ticks.push(Tick {
            symbol: Symbol::new(symbol),
            timestamp,
            bid: field(2, "bid")?,
            bid_size: field(3, "bidsize")?,
            ask: field(4, "ask")?,
            ask_size: field(5, "asksize")?,
            last: field(6, "last")?,
            last_size: field(7, "lastsize")?,
        });
    }

    info!(rows = ticks.len(), "loaded ticks from CSV");
    Ok(ticks)
}
