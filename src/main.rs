//! Tickflow entry point
//!
//! Two subcommands:
//! - replay: drip a CSV tick file through the full pipeline with a demo strategy
//! - init-db: create the history database schema

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tickflow::backtest::{Backtest, ReplayPace};
use tickflow::config::Config;
use tickflow::context::EngineContext;
use tickflow::datastore::{load_ticks_csv, HistoryStore};
use tickflow::instrument::InstrumentView;
use tickflow::oms::SimBroker;
use tickflow::runtime::{Strategy, StrategyRuntime};

#[derive(Parser, Debug)]
#[command(name = "tickflow")]
#[command(about = "Tick-to-bar trading runtime with replay backtesting", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a CSV tick file through the pipeline
    Replay {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        /// CSV tick file (symbol,datetime,bid,bidsize,ask,asksize,last,lastsize)
        #[arg(short, long)]
        ticks: String,

        /// Delay between records in milliseconds; 0 replays at full speed
        #[arg(long, default_value = "0")]
        pace_ms: u64,

        /// Record replayed ticks and bars to this history database
        #[arg(long)]
        record_db: Option<String>,
    },

    /// Create the history database schema
    InitDb {
        /// Database path
        #[arg(long, default_value = "history.db")]
        db: String,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Logs bar closes and tags notable range expansions; exercises the read
/// side of the instrument facade without placing orders.
struct BarLogger;

impl Strategy for BarLogger {
    fn on_start(&mut self, view: &InstrumentView) {
        info!(symbol = %view.symbol(), resolution = %view.resolution(), "strategy attached");
    }

    fn on_bar(&mut self, view: &InstrumentView) {
        let bars = view.bars(Some(2));
        let Some(bar) = bars.last() else { return };
        info!(
            symbol = %view.symbol(),
            start = %bar.start,
            open = bar.open,
            high = bar.high,
            low = bar.low,
            close = bar.close,
            volume = bar.volume,
            "bar closed"
        );
        if let [prev, bar] = &bars[..] {
            let range = bar.high - bar.low;
            let prev_range = prev.high - prev.low;
            if prev_range > 0.0 && range > prev_range * 2.0 {
                view.record(
                    "range_expansion",
                    serde_json::json!({ "range": range, "prev_range": prev_range }),
                );
            }
        }
    }
}

async fn run_replay(
    config_path: &str,
    ticks_path: &str,
    pace_ms: u64,
    record_db: Option<&str>,
) -> Result<()> {
    let config = Config::from_file(config_path)?;
    let ticks = load_ticks_csv(ticks_path)?;

    let broker = Arc::new(SimBroker::new());
    let ctx = EngineContext::build(config, broker.clone())?;

    let mut runtime = StrategyRuntime::new(ctx.clone());
    for symbol in ctx.config.symbols() {
        runtime.register(symbol, Box::new(BarLogger));
    }
    runtime.start();

    let mut backtest = Backtest::new(ctx.clone(), broker);
    if pace_ms > 0 {
        backtest = backtest.with_pace(ReplayPace::Fixed(Duration::from_millis(pace_ms)));
    }
    if let Some(db) = record_db {
        backtest = backtest.with_history(Arc::new(HistoryStore::open(db)?));
    }

    let cancel = backtest.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping replay");
            cancel.cancel();
        }
    });

    let report = backtest.run(ticks).await?;
    runtime.shutdown().await;

    info!(
        replayed = report.records_replayed,
        total = report.records_total,
        bars = report.bars_emitted,
        fills = report.fills_generated,
        cancelled = report.cancelled,
        "replay complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Replay {
            config,
            ticks,
            pace_ms,
            record_db,
        } => run_replay(&config, &ticks, pace_ms, record_db.as_deref()).await,
        Commands::InitDb { db } => {
            HistoryStore::open(&db)?;
            info!(path = db, "history database initialized");
            Ok(())
        }
    }
}
