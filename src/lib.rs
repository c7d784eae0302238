//! Tickflow
//!
//! An event-driven trading runtime: raw ticks fan out over a pub/sub bus,
//! get aggregated into time, tick-count and volume bars, and drive
//! per-instrument strategies with bracket/OCO order management. The same
//! pipeline runs live feeds and historical replays.

pub mod aggregator;
pub mod backtest;
pub mod bus;
pub mod config;
pub mod context;
pub mod datastore;
pub mod errors;
pub mod instrument;
pub mod oms;
pub mod runtime;
pub mod store;
pub mod types;

pub use backtest::{Backtest, BacktestReport, CancelHandle, ReplayPace};
pub use config::Config;
pub use context::EngineContext;
pub use errors::EngineError;
pub use instrument::InstrumentView;
pub use runtime::{Strategy, StrategyRuntime};
pub use types::*;
