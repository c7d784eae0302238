//! Integration tests for the tickflow pipeline
//!
//! These drive ticks through the real aggregator, bus, runtime and OMS
//! together, the same path the replay binary uses.

use chrono::{TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tickflow::backtest::{Backtest, ReplayPace};
use tickflow::config::{Config, InstrumentConfig};
use tickflow::context::EngineContext;
use tickflow::instrument::InstrumentView;
use tickflow::oms::{OrderId, OrderRole, OrderState, OrderTicket, SimBroker};
use tickflow::runtime::{Strategy, StrategyRuntime};
use tickflow::{Resolution, Symbol, Tick};

// =============================================================================
// Test Utilities
// =============================================================================

fn build_ctx(
    broker: Arc<SimBroker>,
    resolutions: Vec<Resolution>,
    tick_window: usize,
    bar_window: usize,
) -> EngineContext {
    let config = Config {
        instruments: vec![InstrumentConfig {
            symbol: "ESU25".into(),
            tick_window,
            bar_window,
        }],
        resolutions,
        bus_capacity: 16_384,
        ..Config::default()
    };
    EngineContext::build(config, broker).unwrap()
}

/// One tick per second starting 2025-06-02 14:30:00 UTC, prices from `price`.
fn gen_ticks(count: usize, price: impl Fn(usize) -> f64) -> Vec<Tick> {
    let start = Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap();
    (0..count)
        .map(|i| {
            let last = price(i);
            Tick {
                symbol: Symbol::new("ESU25"),
                timestamp: start + chrono::Duration::seconds(i as i64),
                last,
                last_size: 2.0,
                bid: last - 0.25,
                bid_size: 10.0,
                ask: last + 0.25,
                ask_size: 10.0,
            }
        })
        .collect()
}

/// Submits one bracket market buy on the first tick, then just watches.
struct BracketOnce {
    target: f64,
    stop: f64,
    entry_id: Arc<Mutex<Option<OrderId>>>,
    fills: Arc<Mutex<Vec<OrderRole>>>,
}

impl Strategy for BracketOnce {
    fn on_tick(&mut self, view: &InstrumentView) {
        let mut entry_id = self.entry_id.lock().unwrap();
        if entry_id.is_some() {
            return;
        }
        let ticket = OrderTicket::market(view.symbol().clone(), tickflow::Side::Buy, 1.0)
            .with_bracket(self.target, self.stop);
        *entry_id = Some(view.order(ticket).unwrap());
    }

    fn on_fill(&mut self, _view: &InstrumentView, order: &tickflow::oms::Order) {
        self.fills.lock().unwrap().push(order.role);
    }
}

/// Submits one far-from-market limit buy with a short expiry on the first tick.
struct StaleLimit {
    limit: f64,
    expiry_secs: i64,
    order_id: Arc<Mutex<Option<OrderId>>>,
}

impl Strategy for StaleLimit {
    fn on_tick(&mut self, view: &InstrumentView) {
        let mut order_id = self.order_id.lock().unwrap();
        if order_id.is_some() {
            return;
        }
        let ticket =
            OrderTicket::limit(view.symbol().clone(), tickflow::Side::Buy, 1.0, self.limit)
                .expires_in(self.expiry_secs);
        *order_id = Some(view.order(ticket).unwrap());
    }
}

// =============================================================================
// Pipeline Tests
// =============================================================================

#[tokio::test]
async fn test_tick_pipeline_builds_bars_and_rolls_windows() {
    let broker = Arc::new(SimBroker::new());
    let ctx = build_ctx(broker.clone(), vec![Resolution::Time(60)], 100, 10);

    let mut runtime = StrategyRuntime::new(ctx.clone());
    runtime.register(
        Symbol::new("ESU25"),
        Box::new(BracketOnce {
            target: 1_000_000.0, // never touched; this test is about data flow
            stop: 1.0,
            entry_id: Arc::new(Mutex::new(None)),
            fills: Arc::new(Mutex::new(Vec::new())),
        }),
    );
    runtime.start();

    // 33 minutes of one-second ticks
    let report = Backtest::new(ctx.clone(), broker)
        .run(gen_ticks(2000, |i| 100.0 + (i % 10) as f64 * 0.25))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.shutdown().await;

    assert_eq!(report.records_replayed, 2000);
    // 2000s spans 33 complete minutes plus a partial one
    assert_eq!(report.bars_emitted, 33);

    let symbol = Symbol::new("ESU25");
    // rolling windows evict oldest-first
    assert_eq!(ctx.store.get_ticks(&symbol, None).len(), 100);
    let bars = ctx.store.get_bars(&symbol, Resolution::Time(60), None);
    assert_eq!(bars.len(), 10);
    for pair in bars.windows(2) {
        assert!(pair[1].start > pair[0].start);
        assert!(pair[1].is_valid());
    }
    // newest bar survived eviction
    assert_eq!(
        bars[9].start,
        Utc.with_ymd_and_hms(2025, 6, 2, 15, 2, 0).unwrap()
    );
}

#[tokio::test]
async fn test_bracket_lifecycle_through_replay() {
    let broker = Arc::new(SimBroker::new());
    let ctx = build_ctx(broker.clone(), vec![Resolution::Time(60)], 1000, 100);

    let entry_id = Arc::new(Mutex::new(None));
    let fills = Arc::new(Mutex::new(Vec::new()));
    let mut runtime = StrategyRuntime::new(ctx.clone());
    runtime.register(
        Symbol::new("ESU25"),
        Box::new(BracketOnce {
            target: 102.0,
            stop: 98.0,
            entry_id: entry_id.clone(),
            fills: fills.clone(),
        }),
    );
    runtime.start();

    // flat at 100, then a slow ramp through the 102 target
    let ticks = gen_ticks(60, |i| {
        if i < 20 {
            100.0
        } else {
            (100.0 + (i - 20) as f64 * 0.25).min(102.5)
        }
    });
    Backtest::new(ctx.clone(), broker)
        .with_pace(ReplayPace::Fixed(Duration::from_millis(1)))
        .run(ticks)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.shutdown().await;

    let entry_id = entry_id.lock().unwrap().unwrap();
    let entry = ctx.oms.order(entry_id).unwrap();
    assert_eq!(entry.state, OrderState::Filled);

    // target filled, stop cancelled by OCO, position flat again
    let symbol = Symbol::new("ESU25");
    let position = ctx.oms.position(&symbol).unwrap();
    assert!(position.is_flat());
    assert!(position.realized_pnl > 0.0);

    let fills = fills.lock().unwrap().clone();
    assert_eq!(fills, vec![OrderRole::Entry, OrderRole::Target]);
}

#[tokio::test]
async fn test_unfilled_entry_expires_during_replay() {
    let broker = Arc::new(SimBroker::new());
    let ctx = build_ctx(broker.clone(), vec![Resolution::Time(60)], 1000, 100);

    let order_id = Arc::new(Mutex::new(None));
    let mut runtime = StrategyRuntime::new(ctx.clone());
    runtime.register(
        Symbol::new("ESU25"),
        Box::new(StaleLimit {
            limit: 90.0, // market holds at 100; never fillable
            expiry_secs: 5,
            order_id: order_id.clone(),
        }),
    );
    runtime.start();

    Backtest::new(ctx.clone(), broker)
        .with_pace(ReplayPace::Fixed(Duration::from_millis(1)))
        .run(gen_ticks(15, |_| 100.0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.shutdown().await;

    // replay clock passed the 5s deadline; wall time barely moved
    let order_id = order_id.lock().unwrap().unwrap();
    assert_eq!(ctx.oms.order(order_id).unwrap().state, OrderState::Expired);
    assert!(ctx.oms.position(&Symbol::new("ESU25")).is_none());
}

#[tokio::test]
async fn test_cancelled_replay_shuts_down_cleanly() {
    let broker = Arc::new(SimBroker::new());
    let ctx = build_ctx(broker.clone(), vec![Resolution::Time(60)], 1000, 100);

    let mut runtime = StrategyRuntime::new(ctx.clone());
    runtime.register(
        Symbol::new("ESU25"),
        Box::new(BracketOnce {
            target: 102.0,
            stop: 98.0,
            entry_id: Arc::new(Mutex::new(None)),
            fills: Arc::new(Mutex::new(Vec::new())),
        }),
    );
    runtime.start();

    let backtest = Backtest::new(ctx.clone(), broker)
        .with_pace(ReplayPace::Fixed(Duration::from_millis(2)));
    let cancel = backtest.cancel_handle();
    let task = tokio::spawn(backtest.run(gen_ticks(10_000, |_| 100.0)));

    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    let report = task.await.unwrap().unwrap();

    // partial completion reported, runtime drains without panicking
    assert!(report.cancelled);
    assert!(report.records_replayed < report.records_total);
    runtime.shutdown().await;
    assert!(ctx.oms.pending_orders(&Symbol::new("ESU25")).is_empty());
}
