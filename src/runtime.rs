//! Strategy runtime
//!
//! One worker task per registered instrument: callbacks for a given symbol
//! fire strictly in event-arrival order with no re-entrancy, while different
//! symbols dispatch concurrently. A router task fans bus events out to the
//! workers over bounded queues; a stalled worker costs that instrument its
//! event after a bounded wait, never the whole loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, EventKind};
use crate::context::EngineContext;
use crate::instrument::InstrumentView;
use crate::oms::Order;
use crate::types::Symbol;

/// Per-instrument event deliveries give up after this long on a full queue.
const DISPATCH_STALL: Duration = Duration::from_secs(5);

/// Strategy callback contract
///
/// All callbacks default to no-ops; implement the ones the strategy needs.
/// For one instrument they are never invoked concurrently or out of order.
#[allow(unused_variables)]
pub trait Strategy: Send + 'static {
    /// Fires once, before the first event for the instrument.
    fn on_start(&mut self, view: &InstrumentView) {}
    fn on_quote(&mut self, view: &InstrumentView) {}
    fn on_orderbook(&mut self, view: &InstrumentView) {}
    fn on_tick(&mut self, view: &InstrumentView) {}
    fn on_bar(&mut self, view: &InstrumentView) {}
    fn on_fill(&mut self, view: &InstrumentView, order: &Order) {}
}

/// Dispatches bus events to per-instrument strategy workers
pub struct StrategyRuntime {
    ctx: EngineContext,
    workers: HashMap<Symbol, mpsc::Sender<BusEvent>>,
    worker_handles: Vec<JoinHandle<()>>,
    router_handle: Option<JoinHandle<()>>,
    shutdown: Arc<Notify>,
}

impl StrategyRuntime {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            workers: HashMap::new(),
            worker_handles: Vec::new(),
            router_handle: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Attach a strategy instance to one instrument. Must be called before
    /// `start`; each instrument gets its own serial worker.
    pub fn register(&mut self, symbol: Symbol, mut strategy: Box<dyn Strategy>) {
        let (tx, mut rx) = mpsc::channel::<BusEvent>(self.ctx.config.dispatch_queue);
        let resolution = self.ctx.config.resolutions[0];
        let store = self.ctx.store.clone();
        let oms = self.ctx.oms.clone();
        let worker_symbol = symbol.clone();

        let handle = tokio::spawn(async move {
            let view = InstrumentView::new(worker_symbol.clone(), resolution, store.clone(), oms.clone());
            strategy.on_start(&view);
            debug!(symbol = %worker_symbol, "strategy started");

            while let Some(event) = rx.recv().await {
                match event {
                    BusEvent::Tick(tick) => {
                        store.push_tick(tick.clone());
                        oms.on_price(&worker_symbol, tick.last);
                        oms.sweep_expired(tick.timestamp);
                        strategy.on_tick(&view.clone().at(tick.timestamp));
                    }
                    BusEvent::Bar(bar) => {
                        store.push_bar(bar.clone());
                        oms.on_price(&worker_symbol, bar.close);
                        strategy.on_bar(&view.clone().at(bar.start));
                    }
                    BusEvent::Quote(quote) => {
                        let at = quote.timestamp;
                        store.set_quote(quote);
                        strategy.on_quote(&view.clone().at(at));
                    }
                    BusEvent::OrderBook(book) => {
                        let at = book.timestamp;
                        store.set_orderbook(book);
                        strategy.on_orderbook(&view.clone().at(at));
                    }
                    BusEvent::Fill(report) => {
                        if let Some(order) = oms.on_fill(&report) {
                            strategy.on_fill(&view.clone().at(report.timestamp), &order);
                        }
                    }
                    BusEvent::Heartbeat(at) => {
                        oms.sweep_expired(at);
                    }
                }
            }
            debug!(symbol = %worker_symbol, "strategy worker drained");
        });

        self.workers.insert(symbol, tx);
        self.worker_handles.push(handle);
    }

    /// Subscribe to the bus and start routing. Events published before this
    /// call are not delivered.
    pub fn start(&mut self) {
        let mut sub = self.ctx.bus.subscribe(&EventKind::ALL);
        let workers = self.workers.clone();
        let oms = self.ctx.oms.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = sub.recv() => match event {
                        Some(event) => route(&workers, &oms, event).await,
                        None => break,
                    },
                    _ = shutdown.notified() => {
                        // drain what is already queued, then stop
                        while let Some(event) = sub.try_recv() {
                            route(&workers, &oms, event).await;
                        }
                        break;
                    }
                }
            }
            debug!("event router stopped");
        });
        self.router_handle = Some(handle);
        info!(instruments = self.workers.len(), "strategy runtime started");
    }

    /// Coordinated drain: stop routing, let queued callbacks finish, then
    /// refuse new submissions and cancel whatever is still live.
    pub async fn shutdown(&mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.router_handle.take() {
            let _ = handle.await;
        }
        self.workers.clear(); // closes worker channels
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        self.ctx.oms.shutdown();
        info!("strategy runtime stopped");
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }
}

/// Deliver one bus event to the worker owning its symbol.
async fn route(
    workers: &HashMap<Symbol, mpsc::Sender<BusEvent>>,
    oms: &Arc<crate::oms::OrderManager>,
    event: BusEvent,
) {
    let symbol = match &event {
        BusEvent::Tick(t) => Some(t.symbol.clone()),
        BusEvent::Bar(b) => Some(b.symbol.clone()),
        BusEvent::Quote(q) => Some(q.symbol.clone()),
        BusEvent::OrderBook(ob) => Some(ob.symbol.clone()),
        // fills carry only an order id; resolve through the OMS
        BusEvent::Fill(f) => match oms.order(f.order_id) {
            Some(order) => Some(order.symbol),
            None => {
                warn!(order_id = f.order_id, "fill for unknown order dropped");
                return;
            }
        },
        BusEvent::Heartbeat(_) => None,
    };

    match symbol {
        Some(symbol) => {
            let Some(tx) = workers.get(&symbol) else {
                // no strategy registered for this instrument
                return;
            };
            match timeout(DISPATCH_STALL, tx.send(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!(%symbol, "worker gone; event dropped"),
                Err(_) => warn!(%symbol, "dispatch queue stalled; event dropped"),
            }
        }
        None => {
            // heartbeats go to every worker
            for (symbol, tx) in workers {
                match timeout(DISPATCH_STALL, tx.send(event.clone())).await {
                    Ok(_) => {}
                    Err(_) => warn!(%symbol, "dispatch queue stalled; heartbeat dropped"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, InstrumentConfig};
    use crate::oms::SimBroker;
    use crate::types::{Resolution, Tick};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_ctx(symbols: &[&str]) -> EngineContext {
        let config = Config {
            instruments: symbols
                .iter()
                .map(|s| InstrumentConfig {
                    symbol: (*s).into(),
                    tick_window: 100,
                    bar_window: 50,
                })
                .collect(),
            resolutions: vec![Resolution::Ticks(3)],
            ..Config::default()
        };
        EngineContext::build(config, Arc::new(SimBroker::new())).unwrap()
    }

    fn tick(sym: &str, seq: i64, price: f64) -> BusEvent {
        BusEvent::Tick(Arc::new(Tick {
            symbol: Symbol::new(sym),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap()
                + chrono::Duration::seconds(seq),
            last: price,
            last_size: 1.0,
            bid: price - 0.25,
            bid_size: 1.0,
            ask: price + 0.25,
            ask_size: 1.0,
        }))
    }

    /// Records the prices it saw, in callback order.
    struct Recorder {
        seen: Arc<Mutex<Vec<f64>>>,
        started: Arc<AtomicUsize>,
    }

    impl Strategy for Recorder {
        fn on_start(&mut self, _view: &InstrumentView) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_tick(&mut self, view: &InstrumentView) {
            // on_start must precede any event
            assert!(self.started.load(Ordering::SeqCst) > 0);
            let last = view.ticks(Some(1))[0].last;
            self.seen.lock().unwrap().push(last);
        }
    }

    #[tokio::test]
    async fn test_per_instrument_dispatch_preserves_order() {
        let ctx = test_ctx(&["ESU25"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));

        let mut runtime = StrategyRuntime::new(ctx.clone());
        runtime.register(
            Symbol::new("ESU25"),
            Box::new(Recorder {
                seen: seen.clone(),
                started: started.clone(),
            }),
        );
        runtime.start();

        for i in 0..10 {
            ctx.bus.publish(tick("ESU25", i, 100.0 + i as f64));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.shutdown().await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 10);
        for (i, price) in seen.iter().enumerate() {
            assert_eq!(*price, 100.0 + i as f64);
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_for_unregistered_symbol_ignored() {
        let ctx = test_ctx(&["ESU25", "NQZ25"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));

        let mut runtime = StrategyRuntime::new(ctx.clone());
        runtime.register(
            Symbol::new("ESU25"),
            Box::new(Recorder {
                seen: seen.clone(),
                started: started.clone(),
            }),
        );
        runtime.start();

        ctx.bus.publish(tick("NQZ25", 0, 5000.0));
        ctx.bus.publish(tick("ESU25", 1, 100.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.shutdown().await;

        assert_eq!(seen.lock().unwrap().clone(), vec![100.0]);
    }

    #[tokio::test]
    async fn test_worker_updates_rolling_store() {
        let ctx = test_ctx(&["ESU25"]);
        let mut runtime = StrategyRuntime::new(ctx.clone());
        runtime.register(
            Symbol::new("ESU25"),
            Box::new(Recorder {
                seen: Arc::new(Mutex::new(Vec::new())),
                started: Arc::new(AtomicUsize::new(0)),
            }),
        );
        runtime.start();

        for i in 0..4 {
            ctx.bus.publish(tick("ESU25", i, 100.0 + i as f64));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.shutdown().await;

        assert_eq!(ctx.store.get_ticks(&Symbol::new("ESU25"), None).len(), 4);
    }
}
