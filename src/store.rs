//! Rolling per-instrument market-data store
//!
//! Bounded ring buffers of ticks and bars plus single-slot quote/orderbook
//! snapshots. Eviction is oldest-first once a window is full. Reads never
//! fail: an unknown symbol or a zero lookback yields an empty result.
//!
//! Locking is fine-grained — a read-mostly outer map guards per-symbol
//! mutexes, so unrelated symbols never contend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use crate::types::{Bar, OrderBookSnapshot, Quote, Resolution, SignalRecord, Symbol, Tick};

struct SymbolStore {
    tick_window: usize,
    bar_window: usize,
    ticks: VecDeque<Arc<Tick>>,
    bars: HashMap<Resolution, VecDeque<Arc<Bar>>>,
    quote: Option<Arc<Quote>>,
    book: Option<Arc<OrderBookSnapshot>>,
    signals: Vec<SignalRecord>,
}

impl SymbolStore {
    fn new(tick_window: usize, bar_window: usize) -> Self {
        Self {
            tick_window,
            bar_window,
            ticks: VecDeque::with_capacity(tick_window),
            bars: HashMap::new(),
            quote: None,
            book: None,
            signals: Vec::new(),
        }
    }
}

/// Bounded rolling history for a set of registered instruments
pub struct RollingStore {
    symbols: RwLock<HashMap<Symbol, Arc<Mutex<SymbolStore>>>>,
}

impl RollingStore {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Register an instrument with its window sizes. Re-registering an
    /// existing symbol is a no-op (history is kept).
    pub fn register(&self, symbol: Symbol, tick_window: usize, bar_window: usize) {
        let mut map = self.symbols.write().expect("store map poisoned");
        map.entry(symbol)
            .or_insert_with(|| Arc::new(Mutex::new(SymbolStore::new(tick_window, bar_window))));
    }

    pub fn is_registered(&self, symbol: &Symbol) -> bool {
        self.symbols
            .read()
            .expect("store map poisoned")
            .contains_key(symbol)
    }

    fn entry(&self, symbol: &Symbol) -> Option<Arc<Mutex<SymbolStore>>> {
        self.symbols
            .read()
            .expect("store map poisoned")
            .get(symbol)
            .cloned()
    }

    pub fn push_tick(&self, tick: Arc<Tick>) {
        if let Some(entry) = self.entry(&tick.symbol) {
            let mut s = entry.lock().expect("symbol store poisoned");
            if s.ticks.len() == s.tick_window {
                s.ticks.pop_front();
            }
            s.ticks.push_back(tick);
        }
    }

    pub fn push_bar(&self, bar: Arc<Bar>) {
        if let Some(entry) = self.entry(&bar.symbol) {
            let mut s = entry.lock().expect("symbol store poisoned");
            let window = s.bar_window;
            let buf = s
                .bars
                .entry(bar.resolution)
                .or_insert_with(|| VecDeque::with_capacity(window));
            if buf.len() == window {
                buf.pop_front();
            }
            buf.push_back(bar);
        }
    }

    pub fn set_quote(&self, quote: Arc<Quote>) {
        if let Some(entry) = self.entry(&quote.symbol) {
            entry.lock().expect("symbol store poisoned").quote = Some(quote);
        }
    }

    pub fn set_orderbook(&self, book: Arc<OrderBookSnapshot>) {
        if let Some(entry) = self.entry(&book.symbol) {
            entry.lock().expect("symbol store poisoned").book = Some(book);
        }
    }

    pub fn push_signal(&self, record: SignalRecord) {
        if let Some(entry) = self.entry(&record.symbol) {
            entry
                .lock()
                .expect("symbol store poisoned")
                .signals
                .push(record);
        }
    }

    /// Most-recent `lookback` ticks in arrival order; full window if `None`.
    pub fn get_ticks(&self, symbol: &Symbol, lookback: Option<usize>) -> Vec<Arc<Tick>> {
        match self.entry(symbol) {
            Some(entry) => {
                let s = entry.lock().expect("symbol store poisoned");
                tail(&s.ticks, lookback)
            }
            None => Vec::new(),
        }
    }

    /// Most-recent `lookback` bars at `resolution` in arrival order.
    pub fn get_bars(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
        lookback: Option<usize>,
    ) -> Vec<Arc<Bar>> {
        match self.entry(symbol) {
            Some(entry) => {
                let s = entry.lock().expect("symbol store poisoned");
                s.bars
                    .get(&resolution)
                    .map(|buf| tail(buf, lookback))
                    .unwrap_or_default()
            }
            None => Vec::new(),
        }
    }

    pub fn get_quote(&self, symbol: &Symbol) -> Option<Arc<Quote>> {
        self.entry(symbol)
            .and_then(|e| e.lock().expect("symbol store poisoned").quote.clone())
    }

    pub fn get_orderbook(&self, symbol: &Symbol) -> Option<Arc<OrderBookSnapshot>> {
        self.entry(symbol)
            .and_then(|e| e.lock().expect("symbol store poisoned").book.clone())
    }

    pub fn get_signals(&self, symbol: &Symbol) -> Vec<SignalRecord> {
        self.entry(symbol)
            .map(|e| e.lock().expect("symbol store poisoned").signals.clone())
            .unwrap_or_default()
    }

    /// Last trade price, if any tick has been seen.
    pub fn last_price(&self, symbol: &Symbol) -> Option<f64> {
        self.entry(symbol).and_then(|e| {
            e.lock()
                .expect("symbol store poisoned")
                .ticks
                .back()
                .map(|t| t.last)
        })
    }
}

impl Default for RollingStore {
    fn default() -> Self {
        Self::new()
    }
}

fn tail<T: Clone>(buf: &VecDeque<T>, lookback: Option<usize>) -> Vec<T> {
    match lookback {
        None => buf.iter().cloned().collect(),
        Some(0) => Vec::new(),
        Some(n) => buf.iter().skip(buf.len().saturating_sub(n)).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn tick(symbol: &Symbol, seq: i64, price: f64) -> Arc<Tick> {
        Arc::new(Tick {
            symbol: symbol.clone(),
            timestamp: Utc::now() + Duration::seconds(seq),
            last: price,
            last_size: 1.0,
            bid: price - 0.25,
            bid_size: 10.0,
            ask: price + 0.25,
            ask_size: 10.0,
        })
    }

    #[test]
    fn test_window_eviction_keeps_most_recent() {
        let store = RollingStore::new();
        let sym = Symbol::new("ESU25");
        store.register(sym.clone(), 5, 5);

        for i in 0..12 {
            store.push_tick(tick(&sym, i, 100.0 + i as f64));
        }

        let got = store.get_ticks(&sym, Some(5));
        assert_eq!(got.len(), 5);
        // arrival order, exactly the 5 most recent
        let prices: Vec<f64> = got.iter().map(|t| t.last).collect();
        assert_eq!(prices, vec![107.0, 108.0, 109.0, 110.0, 111.0]);
    }

    #[test]
    fn test_lookback_edge_cases() {
        let store = RollingStore::new();
        let sym = Symbol::new("ESU25");
        store.register(sym.clone(), 10, 10);
        store.push_tick(tick(&sym, 0, 100.0));

        assert_eq!(store.get_ticks(&sym, Some(0)).len(), 0);
        assert_eq!(store.get_ticks(&sym, Some(99)).len(), 1);
        assert_eq!(store.get_ticks(&sym, None).len(), 1);

        // unknown symbol: empty, never an error
        assert!(store.get_ticks(&Symbol::new("NOPE"), None).is_empty());
        assert!(store
            .get_bars(&Symbol::new("NOPE"), Resolution::Time(60), None)
            .is_empty());
        assert!(store.get_quote(&Symbol::new("NOPE")).is_none());
    }

    #[test]
    fn test_quote_slot_overwritten_in_place() {
        let store = RollingStore::new();
        let sym = Symbol::new("ESU25");
        store.register(sym.clone(), 10, 10);

        for bid in [99.0, 99.5, 100.0] {
            store.set_quote(Arc::new(Quote {
                symbol: sym.clone(),
                timestamp: Utc::now(),
                bid,
                bid_size: 5.0,
                ask: bid + 0.5,
                ask_size: 5.0,
            }));
        }
        assert_eq!(store.get_quote(&sym).unwrap().bid, 100.0);
    }

    #[test]
    fn test_bars_partitioned_by_resolution() {
        let store = RollingStore::new();
        let sym = Symbol::new("ESU25");
        store.register(sym.clone(), 10, 10);

        let bar = |res: Resolution| {
            Arc::new(Bar {
                symbol: sym.clone(),
                start: Utc::now(),
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
                tick_count: 3,
                resolution: res,
            })
        };
        store.push_bar(bar(Resolution::Time(60)));
        store.push_bar(bar(Resolution::Ticks(100)));

        assert_eq!(store.get_bars(&sym, Resolution::Time(60), None).len(), 1);
        assert_eq!(store.get_bars(&sym, Resolution::Ticks(100), None).len(), 1);
        assert_eq!(store.get_bars(&sym, Resolution::Time(300), None).len(), 0);
    }

    #[test]
    fn test_signal_records_append_only() {
        let store = RollingStore::new();
        let sym = Symbol::new("ESU25");
        store.register(sym.clone(), 10, 10);

        store.push_signal(SignalRecord {
            symbol: sym.clone(),
            timestamp: Utc::now(),
            name: "rsi_cross".into(),
            value: serde_json::json!(31.5),
        });
        let signals = store.get_signals(&sym);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].name, "rsi_cross");
    }
}
