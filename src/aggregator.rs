//! Tick-to-bar aggregation
//!
//! One open accumulator per (symbol, resolution), each behind its own lock —
//! single writer per accumulator, no global lock, unrelated symbols never
//! contend. Closed bars are immutable; periods with no ticks produce no bar
//! and no interpolation.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::types::{Bar, Resolution, Symbol, Tick};

#[derive(Debug, Clone)]
struct Accum {
    start: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    ticks: u32,
}

impl Accum {
    fn seed(start: DateTime<Utc>, tick: &Tick) -> Self {
        Self {
            start,
            open: tick.last,
            high: tick.last,
            low: tick.last,
            close: tick.last,
            volume: tick.last_size,
            ticks: 1,
        }
    }

    fn update(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.last);
        self.low = self.low.min(tick.last);
        self.close = tick.last;
        self.volume += tick.last_size;
        self.ticks += 1;
    }

    fn into_bar(self, symbol: Symbol, resolution: Resolution) -> Bar {
        Bar {
            symbol,
            start: self.start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            tick_count: self.ticks,
            resolution,
        }
    }
}

/// Builds bars at every configured resolution from one tick stream
pub struct BarAggregator {
    resolutions: Vec<Resolution>,
    slots: RwLock<HashMap<(Symbol, Resolution), Arc<Mutex<Option<Accum>>>>>,
}

impl BarAggregator {
    pub fn new(resolutions: Vec<Resolution>) -> Self {
        Self {
            resolutions,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    fn slot(&self, symbol: &Symbol, resolution: Resolution) -> Arc<Mutex<Option<Accum>>> {
        let key = (symbol.clone(), resolution);
        if let Some(slot) = self.slots.read().expect("slot map poisoned").get(&key) {
            return slot.clone();
        }
        let mut map = self.slots.write().expect("slot map poisoned");
        map.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Offer a tick to every configured resolution; returns the bars this
    /// tick closed (usually none, at most one per resolution).
    pub fn on_tick(&self, tick: &Tick) -> Vec<Bar> {
        let mut closed = Vec::new();
        for &resolution in &self.resolutions {
            let slot = self.slot(&tick.symbol, resolution);
            let mut accum = slot.lock().expect("accumulator poisoned");
            if let Some(bar) = apply(&mut accum, tick, resolution) {
                closed.push(bar);
            }
        }
        closed
    }
}

/// Apply one tick to one accumulator slot, returning a closed bar if the
/// tick ended a period.
fn apply(slot: &mut Option<Accum>, tick: &Tick, resolution: Resolution) -> Option<Bar> {
    match resolution {
        Resolution::Time(secs) => {
            let period = period_start(tick.timestamp, secs);
            match slot {
                None => {
                    *slot = Some(Accum::seed(period, tick));
                    None
                }
                Some(accum) if period == accum.start => {
                    accum.update(tick);
                    None
                }
                Some(accum) if period < accum.start => {
                    // Violates the non-decreasing-timestamp feed contract.
                    warn!(
                        symbol = %tick.symbol,
                        ts = %tick.timestamp,
                        period = %period,
                        open_period = %accum.start,
                        "out-of-order tick dropped"
                    );
                    None
                }
                Some(accum) => {
                    let gap = (period - accum.start).num_seconds() / secs as i64 - 1;
                    if gap > 0 {
                        debug!(
                            symbol = %tick.symbol,
                            resolution = %resolution,
                            missing_periods = gap,
                            "data gap: empty periods produce no bars"
                        );
                    }
                    let bar = slot
                        .replace(Accum::seed(period, tick))
                        .map(|a| a.into_bar(tick.symbol.clone(), resolution));
                    bar
                }
            }
        }
        Resolution::Ticks(n) => {
            close_on_threshold(slot, tick, resolution, |a| a.ticks >= n)
        }
        Resolution::Volume(v) => {
            close_on_threshold(slot, tick, resolution, |a| a.volume >= v as f64)
        }
    }
}

/// Count/volume bars include the threshold-crossing tick in the closing bar;
/// the next tick opens a fresh accumulator.
fn close_on_threshold(
    slot: &mut Option<Accum>,
    tick: &Tick,
    resolution: Resolution,
    done: impl Fn(&Accum) -> bool,
) -> Option<Bar> {
    match slot {
        None => {
            *slot = Some(Accum::seed(tick.timestamp, tick));
        }
        Some(accum) => accum.update(tick),
    }
    if slot.as_ref().map(&done).unwrap_or(false) {
        slot.take().map(|a| a.into_bar(tick.symbol.clone(), resolution))
    } else {
        None
    }
}

fn period_start(ts: DateTime<Utc>, secs: u32) -> DateTime<Utc> {
    let unix = ts.timestamp();
    let floored = unix - unix.rem_euclid(secs as i64);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
}
