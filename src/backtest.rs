//! Backtest driver
//!
//! Replays time-ordered ticks through the same aggregator, bus and OMS path
//! the live loop uses. Fills come from `SimBroker`; the expiry clock and
//! heartbeats run on record timestamps, not wall time, so a year of history
//! replays in seconds with the same order lifecycle a live session would see.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::bus::BusEvent;
use crate::context::EngineContext;
use crate::datastore::HistoryStore;
use crate::oms::SimBroker;
use crate::types::Tick;

/// Replay speed
#[derive(Debug, Clone, Copy)]
pub enum ReplayPace {
    /// As fast as the pipeline drains.
    FullSpeed,
    /// Fixed delay between records, for watching a replay live.
    Fixed(Duration),
}

/// Cooperative cancellation for a running replay. Cloneable; any holder can
/// stop the driver at the next record boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What a replay got through before finishing or being cancelled
#[derive(Debug, Clone, Default)]
pub struct BacktestReport {
    pub records_total: usize,
    pub records_replayed: usize,
    pub bars_emitted: usize,
    pub fills_generated: usize,
    pub cancelled: bool,
}

pub struct Backtest {
    ctx: EngineContext,
    broker: Arc<SimBroker>,
    pace: ReplayPace,
    history: Option<Arc<HistoryStore>>,
    cancel: CancelHandle,
}

impl Backtest {
    pub fn new(ctx: EngineContext, broker: Arc<SimBroker>) -> Self {
        Self {
            ctx,
            broker,
            pace: ReplayPace::FullSpeed,
            history: None,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_pace(mut self, pace: ReplayPace) -> Self {
        self.pace = pace;
        self
    }

    /// Record replayed ticks and emitted bars to a history store.
    pub fn with_history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Handle for stopping this replay from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Replay the records in order. On cancellation the driver stops issuing
    /// records and returns a partial report; already-published events keep
    /// draining through the runtime.
    pub async fn run(self, ticks: Vec<Tick>) -> Result<BacktestReport> {
        let mut report = BacktestReport {
            records_total: ticks.len(),
            ..BacktestReport::default()
        };
        let mut last_heartbeat: Option<DateTime<Utc>> = None;

        info!(records = report.records_total, "replay starting");

        for tick in ticks {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                debug!(replayed = report.records_replayed, "replay cancelled");
                break;
            }

            let tick = Arc::new(tick);
            if let Some(history) = &self.history {
                history.push_tick(&tick)?;
            }
            self.ctx.bus.publish(BusEvent::Tick(tick.clone()));

            for bar in self.ctx.aggregator.on_tick(&tick) {
                if let Some(history) = &self.history {
                    history.push_bar(&bar)?;
                }
                report.bars_emitted += 1;
                self.ctx.bus.publish(BusEvent::Bar(Arc::new(bar)));
            }

            for fill in self.broker.match_tick(&tick) {
                report.fills_generated += 1;
                self.ctx.bus.publish(BusEvent::Fill(Arc::new(fill)));
            }

            // one heartbeat per replay-second drives expiry sweeps even when
            // an instrument goes quiet
            let due = last_heartbeat
                .map_or(true, |hb| tick.timestamp - hb >= chrono::Duration::seconds(1));
            if due {
                self.ctx.bus.publish(BusEvent::Heartbeat(tick.timestamp));
                last_heartbeat = Some(tick.timestamp);
            }

            report.records_replayed += 1;
            match self.pace {
                ReplayPace::FullSpeed => tokio::task::yield_now().await,
                ReplayPace::Fixed(delay) => tokio::time::sleep(delay).await,
            }
        }

        info!(
            replayed = report.records_replayed,
            bars = report.bars_emitted,
            fills = report.fills_generated,
            cancelled = report.cancelled,
            "replay finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, InstrumentConfig};
    use crate::types::{Resolution, Symbol};
    use chrono::TimeZone;

    fn ctx() -> EngineContext {
        let config = Config {
            instruments: vec![InstrumentConfig {
                symbol: "ESU25".into(),
                tick_window: 1000,
                bar_window: 100,
            }],
            resolutions: vec![Resolution::Time(60)],
            ..Config::default()
        };
        EngineContext::build(config, Arc::new(SimBroker::new())).unwrap()
    }

    fn ticks(count: i64) -> Vec<Tick> {
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap();
        (0..count)
            .map(|i| Tick {
                symbol: Symbol::new("ESU25"),
                timestamp: start + chrono::Duration::seconds(i),
                last: 100.0 + (i % 7) as f64 * 0.25,
                last_size: 1.0,
                bid: 99.75,
                bid_size: 10.0,
                ask: 100.25,
                ask_size: 10.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_replay_emits_bars() {
        let ctx = ctx();
        let broker = Arc::new(SimBroker::new());
        let report = Backtest::new(ctx, broker).run(ticks(120)).await.unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.records_replayed, 120);
        // 120 one-second ticks at 1m resolution: the 14:31 boundary closes
        // one bar, the second period is still open
        assert_eq!(report.bars_emitted, 1);
    }

    #[tokio::test]
    async fn test_cancellation_reports_partial_completion() {
        let ctx = ctx();
        let broker = Arc::new(SimBroker::new());
        let backtest =
            Backtest::new(ctx, broker).with_pace(ReplayPace::Fixed(Duration::from_millis(2)));
        let handle = backtest.cancel_handle();

        let task = tokio::spawn(backtest.run(ticks(10_000)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let report = task.await.unwrap().unwrap();
        assert!(report.cancelled);
        assert!(report.records_replayed > 0);
        assert!(report.records_replayed < report.records_total);
    }

    #[tokio::test]
    async fn test_history_recording() {
        let ctx = ctx();
        let broker = Arc::new(SimBroker::new());
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());

        let report = Backtest::new(ctx, broker)
            .with_history(history.clone())
            .run(ticks(65))
            .await
            .unwrap();
        assert_eq!(report.bars_emitted, 1);

        let stored = history.load_ticks(&Symbol::new("ESU25"), 1000).unwrap();
        assert_eq!(stored.len(), 65);
        let bars = history
            .load_bars(&Symbol::new("ESU25"), Resolution::Time(60), 10)
            .unwrap();
        assert_eq!(bars.len(), 1);
    }
}
