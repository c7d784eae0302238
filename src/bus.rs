//! Event bus: one producer side, N independent subscribers
//!
//! Built on `tokio::sync::broadcast`: a bounded ring with one cursor per
//! subscriber. Every subscriber sees every message of the kinds it asked
//! for, in send order per producer. Delivery is at-most-once — a subscriber
//! that falls more than `capacity` messages behind loses the *oldest*
//! messages rather than blocking the producer (liveness over completeness);
//! each drop is logged with the lag count. Late subscribers get no replay.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::oms::FillReport;
use crate::types::{Bar, OrderBookSnapshot, Quote, Tick};

/// Message categories a subscriber can opt into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Tick,
    Bar,
    Quote,
    OrderBook,
    Fill,
    Heartbeat,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Tick,
        EventKind::Bar,
        EventKind::Quote,
        EventKind::OrderBook,
        EventKind::Fill,
        EventKind::Heartbeat,
    ];

    fn bit(self) -> u8 {
        match self {
            EventKind::Tick => 1 << 0,
            EventKind::Bar => 1 << 1,
            EventKind::Quote => 1 << 2,
            EventKind::OrderBook => 1 << 3,
            EventKind::Fill => 1 << 4,
            EventKind::Heartbeat => 1 << 5,
        }
    }
}

/// A market event on the bus; payloads are Arc-shared, cloning is cheap.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Tick(Arc<Tick>),
    Bar(Arc<Bar>),
    Quote(Arc<Quote>),
    OrderBook(Arc<OrderBookSnapshot>),
    Fill(Arc<FillReport>),
    Heartbeat(DateTime<Utc>),
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BusEvent::Tick(_) => EventKind::Tick,
            BusEvent::Bar(_) => EventKind::Bar,
            BusEvent::Quote(_) => EventKind::Quote,
            BusEvent::OrderBook(_) => EventKind::OrderBook,
            BusEvent::Fill(_) => EventKind::Fill,
            BusEvent::Heartbeat(_) => EventKind::Heartbeat,
        }
    }
}

/// Broadcast hub for market events
#[derive(Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<BusEvent>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers. Never blocks; returns the number
    /// of subscribers the event was offered to.
    pub fn publish(&self, event: BusEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                // no subscribers connected; fine during startup/shutdown
                trace!("bus publish with no subscribers");
                0
            }
        }
    }

    /// Subscribe to a set of event kinds. Messages published before this
    /// call are not replayed.
    pub fn subscribe(&self, kinds: &[EventKind]) -> BusSubscriber {
        let mask = kinds.iter().fold(0u8, |m, k| m | k.bit());
        BusSubscriber {
            rx: self.tx.subscribe(),
            mask,
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One consumer's view of the bus, filtered by kind
pub struct BusSubscriber {
    rx: broadcast::Receiver<BusEvent>,
    mask: u8,
    dropped: u64,
}

impl BusSubscriber {
    /// Next subscribed event in send order, or `None` once the bus is closed
    /// and drained.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if ev.kind().bit() & self.mask != 0 => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(
                        lagged = n,
                        total_dropped = self.dropped,
                        "slow subscriber: oldest queued events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant; `None` means nothing pending right now.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) if ev.kind().bit() & self.mask != 0 => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(
                        lagged = n,
                        total_dropped = self.dropped,
                        "slow subscriber: oldest queued events dropped"
                    );
                }
                Err(_) => return None,
            }
        }
    }

    /// Messages lost to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Symbol;

    fn tick_event(price: f64) -> BusEvent {
        BusEvent::Tick(Arc::new(Tick {
            symbol: Symbol::new("ESU25"),
            timestamp: Utc::now(),
            last: price,
            last_size: 1.0,
            bid: price - 0.25,
            bid_size: 1.0,
            ask: price + 0.25,
            ask_size: 1.0,
        }))
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_message() {
        let bus = MessageBus::new(64);
        let mut a = bus.subscribe(&[EventKind::Tick]);
        let mut b = bus.subscribe(&[EventKind::Tick]);

        for i in 0..5 {
            bus.publish(tick_event(100.0 + i as f64));
        }
        for sub in [&mut a, &mut b] {
            for i in 0..5 {
                match sub.recv().await.unwrap() {
                    BusEvent::Tick(t) => assert_eq!(t.last, 100.0 + i as f64),
                    other => panic!("unexpected event {:?}", other.kind()),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_kind_filtering() {
        let bus = MessageBus::new(64);
        let mut hb_only = bus.subscribe(&[EventKind::Heartbeat]);

        bus.publish(tick_event(100.0));
        bus.publish(BusEvent::Heartbeat(Utc::now()));
        drop(bus);

        match hb_only.recv().await.unwrap() {
            BusEvent::Heartbeat(_) => {}
            other => panic!("unexpected event {:?}", other.kind()),
        }
        assert!(hb_only.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_without_blocking_producer() {
        let bus = MessageBus::new(4);
        let mut slow = bus.subscribe(&[EventKind::Tick]);

        // overflow the ring: publishing never blocks
        for i in 0..20 {
            bus.publish(tick_event(i as f64));
        }

        // the survivor set is the newest messages; oldest were dropped
        let first = slow.recv().await.unwrap();
        match first {
            BusEvent::Tick(t) => assert!(t.last >= 16.0),
            other => panic!("unexpected event {:?}", other.kind()),
        }
        assert!(slow.dropped() > 0);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_prior_messages() {
        let bus = MessageBus::new(64);
        bus.publish(tick_event(1.0));

        let mut late = bus.subscribe(&[EventKind::Tick]);
        bus.publish(tick_event(2.0));
        drop(bus);

        match late.recv().await.unwrap() {
            BusEvent::Tick(t) => assert_eq!(t.last, 2.0),
            other => panic!("unexpected event {:?}", other.kind()),
        }
        assert!(late.recv().await.is_none());
    }
}
