//! Broker adapter seam
//!
//! The OMS talks to the outside world through `BrokerAdapter` only.
//! Connection lifecycle, auth and retry live behind the adapter; every call
//! is expected to carry its own timeout and return promptly. Order
//! submission is never retried here — a duplicate live order is worse than
//! a missed one.
//!
//! `SimBroker` is the paper adapter used by backtests and tests: it records
//! submitted orders and matches them against ticks with the usual
//! intra-bar rules (buy limit fills at or below limit, sell stop triggers at
//! or below the trigger, market fills at last).

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::oms::types::{FillReport, Order, OrderId, OrderType};
use crate::types::{Side, Tick};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker call timed out after {0}ms")]
    Timeout(u64),

    #[error("broker rejected order: {0}")]
    Rejected(String),

    #[error("broker disconnected")]
    Disconnected,
}

/// Narrow command surface the OMS needs from a broker
pub trait BrokerAdapter: Send + Sync {
    fn submit_order(&self, order: &Order) -> Result<(), BrokerError>;
    fn cancel_order(&self, order_id: OrderId) -> Result<(), BrokerError>;
    fn modify_order(
        &self,
        order_id: OrderId,
        quantity: Option<f64>,
        price: Option<f64>,
    ) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone)]
struct SimOrder {
    order_id: OrderId,
    side: Side,
    order_type: OrderType,
    quantity: f64,
    limit_price: Option<f64>,
    trigger_price: Option<f64>,
    symbol: crate::types::Symbol,
}

/// In-process paper broker with immediate accepts and tick-driven fills
pub struct SimBroker {
    working: Mutex<HashMap<OrderId, SimOrder>>,
    submitted: Mutex<Vec<OrderId>>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self {
            working: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Every order id ever submitted, in submission order (for assertions).
    pub fn submissions(&self) -> Vec<OrderId> {
        self.submitted.lock().expect("sim broker poisoned").clone()
    }

    pub fn working_count(&self) -> usize {
        self.working.lock().expect("sim broker poisoned").len()
    }

    /// Match one tick against all working orders; matched orders leave the
    /// book and produce fill reports for the caller to feed back to the OMS.
    pub fn match_tick(&self, tick: &Tick) -> Vec<FillReport> {
        let mut working = self.working.lock().expect("sim broker poisoned");
        let mut fills = Vec::new();
        let filled_ids: Vec<OrderId> = working
            .values()
            .filter(|o| o.symbol == tick.symbol && fill_price(o, tick.last).is_some())
            .map(|o| o.order_id)
            .collect();
        for id in filled_ids {
            if let Some(order) = working.remove(&id) {
                let price = fill_price(&order, tick.last).unwrap_or(tick.last);
                fills.push(FillReport {
                    order_id: order.order_id,
                    quantity: order.quantity,
                    price,
                    timestamp: tick.timestamp,
                });
            }
        }
        fills
    }
}

fn fill_price(order: &SimOrder, last: f64) -> Option<f64> {
    match (order.side, order.order_type) {
        (_, OrderType::Market) => Some(last),
        (Side::Buy, OrderType::Limit) => {
            let limit = order.limit_price?;
            (last <= limit).then_some(limit)
        }
        (Side::Sell, OrderType::Limit) => {
            let limit = order.limit_price?;
            (last >= limit).then_some(limit)
        }
        (Side::Buy, OrderType::Stop) => {
            let trigger = order.trigger_price?;
            (last >= trigger).then_some(last)
        }
        (Side::Sell, OrderType::Stop) => {
            let trigger = order.trigger_price?;
            (last <= trigger).then_some(last)
        }
    }
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerAdapter for SimBroker {
    fn submit_order(&self, order: &Order) -> Result<(), BrokerError> {
        self.submitted
            .lock()
            .expect("sim broker poisoned")
            .push(order.id);
        self.working.lock().expect("sim broker poisoned").insert(
            order.id,
            SimOrder {
                order_id: order.id,
                side: order.side,
                order_type: order.order_type,
                quantity: order.quantity,
                limit_price: order.limit_price,
                trigger_price: order.trigger_price,
                symbol: order.symbol.clone(),
            },
        );
        Ok(())
    }

    fn cancel_order(&self, order_id: OrderId) -> Result<(), BrokerError> {
        self.working
            .lock()
            .expect("sim broker poisoned")
            .remove(&order_id);
        Ok(())
    }

    fn modify_order(
        &self,
        order_id: OrderId,
        quantity: Option<f64>,
        price: Option<f64>,
    ) -> Result<(), BrokerError> {
        let mut working = self.working.lock().expect("sim broker poisoned");
        let order = working
            .get_mut(&order_id)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown order {}", order_id)))?;
        if let Some(q) = quantity {
            order.quantity = q;
        }
        if let Some(p) = price {
            match order.order_type {
                OrderType::Stop => order.trigger_price = Some(p),
                _ => order.limit_price = Some(p),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::types::{next_group_id, next_order_id, OrderRole, OrderState};
    use crate::types::Symbol;
    use chrono::Utc;

    fn order(side: Side, order_type: OrderType, limit: Option<f64>, trigger: Option<f64>) -> Order {
        Order {
            id: next_order_id(),
            group_id: next_group_id(),
            symbol: Symbol::new("ESU25"),
            side,
            order_type,
            role: OrderRole::Entry,
            quantity: 1.0,
            limit_price: limit,
            trigger_price: trigger,
            state: OrderState::Pending,
            armed: true,
            parent_id: None,
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expires_at: None,
        }
    }

    fn tick(price: f64) -> Tick {
        Tick {
            symbol: Symbol::new("ESU25"),
            timestamp: Utc::now(),
            last: price,
            last_size: 1.0,
            bid: price - 0.25,
            bid_size: 1.0,
            ask: price + 0.25,
            ask_size: 1.0,
        }
    }

    #[test]
    fn test_buy_limit_fills_at_or_below_limit() {
        let broker = SimBroker::new();
        let o = order(Side::Buy, OrderType::Limit, Some(100.0), None);
        broker.submit_order(&o).unwrap();

        assert!(broker.match_tick(&tick(100.5)).is_empty());
        let fills = broker.match_tick(&tick(99.5));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 100.0);
        assert_eq!(broker.working_count(), 0);
    }

    #[test]
    fn test_sell_stop_triggers_at_or_below() {
        let broker = SimBroker::new();
        let o = order(Side::Sell, OrderType::Stop, None, Some(99.5));
        broker.submit_order(&o).unwrap();

        assert!(broker.match_tick(&tick(100.0)).is_empty());
        let fills = broker.match_tick(&tick(99.0));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 99.0);
    }

    #[test]
    fn test_cancel_removes_from_book() {
        let broker = SimBroker::new();
        let o = order(Side::Buy, OrderType::Market, None, None);
        broker.submit_order(&o).unwrap();
        broker.cancel_order(o.id).unwrap();
        assert!(broker.match_tick(&tick(100.0)).is_empty());
    }

    #[test]
    fn test_modify_moves_stop_trigger() {
        let broker = SimBroker::new();
        let o = order(Side::Sell, OrderType::Stop, None, Some(95.0));
        broker.submit_order(&o).unwrap();
        broker.modify_order(o.id, None, Some(98.0)).unwrap();

        let fills = broker.match_tick(&tick(97.0));
        assert_eq!(fills.len(), 1);
    }
}
