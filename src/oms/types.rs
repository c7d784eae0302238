//! Core OMS types
//!
//! Orders, fills, positions, bracket groups and related enumerations.

use crate::types::{Side, Symbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub type OrderId = u64;
pub type GroupId = u64;

static ORDER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static GROUP_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate next order ID (thread-safe, lock-free)
pub fn next_order_id() -> OrderId {
    ORDER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub fn next_group_id() -> GroupId {
    GROUP_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Order submission / lifecycle errors
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("invalid order parameters: quantity must be positive, got {0}")]
    InvalidQuantity(f64),

    #[error("invalid order parameters: {0}")]
    InvalidBracket(String),

    #[error("unknown order id {0}")]
    UnknownOrder(OrderId),

    #[error("order {0} rejected: {1}")]
    Rejected(OrderId, String),

    #[error("order manager is draining; new submissions refused")]
    ShuttingDown,

    #[error("combo/spread orders are not enabled (set enable_combo_orders)")]
    ComboUnsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Execute immediately at market
    Market,
    /// Buy: fills at or below limit; Sell: at or above
    Limit,
    /// Converts to market once the trigger price trades
    Stop,
}

/// Leg of a bracket group (solo orders are plain entries)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRole {
    Entry,
    Target,
    StopLoss,
}

/// Order state machine
///
/// PENDING → WORKING → {FILLED, CANCELLED, EXPIRED, REJECTED}; the four
/// right-hand states are terminal and final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Submitted, not yet broker-acknowledged
    Pending,
    /// Broker-acknowledged and live
    Working,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Expired | OrderState::Rejected
        )
    }
}

/// Core order structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub group_id: GroupId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub role: OrderRole,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    /// Stop trigger; for a trailing stop this ratchets monotonically
    pub trigger_price: Option<f64>,
    pub state: OrderState,
    /// Bracket children start inert and are armed by the parent fill
    pub armed: bool,
    pub parent_id: Option<OrderId>,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn remaining(&self) -> f64 {
        (self.quantity - self.filled_quantity).max(0.0)
    }

    /// Live from the broker's point of view: acknowledged or in flight,
    /// and (for bracket children) armed.
    pub fn is_live(&self) -> bool {
        !self.is_terminal() && (self.role == OrderRole::Entry || self.armed)
    }
}

/// Fill event from the broker side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillReport {
    pub order_id: OrderId,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Net position per symbol: signed quantity plus volume-weighted cost.
/// Mutated only by fill application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    /// Positive long, negative short
    pub quantity: f64,
    pub avg_cost: f64,
    pub realized_pnl: f64,
    pub last_update: DateTime<Utc>,
}

impl Position {
    pub fn flat(symbol: Symbol) -> Self {
        Self {
            symbol,
            quantity: 0.0,
            avg_cost: 0.0,
            realized_pnl: 0.0,
            last_update: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.abs() < 1e-9
    }

    /// Apply one fill. Adding to a position reweights the average cost;
    /// reducing realizes PnL against it; crossing through zero restarts the
    /// cost basis at the fill price.
    pub fn apply_fill(&mut self, side: Side, quantity: f64, price: f64, at: DateTime<Utc>) {
        let signed = side.sign() * quantity;
        let prior = self.quantity;
        let next = prior + signed;

        if prior == 0.0 || prior.signum() == signed.signum() {
            let total = prior.abs() + quantity;
            self.avg_cost = (self.avg_cost * prior.abs() + price * quantity) / total;
        } else {
            let closed = quantity.min(prior.abs());
            self.realized_pnl += (price - self.avg_cost) * closed * prior.signum();
            if prior.signum() != next.signum() && next != 0.0 {
                self.avg_cost = price;
            }
        }

        self.quantity = next;
        if self.is_flat() {
            self.quantity = 0.0;
            self.avg_cost = 0.0;
        }
        self.last_update = at;
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.avg_cost) * self.quantity
    }
}

/// Trailing-stop parameters for a bracket group
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrailSpec {
    /// Favorable move from the entry fill that activates trailing
    pub activate_at: f64,
    /// Distance the stop trigger keeps behind price once active
    pub trail_by: f64,
}

/// Order submission request (builder style)
#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub target: Option<f64>,
    pub initial_stop: Option<f64>,
    pub trail: Option<TrailSpec>,
    pub expires_in: Option<chrono::Duration>,
}

impl OrderTicket {
    pub fn market(symbol: Symbol, side: Side, quantity: f64) -> Self {
        Self {
            symbol,
            side,
            quantity,
            limit_price: None,
            target: None,
            initial_stop: None,
            trail: None,
            expires_in: None,
        }
    }

    pub fn limit(symbol: Symbol, side: Side, quantity: f64, limit_price: f64) -> Self {
        Self {
            limit_price: Some(limit_price),
            ..Self::market(symbol, side, quantity)
        }
    }

    /// Attach profit-target and protective-stop exits (bracket order)
    pub fn with_bracket(mut self, target: f64, initial_stop: f64) -> Self {
        self.target = Some(target);
        self.initial_stop = Some(initial_stop);
        self
    }

    pub fn with_trailing(mut self, activate_at: f64, trail_by: f64) -> Self {
        self.trail = Some(TrailSpec {
            activate_at,
            trail_by,
        });
        self
    }

    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.expires_in = Some(chrono::Duration::seconds(seconds));
        self
    }

    pub fn is_bracket(&self) -> bool {
        self.target.is_some() || self.initial_stop.is_some()
    }
}
