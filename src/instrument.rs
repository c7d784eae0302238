//! Per-symbol strategy facade
//!
//! A stateless view built on demand for each callback: reads come from the
//! rolling store, commands delegate to the order manager. The view carries
//! the current event time so order expiry runs on replay time during
//! backtests rather than wall time.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::oms::{Order, OrderError, OrderId, OrderManager, OrderTicket, Position};
use crate::store::RollingStore;
use crate::types::{
    Bar, OrderBookSnapshot, Quote, Resolution, SignalRecord, Side, Symbol, Tick,
};

/// Read/command handle bound to one symbol and one primary resolution
#[derive(Clone)]
pub struct InstrumentView {
    symbol: Symbol,
    resolution: Resolution,
    now: DateTime<Utc>,
    store: Arc<RollingStore>,
    oms: Arc<OrderManager>,
}

impl InstrumentView {
    pub fn new(
        symbol: Symbol,
        resolution: Resolution,
        store: Arc<RollingStore>,
        oms: Arc<OrderManager>,
    ) -> Self {
        Self {
            symbol,
            resolution,
            now: Utc::now(),
            store,
            oms,
        }
    }

    /// Same view pinned to a specific event time.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Time of the event this view was built for.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn bars(&self, lookback: Option<usize>) -> Vec<Arc<Bar>> {
        self.store.get_bars(&self.symbol, self.resolution, lookback)
    }

    pub fn bars_at(&self, resolution: Resolution, lookback: Option<usize>) -> Vec<Arc<Bar>> {
        self.store.get_bars(&self.symbol, resolution, lookback)
    }

    pub fn ticks(&self, lookback: Option<usize>) -> Vec<Arc<Tick>> {
        self.store.get_ticks(&self.symbol, lookback)
    }

    pub fn quote(&self) -> Option<Arc<Quote>> {
        self.store.get_quote(&self.symbol)
    }

    pub fn orderbook(&self) -> Option<Arc<OrderBookSnapshot>> {
        self.store.get_orderbook(&self.symbol)
    }

    pub fn last_price(&self) -> Option<f64> {
        self.store.last_price(&self.symbol)
    }

    pub fn position(&self) -> Option<Position> {
        self.oms.position(&self.symbol)
    }

    pub fn pending_orders(&self) -> Vec<Order> {
        self.oms.pending_orders(&self.symbol)
    }

    pub fn signals(&self) -> Vec<SignalRecord> {
        self.store.get_signals(&self.symbol)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Submit a fully specified ticket for this symbol.
    pub fn order(&self, mut ticket: OrderTicket) -> Result<OrderId, OrderError> {
        ticket.symbol = self.symbol.clone();
        self.oms.submit(ticket, self.now)
    }

    /// Market buy.
    pub fn buy(&self, quantity: f64) -> Result<OrderId, OrderError> {
        self.order(OrderTicket::market(self.symbol.clone(), Side::Buy, quantity))
    }

    /// Market sell.
    pub fn sell(&self, quantity: f64) -> Result<OrderId, OrderError> {
        self.order(OrderTicket::market(self.symbol.clone(), Side::Sell, quantity))
    }

    /// Close any open position at market; working orders are left alone.
    pub fn exit(&self) -> Result<Option<OrderId>, OrderError> {
        let Some(position) = self.position() else {
            return Ok(None);
        };
        if position.is_flat() {
            return Ok(None);
        }
        let side = if position.quantity > 0.0 {
            Side::Sell
        } else {
            Side::Buy
        };
        self.oms
            .submit(
                OrderTicket::market(self.symbol.clone(), side, position.quantity.abs()),
                self.now,
            )
            .map(Some)
    }

    /// Cancel all working orders for this symbol, then close the position.
    pub fn flatten(&self) -> Result<Option<OrderId>, OrderError> {
        self.oms.flatten(&self.symbol, self.now)
    }

    pub fn modify_order(
        &self,
        order_id: OrderId,
        quantity: Option<f64>,
        price: Option<f64>,
    ) -> Result<(), OrderError> {
        self.oms.modify(order_id, quantity, price)
    }

    /// Append a strategy annotation to this instrument's history.
    pub fn record(&self, name: impl Into<String>, value: serde_json::Value) {
        self.store.push_signal(SignalRecord {
            symbol: self.symbol.clone(),
            timestamp: self.now,
            name: name.into(),
            value,
        });
    }
}
