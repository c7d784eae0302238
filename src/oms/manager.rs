//! Order manager: bracket/OCO state machine
//!
//! Mutations are atomic per bracket group: every group sits behind its own
//! mutex, and cross-group operations (sweep, cancel-all) lock one group at a
//! time. Solo orders are single-member groups. Positions live behind a
//! separate lock, only ever taken while a group lock is held — never the
//! other way round.
//!
//! Anomalies never propagate: a fill for an unknown or already-terminal
//! order is logged and dropped without touching any other order or position.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::oms::broker::BrokerAdapter;
use crate::oms::types::{
    next_group_id, next_order_id, FillReport, GroupId, Order, OrderError, OrderId, OrderRole,
    OrderState, OrderTicket, OrderType, Position, TrailSpec,
};
use crate::types::{Side, Symbol};

const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct TrailState {
    spec: TrailSpec,
    active: bool,
}

#[derive(Debug)]
struct BracketGroup {
    id: GroupId,
    symbol: Symbol,
    /// Entry first; target and stop children follow for brackets
    orders: Vec<Order>,
    trail: Option<TrailState>,
    entry_fill_price: Option<f64>,
}

impl BracketGroup {
    fn entry(&self) -> &Order {
        &self.orders[0]
    }

    fn order_mut(&mut self, id: OrderId) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| o.id == id)
    }
}

/// Order lifecycle manager wired to one broker adapter
///
/// Group and id indices retain terminal groups for the life of the session
/// so late queries and duplicate-fill detection keep working; sized for a
/// single trading session, not unbounded uptime.
pub struct OrderManager {
    broker: Arc<dyn BrokerAdapter>,
    groups: RwLock<HashMap<GroupId, Arc<Mutex<BracketGroup>>>>,
    order_index: RwLock<HashMap<OrderId, GroupId>>,
    symbol_index: RwLock<HashMap<Symbol, Vec<GroupId>>>,
    positions: Mutex<HashMap<Symbol, Position>>,
    accepting: AtomicBool,
    default_expiry: Duration,
    combo_enabled: bool,
}

impl OrderManager {
    pub fn new(broker: Arc<dyn BrokerAdapter>, default_expiry_secs: u64, combo_enabled: bool) -> Self {
        Self {
            broker,
            groups: RwLock::new(HashMap::new()),
            order_index: RwLock::new(HashMap::new()),
            symbol_index: RwLock::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            default_expiry: Duration::seconds(default_expiry_secs as i64),
            combo_enabled,
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit an order (bracketed or plain) with `now` as the submission
    /// clock — wall time live, replay time in backtests.
    pub fn submit(&self, ticket: OrderTicket, now: DateTime<Utc>) -> Result<OrderId, OrderError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(OrderError::ShuttingDown);
        }
        validate_ticket(&ticket)?;

        let group_id = next_group_id();
        let expires_at = Some(now + ticket.expires_in.unwrap_or(self.default_expiry));
        let entry_type = if ticket.limit_price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };

        let entry = Order {
            id: next_order_id(),
            group_id,
            symbol: ticket.symbol.clone(),
            side: ticket.side,
            order_type: entry_type,
            role: OrderRole::Entry,
            quantity: ticket.quantity,
            limit_price: ticket.limit_price,
            trigger_price: None,
            state: OrderState::Pending,
            armed: true,
            parent_id: None,
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
            created_at: now,
            updated_at: now,
            expires_at,
        };
        let entry_id = entry.id;

        let mut orders = vec![entry];
        if ticket.is_bracket() {
            let exit_side = ticket.side.opposite();
            let target = ticket.target.expect("validated");
            let stop = ticket.initial_stop.expect("validated");
            // children are created inert; the entry fill arms them
            orders.push(Order {
                id: next_order_id(),
                group_id,
                symbol: ticket.symbol.clone(),
                side: exit_side,
                order_type: OrderType::Limit,
                role: OrderRole::Target,
                quantity: ticket.quantity,
                limit_price: Some(target),
                trigger_price: None,
                state: OrderState::Pending,
                armed: false,
                parent_id: Some(entry_id),
                filled_quantity: 0.0,
                avg_fill_price: 0.0,
                created_at: now,
                updated_at: now,
                expires_at: None,
            });
            orders.push(Order {
                id: next_order_id(),
                group_id,
                symbol: ticket.symbol.clone(),
                side: exit_side,
                order_type: OrderType::Stop,
                role: OrderRole::StopLoss,
                quantity: ticket.quantity,
                limit_price: None,
                trigger_price: Some(stop),
                state: OrderState::Pending,
                armed: false,
                parent_id: Some(entry_id),
                filled_quantity: 0.0,
                avg_fill_price: 0.0,
                created_at: now,
                updated_at: now,
                expires_at: None,
            });
        }

        let group = BracketGroup {
            id: group_id,
            symbol: ticket.symbol.clone(),
            trail: ticket.trail.map(|spec| TrailState { spec, active: false }),
            entry_fill_price: None,
            orders,
        };

        // submit only the entry; children stay local until armed
        if let Err(err) = self.broker.submit_order(group.entry()) {
            warn!(order_id = entry_id, %err, "broker rejected submission");
            return Err(OrderError::Rejected(entry_id, err.to_string()));
        }

        {
            let mut index = self.order_index.write().expect("order index poisoned");
            for order in &group.orders {
                index.insert(order.id, group_id);
            }
        }
        self.symbol_index
            .write()
            .expect("symbol index poisoned")
            .entry(ticket.symbol.clone())
            .or_default()
            .push(group_id);
        self.groups
            .write()
            .expect("group map poisoned")
            .insert(group_id, Arc::new(Mutex::new(group)));

        info!(
            order_id = entry_id,
            group_id,
            symbol = %ticket.symbol,
            side = ?ticket.side,
            quantity = ticket.quantity,
            bracket = ticket.is_bracket(),
            "order submitted"
        );
        Ok(entry_id)
    }

    /// Native combo/spread submission — capability-gated, off by default.
    pub fn submit_combo(&self, _legs: Vec<OrderTicket>) -> Result<GroupId, OrderError> {
        // Gated even when enabled: no broker contract for native combos yet.
        Err(OrderError::ComboUnsupported)
    }

    pub fn combo_enabled(&self) -> bool {
        self.combo_enabled
    }

    // =========================================================================
    // Broker callbacks
    // =========================================================================

    /// Broker acknowledgement: PENDING → WORKING.
    pub fn on_ack(&self, order_id: OrderId) {
        let Some(group) = self.group_of(order_id) else {
            warn!(order_id, "ack for unknown order dropped");
            return;
        };
        let mut group = group.lock().expect("group poisoned");
        if let Some(order) = group.order_mut(order_id) {
            if order.state == OrderState::Pending {
                order.state = OrderState::Working;
                order.updated_at = Utc::now();
                debug!(order_id, "order acknowledged");
            }
        }
    }

    /// Broker rejection: terminal, surfaced to the strategy, never retried.
    pub fn on_reject(&self, order_id: OrderId, reason: &str) {
        let Some(group) = self.group_of(order_id) else {
            warn!(order_id, reason, "reject for unknown order dropped");
            return;
        };
        let mut group = group.lock().expect("group poisoned");
        let is_entry = group.entry().id == order_id;
        if let Some(order) = group.order_mut(order_id) {
            if !order.is_terminal() {
                order.state = OrderState::Rejected;
                order.updated_at = Utc::now();
                warn!(order_id, reason, "order rejected");
            }
        }
        if is_entry {
            self.teardown_children(&mut group);
        }
    }

    /// Reconcile a fill. Duplicate fills (terminal order) and fills for
    /// unknown ids are logged and ignored. Returns the updated order so the
    /// caller can dispatch strategy callbacks.
    pub fn on_fill(&self, report: &FillReport) -> Option<Order> {
        let Some(group) = self.group_of(report.order_id) else {
            warn!(order_id = report.order_id, "fill for unknown order dropped");
            return None;
        };
        let mut group = group.lock().expect("group poisoned");

        let (side, symbol, role, qty, now_filled) = {
            let Some(order) = group.order_mut(report.order_id) else {
                warn!(order_id = report.order_id, "fill for unknown order dropped");
                return None;
            };
            if order.is_terminal() {
                warn!(
                    order_id = report.order_id,
                    state = ?order.state,
                    "duplicate fill dropped"
                );
                return None;
            }
            let remaining = order.remaining();
            let qty = report.quantity.min(remaining);
            if report.quantity > remaining + QTY_EPSILON {
                warn!(
                    order_id = report.order_id,
                    reported = report.quantity,
                    remaining,
                    "overfill clipped to order remainder"
                );
            }
            let prior_value = order.avg_fill_price * order.filled_quantity;
            order.filled_quantity += qty;
            order.avg_fill_price = (prior_value + report.price * qty) / order.filled_quantity;
            order.updated_at = report.timestamp;
            let now_filled = order.remaining() <= QTY_EPSILON;
            if now_filled {
                order.state = OrderState::Filled;
            } else if order.state == OrderState::Pending {
                // a fill implies the broker has the order
                order.state = OrderState::Working;
            }
            (order.side, order.symbol.clone(), order.role, qty, now_filled)
        };

        // position updates are atomic per fill, and only ever for the
        // quantity the order book records
        {
            let mut positions = self.positions.lock().expect("positions poisoned");
            positions
                .entry(symbol.clone())
                .or_insert_with(|| Position::flat(symbol.clone()))
                .apply_fill(side, qty, report.price, report.timestamp);
        }

        if now_filled {
            match role {
                OrderRole::Entry => {
                    group.entry_fill_price = Some(report.price);
                    self.arm_children(&mut group);
                }
                OrderRole::Target | OrderRole::StopLoss => {
                    self.cancel_sibling(&mut group, report.order_id);
                }
            }
        }

        info!(
            order_id = report.order_id,
            quantity = qty,
            price = report.price,
            role = ?role,
            "fill applied"
        );
        group.order_mut(report.order_id).cloned()
    }

    /// Arm the exit children to cover the entry's filled quantity. Called on
    /// the completing entry fill, and when a partially filled entry dies
    /// with an open portion that still needs its exits.
    fn arm_children(&self, group: &mut BracketGroup) {
        let cover = group.entry().filled_quantity;
        if cover <= QTY_EPSILON {
            return;
        }
        if group.entry_fill_price.is_none() {
            group.entry_fill_price = Some(group.entry().avg_fill_price);
        }
        let mut to_submit = Vec::new();
        for order in group.orders.iter_mut().skip(1) {
            if order.is_terminal() || order.armed {
                continue;
            }
            order.quantity = cover;
            order.armed = true;
            order.updated_at = Utc::now();
            to_submit.push(order.clone());
        }
        for order in to_submit {
            if let Err(err) = self.broker.submit_order(&order) {
                warn!(order_id = order.id, %err, "failed to arm bracket child");
                if let Some(o) = group.order_mut(order.id) {
                    o.state = OrderState::Rejected;
                }
            } else {
                debug!(order_id = order.id, role = ?order.role, "bracket child armed");
            }
        }
    }

    /// OCO: a filled child cancels its sibling in the same processing step.
    fn cancel_sibling(&self, group: &mut BracketGroup, filled_id: OrderId) {
        let sibling_ids: Vec<OrderId> = group
            .orders
            .iter()
            .skip(1)
            .filter(|o| o.id != filled_id && !o.is_terminal())
            .map(|o| o.id)
            .collect();
        for id in sibling_ids {
            if let Err(err) = self.broker.cancel_order(id) {
                warn!(order_id = id, %err, "sibling cancel failed at broker");
            }
            if let Some(o) = group.order_mut(id) {
                o.state = OrderState::Cancelled;
                o.updated_at = Utc::now();
                debug!(order_id = id, "sibling cancelled (OCO)");
            }
        }
    }

    /// Cancel still-inert children after their entry died unfilled.
    fn teardown_children(&self, group: &mut BracketGroup) {
        for order in group.orders.iter_mut().skip(1) {
            if !order.is_terminal() {
                if order.armed {
                    let _ = self.broker.cancel_order(order.id);
                }
                order.state = OrderState::Cancelled;
                order.updated_at = Utc::now();
            }
        }
    }

    // =========================================================================
    // Cancels / modify / expiry
    // =========================================================================

    pub fn cancel(&self, order_id: OrderId) -> Result<(), OrderError> {
        let group = self
            .group_of(order_id)
            .ok_or(OrderError::UnknownOrder(order_id))?;
        let mut group = group.lock().expect("group poisoned");
        let is_entry = group.entry().id == order_id;
        let entry_filled = group.entry().filled_quantity;
        {
            let order = group
                .order_mut(order_id)
                .ok_or(OrderError::UnknownOrder(order_id))?;
            if order.is_terminal() {
                return Ok(());
            }
            if order.armed {
                if let Err(err) = self.broker.cancel_order(order_id) {
                    warn!(order_id, %err, "broker cancel failed");
                }
            }
            order.state = OrderState::Cancelled;
            order.updated_at = Utc::now();
        }
        if is_entry {
            if entry_filled <= QTY_EPSILON {
                self.teardown_children(&mut group);
            } else {
                // partial fill: the open portion keeps a bracket sized to it
                self.arm_children(&mut group);
            }
        }
        info!(order_id, "order cancelled");
        Ok(())
    }

    /// Cancel every non-terminal order in a bracket group.
    pub fn cancel_group(&self, group_id: GroupId) -> Result<(), OrderError> {
        let group = {
            let groups = self.groups.read().expect("group map poisoned");
            groups.get(&group_id).cloned()
        };
        let Some(group) = group else {
            return Err(OrderError::UnknownOrder(group_id));
        };
        let mut group = group.lock().expect("group poisoned");
        for order in group.orders.iter_mut() {
            if order.is_terminal() {
                continue;
            }
            if order.armed {
                if let Err(err) = self.broker.cancel_order(order.id) {
                    warn!(order_id = order.id, %err, "broker cancel failed");
                }
            }
            order.state = OrderState::Cancelled;
            order.updated_at = Utc::now();
        }
        info!(group_id, "bracket group cancelled");
        Ok(())
    }

    pub fn cancel_all(&self) {
        let group_ids: Vec<GroupId> = self
            .groups
            .read()
            .expect("group map poisoned")
            .keys()
            .copied()
            .collect();
        for id in group_ids {
            let _ = self.cancel_group(id);
        }
    }

    pub fn modify(
        &self,
        order_id: OrderId,
        quantity: Option<f64>,
        price: Option<f64>,
    ) -> Result<(), OrderError> {
        if let Some(q) = quantity {
            if q <= 0.0 || !q.is_finite() {
                return Err(OrderError::InvalidQuantity(q));
            }
        }
        let group = self
            .group_of(order_id)
            .ok_or(OrderError::UnknownOrder(order_id))?;
        let mut group = group.lock().expect("group poisoned");
        let order = group
            .order_mut(order_id)
            .ok_or(OrderError::UnknownOrder(order_id))?;
        if order.is_terminal() {
            return Err(OrderError::Rejected(order_id, "order is terminal".into()));
        }
        if let Some(q) = quantity {
            order.quantity = q;
        }
        if let Some(p) = price {
            match order.order_type {
                OrderType::Stop => order.trigger_price = Some(p),
                _ => order.limit_price = Some(p),
            }
        }
        order.updated_at = Utc::now();
        if order.armed {
            if let Err(err) = self.broker.modify_order(order_id, quantity, price) {
                warn!(order_id, %err, "broker modify failed");
            }
        }
        Ok(())
    }

    /// Expire entries past their deadline. An entry that never filled tears
    /// down its inert children; a partially filled one has its remainder
    /// cancelled and its exits armed for the filled portion. Returns
    /// expired ids.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<OrderId> {
        let groups: Vec<Arc<Mutex<BracketGroup>>> = self
            .groups
            .read()
            .expect("group map poisoned")
            .values()
            .cloned()
            .collect();
        let mut expired = Vec::new();
        for group in groups {
            let mut group = group.lock().expect("group poisoned");
            let entry = group.entry();
            let due = matches!(entry.state, OrderState::Pending | OrderState::Working)
                && entry.expires_at.map(|t| t < now).unwrap_or(false);
            if !due {
                continue;
            }
            let entry_id = entry.id;
            let partial = entry.filled_quantity > QTY_EPSILON;
            if let Err(err) = self.broker.cancel_order(entry_id) {
                warn!(order_id = entry_id, %err, "broker cancel on expiry failed");
            }
            if let Some(order) = group.order_mut(entry_id) {
                order.state = OrderState::Expired;
                order.updated_at = now;
            }
            if partial {
                self.arm_children(&mut group);
            } else {
                self.teardown_children(&mut group);
            }
            info!(order_id = entry_id, partial, "order expired");
            expired.push(entry_id);
        }
        expired
    }

    // =========================================================================
    // Trailing stops
    // =========================================================================

    /// Ratchet trailing stops for `symbol` against a new price. The trigger
    /// only ever moves in the position's favor.
    pub fn on_price(&self, symbol: &Symbol, price: f64) {
        let groups = self.groups_for(symbol);
        for group in groups {
            let mut group = group.lock().expect("group poisoned");
            let Some(entry_fill) = group.entry_fill_price else {
                continue;
            };
            let entry_side = group.entry().side;
            let Some(trail) = group.trail.as_mut() else {
                continue;
            };

            let favorable_move = match entry_side {
                Side::Buy => price - entry_fill,
                Side::Sell => entry_fill - price,
            };
            if !trail.active && favorable_move >= trail.spec.activate_at {
                trail.active = true;
                debug!(group_id = group.id, price, "trailing stop activated");
            }
            if !group.trail.as_ref().map(|t| t.active).unwrap_or(false) {
                continue;
            }
            let trail_by = group.trail.as_ref().expect("checked above").spec.trail_by;

            let stop_id = group
                .orders
                .iter()
                .find(|o| o.role == OrderRole::StopLoss && o.armed && !o.is_terminal())
                .map(|o| o.id);
            let Some(stop_id) = stop_id else { continue };
            let Some(stop) = group.order_mut(stop_id) else {
                continue;
            };
            let current = stop.trigger_price.unwrap_or(f64::NEG_INFINITY);
            let candidate = match entry_side {
                Side::Buy => price - trail_by,
                Side::Sell => price + trail_by,
            };
            let improved = match entry_side {
                Side::Buy => candidate > current,
                Side::Sell => stop.trigger_price.map(|c| candidate < c).unwrap_or(true),
            };
            if improved {
                stop.trigger_price = Some(candidate);
                stop.updated_at = Utc::now();
                if let Err(err) = self.broker.modify_order(stop_id, None, Some(candidate)) {
                    warn!(order_id = stop_id, %err, "trailing stop modify failed");
                }
                debug!(order_id = stop_id, trigger = candidate, "trailing stop ratcheted");
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        let group = self.group_of(order_id)?;
        let group = group.lock().expect("group poisoned");
        group.orders.iter().find(|o| o.id == order_id).cloned()
    }

    /// Submitted-but-unfilled orders for a symbol (inert children excluded).
    pub fn pending_orders(&self, symbol: &Symbol) -> Vec<Order> {
        let mut pending = Vec::new();
        for group in self.groups_for(symbol) {
            let group = group.lock().expect("group poisoned");
            for order in &group.orders {
                if !order.is_terminal() && order.armed && order.state != OrderState::Filled {
                    pending.push(order.clone());
                }
            }
        }
        pending
    }

    pub fn position(&self, symbol: &Symbol) -> Option<Position> {
        self.positions
            .lock()
            .expect("positions poisoned")
            .get(symbol)
            .cloned()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions
            .lock()
            .expect("positions poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Market-flatten a symbol: cancel its working orders, then send a
    /// closing market order for any open position.
    pub fn flatten(&self, symbol: &Symbol, now: DateTime<Utc>) -> Result<Option<OrderId>, OrderError> {
        for group in self.groups_for(symbol) {
            let id = group.lock().expect("group poisoned").id;
            let _ = self.cancel_group(id);
        }
        let Some(position) = self.position(symbol) else {
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
        let ticket = OrderTicket::market(symbol.clone(), side, position.quantity.abs());
        self.submit(ticket, now).map(Some)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop accepting new submissions (first phase of the drain).
    pub fn begin_drain(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("order manager draining; submissions refused");
    }

    /// True once every order has reached a terminal state.
    pub fn is_drained(&self) -> bool {
        let groups = self.groups.read().expect("group map poisoned");
        groups.values().all(|g| {
            g.lock()
                .expect("group poisoned")
                .orders
                .iter()
                .all(|o| o.is_terminal() || !o.armed)
        })
    }

    /// Full drain: refuse submissions and cancel everything still live.
    pub fn shutdown(&self) {
        self.begin_drain();
        self.cancel_all();
    }

    fn group_of(&self, order_id: OrderId) -> Option<Arc<Mutex<BracketGroup>>> {
        let group_id = *self
            .order_index
            .read()
            .expect("order index poisoned")
            .get(&order_id)?;
        self.groups
            .read()
            .expect("group map poisoned")
            .get(&group_id)
            .cloned()
    }

    fn groups_for(&self, symbol: &Symbol) -> Vec<Arc<Mutex<BracketGroup>>> {
        let ids = self
            .symbol_index
            .read()
            .expect("symbol index poisoned")
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        let groups = self.groups.read().expect("group map poisoned");
        ids.iter().filter_map(|id| groups.get(id).cloned()).collect()
    }
}

fn validate_ticket(ticket: &OrderTicket) -> Result<(), OrderError> {
    if ticket.quantity <= 0.0 || !ticket.quantity.is_finite() {
        return Err(OrderError::InvalidQuantity(ticket.quantity));
    }
    if !ticket.is_bracket() {
        if ticket.trail.is_some() {
            return Err(OrderError::InvalidBracket(
                "trailing stop requires a bracket with an initial stop".into(),
            ));
        }
        return Ok(());
    }
    let (Some(target), Some(stop)) = (ticket.target, ticket.initial_stop) else {
        return Err(OrderError::InvalidBracket(
            "bracket orders need both target and initial_stop".into(),
        ));
    };
    let ok = match ticket.side {
        Side::Buy => {
            target > stop
                && ticket
                    .limit_price
                    .map(|l| target >= l && stop <= l)
                    .unwrap_or(true)
        }
        Side::Sell => {
            target < stop
                && ticket
                    .limit_price
                    .map(|l| target <= l && stop >= l)
                    .unwrap_or(true)
        }
    };
    if !ok {
        return Err(OrderError::InvalidBracket(format!(
            "target/stop direction inconsistent with {:?}: target={}, stop={}",
            ticket.side, target, stop
        )));
    }
    if let Some(trail) = ticket.trail {
        if trail.activate_at <= 0.0 || trail.trail_by <= 0.0 {
            return Err(OrderError::InvalidBracket(
                "trail_stop_at and trail_stop_by must be positive".into(),
            ));
        }
    }
    Ok(())
}
