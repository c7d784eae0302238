//! Order management
//!
//! Bracket orders (entry + target + stop), OCO exits, trailing stops and
//! order expiry, applied atomically per bracket group. Broker connectivity
//! sits behind the `BrokerAdapter` seam; `SimBroker` stands in for it in
//! backtests and tests.

pub mod broker;
pub mod manager;
pub mod types;

pub use broker::{BrokerAdapter, BrokerError, SimBroker};
pub use manager::OrderManager;
pub use types::{
    FillReport, GroupId, Order, OrderError, OrderId, OrderRole, OrderState, OrderTicket,
    OrderType, Position, TrailSpec,
};
