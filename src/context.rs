//! Engine context
//!
//! One explicit context object per process, built once at startup and passed
//! to every component — components never reach for ambient shared state.

use std::sync::Arc;

use crate::aggregator::BarAggregator;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::errors::EngineError;
use crate::oms::{BrokerAdapter, OrderManager};
use crate::store::RollingStore;

/// Shared handles for one engine instance
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<Config>,
    pub store: Arc<RollingStore>,
    pub bus: Arc<MessageBus>,
    pub oms: Arc<OrderManager>,
    pub aggregator: Arc<BarAggregator>,
}

impl EngineContext {
    /// Validate the config and wire up store, bus, aggregator and OMS.
    pub fn build(config: Config, broker: Arc<dyn BrokerAdapter>) -> Result<Self, EngineError> {
        config.validate()?;

        let store = Arc::new(RollingStore::new());
        for ins in &config.instruments {
            store.register(ins.symbol(), ins.tick_window, ins.bar_window);
        }

        let bus = Arc::new(MessageBus::new(config.bus_capacity));
        let aggregator = Arc::new(BarAggregator::new(config.resolutions.clone()));
        let oms = Arc::new(OrderManager::new(
            broker,
            config.default_order_expiry_secs,
            config.enable_combo_orders,
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            bus,
            oms,
            aggregator,
        })
    }
}
