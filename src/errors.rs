//! Error taxonomy
//!
//! Hard failures are typed errors; data-quality anomalies are warnings only.
//! A missing bar period (data gap) and a repeated fill/tick (duplicate event)
//! are logged via `tracing::warn!` and dropped — they never become `Err` and
//! never crash the strategy runtime. Adapter-level feed faults degrade to
//! stale data, surfaced as `TransientFeed` to the supervising loop only.

use thiserror::Error;

pub use crate::oms::{BrokerError, OrderError};

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal at startup; the process should not come up half-configured.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Feed hiccup; retry with backoff, keep last-known state.
    #[error("transient feed error: {0}")]
    TransientFeed(String),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
