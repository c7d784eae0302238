//! Engine configuration
//!
//! JSON configuration files in the shape the rest of the tooling expects,
//! validated up front: a bad config is fatal at startup, never a runtime
//! surprise.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::EngineError;
use crate::types::{Resolution, Symbol};

/// Per-instrument window sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    /// Rolling tick window (entries), oldest evicted first
    #[serde(default = "default_tick_window")]
    pub tick_window: usize,
    /// Rolling bar window per resolution (entries)
    #[serde(default = "default_bar_window")]
    pub bar_window: usize,
}

fn default_tick_window() -> usize {
    1000
}

fn default_bar_window() -> usize {
    500
}

impl InstrumentConfig {
    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.symbol)
    }
}

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub instruments: Vec<InstrumentConfig>,
    /// Bar resolutions built in parallel from the tick stream, e.g. ["1m", "100t"]
    pub resolutions: Vec<Resolution>,
    /// Event-bus ring capacity shared by all subscribers
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    /// Per-instrument dispatch queue depth
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: usize,
    /// Default TTL for unfilled orders submitted without an explicit expiry
    #[serde(default = "default_order_expiry_secs")]
    pub default_order_expiry_secs: u64,
    /// Native combo/spread order support; off unless explicitly enabled
    #[serde(default)]
    pub enable_combo_orders: bool,
}

fn default_bus_capacity() -> usize {
    4096
}

fn default_dispatch_queue() -> usize {
    256
}

fn default_order_expiry_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Config {
            instruments: Vec::new(),
            resolutions: vec![Resolution::Time(60)],
            bus_capacity: default_bus_capacity(),
            dispatch_queue: default_dispatch_queue(),
            default_order_expiry_secs: default_order_expiry_secs(),
            enable_combo_orders: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation; any violation is fatal
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.instruments.is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "at least one instrument is required".into(),
            ));
        }
        if self.resolutions.is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "at least one bar resolution is required".into(),
            ));
        }
        for ins in &self.instruments {
            if ins.symbol.trim().is_empty() {
                return Err(EngineError::InvalidConfiguration(
                    "instrument symbol must not be empty".into(),
                ));
            }
            if ins.tick_window == 0 || ins.bar_window == 0 {
                return Err(EngineError::InvalidConfiguration(format!(
                    "{}: tick_window and bar_window must be positive",
                    ins.symbol
                )));
            }
        }
        if self.bus_capacity == 0 || self.dispatch_queue == 0 {
            return Err(EngineError::InvalidConfiguration(
                "bus_capacity and dispatch_queue must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.instruments.iter().map(|i| i.symbol()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_instrument() -> Config {
        Config {
            instruments: vec![InstrumentConfig {
                symbol: "ESU25".into(),
                tick_window: 100,
                bar_window: 50,
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(one_instrument().validate().is_ok());
    }

    #[test]
    fn test_empty_instruments_fatal() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_zero_window_fatal() {
        let mut config = one_instrument();
        config.instruments[0].tick_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_with_defaults() {
        let json = r#"{
            "instruments": [{"symbol": "ESU25"}],
            "resolutions": ["1m", "100t"]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.instruments[0].tick_window, 1000);
        assert_eq!(config.resolutions.len(), 2);
        assert!(!config.enable_combo_orders);
        assert!(config.validate().is_ok());
    }
}
