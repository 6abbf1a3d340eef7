use crate::{
    engine::state::position::CostBasis, persistence::SnapshotCadence, risk::RiskLimits,
};
use rust_decimal::Decimal;
use std::path::PathBuf;
use thiserror::Error;
use vortex_execution::simulated::SimulatedExecutionConfig;
use vortex_instrument::{asset::AssetName, symbol::SymbolId};

/// How the engine is driven.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum RunMode {
    /// Newline-delimited commands on stdin; event stream on stdout.
    #[default]
    Stdio,
    /// Driven by the typed control surface; stdin is not read.
    Service,
}

/// Errors produced when building the engine configuration.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Engine application configuration, read from the environment with
/// sensible defaults for a simulated paper-trading session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub run_mode: RunMode,
    pub snapshot_dir: PathBuf,
    pub http_port: Option<u16>,
    pub enable_market_data: bool,
    pub use_testnet: bool,
    /// Seed balances credited on a fresh start (ignored on warm restart).
    pub initial_balances: Vec<(AssetName, Decimal)>,
    /// Symbols the simulated feed serves, with their seed mid prices.
    pub symbols: Vec<(SymbolId, Decimal)>,
    /// Per-symbol position cost basis overrides (weighted-average default).
    pub cost_basis: Vec<(SymbolId, CostBasis)>,
    pub risk_limits: RiskLimits,
    pub sim: SimulatedExecutionConfig,
    pub snapshot_cadence: SnapshotCadence,
    pub max_snapshots: usize,
    pub queue_capacity: usize,
    pub tick_interval_ms: u64,
    pub feed_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Stdio,
            snapshot_dir: PathBuf::from("./snapshots"),
            http_port: None,
            enable_market_data: true,
            use_testnet: false,
            initial_balances: vec![
                (AssetName::from_name("USDT"), Decimal::new(100_000, 0)),
                (AssetName::from_name("BTC"), Decimal::ZERO),
                (AssetName::from_name("ETH"), Decimal::ZERO),
            ],
            symbols: vec![
                (
                    SymbolId::new("BTCUSDT").expect("static symbol"),
                    Decimal::new(50_000, 0),
                ),
                (
                    SymbolId::new("ETHUSDT").expect("static symbol"),
                    Decimal::new(3_000, 0),
                ),
            ],
            cost_basis: Vec::new(),
            risk_limits: RiskLimits::default(),
            sim: SimulatedExecutionConfig::default(),
            snapshot_cadence: SnapshotCadence::default(),
            max_snapshots: 5,
            queue_capacity: crate::engine::event_loop::DEFAULT_QUEUE_CAPACITY,
            tick_interval_ms: 25,
            feed_interval_ms: 250,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the environment:
    /// `SNAPSHOT_DIR`, `HTTP_PORT`, `ENABLE_MARKET_DATA`, `USE_TESTNET`,
    /// `RUN_MODE` (`stdio`|`service`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("SNAPSHOT_DIR") {
            config.snapshot_dir = PathBuf::from(dir);
        }

        if let Ok(port) = std::env::var("HTTP_PORT") {
            let port = port.parse::<u16>().map_err(|_| ConfigError::Invalid {
                name: "HTTP_PORT",
                value: port.clone(),
            })?;
            config.http_port = Some(port);
            config.run_mode = RunMode::Service;
        }

        if let Ok(mode) = std::env::var("RUN_MODE") {
            config.run_mode = match mode.to_ascii_lowercase().as_str() {
                "stdio" => RunMode::Stdio,
                "service" => RunMode::Service,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "RUN_MODE",
                        value: mode,
                    });
                }
            };
        }

        if let Ok(enabled) = std::env::var("ENABLE_MARKET_DATA") {
            config.enable_market_data = parse_bool("ENABLE_MARKET_DATA", &enabled)?;
        }

        if let Ok(testnet) = std::env::var("USE_TESTNET") {
            config.use_testnet = parse_bool("USE_TESTNET", &testnet)?;
        }

        Ok(config)
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_variants() {
        assert_eq!(parse_bool("X", "TRUE"), Ok(true));
        assert_eq!(parse_bool("X", "0"), Ok(false));
        assert!(parse_bool("X", "maybe").is_err());
    }
}
