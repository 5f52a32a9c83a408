//! Application configuration.
//!
//! Structure comes from a TOML file (path via `--config` or
//! `GRIDBOT_CONFIG`); secrets come only from the environment
//! (`BYBIT_API_KEY`, `BYBIT_API_SECRET`, `BYBIT_TESTNET`,
//! `GRIDBOT_WEBHOOK_SECRET`). Missing sections fall back to defaults,
//! including the built-in grid deployments.

use serde::{Deserialize, Serialize};

use gridbot_engine::GridParameters;
use gridbot_risk::RiskConfig;

use crate::error::{AppError, AppResult};

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Disable to run on the null store.
    pub enabled: bool,
    /// Base directory for JSON-Lines event files.
    pub data_dir: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_dir: "./data/events".to_string(),
        }
    }
}

/// Exchange call budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls per second across the whole process.
    pub calls_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { calls_per_second: 10 }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Grid deployments; `None` uses the built-in set.
    #[serde(default)]
    pub grids: Option<Vec<GridParameters>>,
}

impl AppConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read {path}: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse {path}: {e}")))
    }

    /// Deployments to install on startup.
    pub fn deployments(&self) -> Vec<GridParameters> {
        self.grids
            .clone()
            .unwrap_or_else(gridbot_engine::default_deployments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.rate_limit.calls_per_second, 10);
        assert!(!config.persistence.enabled);
        assert_eq!(config.deployments().len(), 4);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8000);
        assert!(config.grids.is_none());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [server]
            port = 9000

            [persistence]
            enabled = true
            data_dir = "/var/lib/gridbot"

            [rate_limit]
            calls_per_second = 5

            [[grids]]
            symbol = "BTCUSDT"
            lower_price = "95500"
            upper_price = "99000"
            grid_count = 12
            total_investment = "25000"
            stop_loss = "94800"
        "#;

        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(config.persistence.enabled);
        assert_eq!(config.rate_limit.calls_per_second, 5);

        let deployments = config.deployments();
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].symbol.as_str(), "BTCUSDT");
        assert_eq!(deployments[0].grid_count, 12);
    }
}
