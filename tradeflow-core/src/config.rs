//! Application configuration — TOML files with a top-level `[risk]`
//! section mirroring the risk manager's parameter names, a `[[strategy]]`
//! array and an optional `[backtest]` section.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::backtest::{parse_date, BacktestConfig, BacktestError};
use crate::risk::RiskParameters;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o error: {0}")]
    Io(String),

    #[error("config parse error: {0}")]
    Parse(String),
}

/// One `[[strategy]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategySection {
    /// Strategy selector: "rsi", "sma" or "macd".
    #[serde(rename = "type")]
    pub strategy_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Indicator parameters handed to the strategy's `configure`.
    #[serde(default)]
    pub params: toml::Table,
}

impl StrategySection {
    /// Parameters as JSON for `Strategy::configure`.
    pub fn params_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null)
    }
}

/// `[backtest]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BacktestSection {
    pub symbol: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    #[serde(default = "default_slippage_pct")]
    pub slippage_pct: f64,
    /// CSV candle file; when absent the CLI pulls from the exchange.
    #[serde(default)]
    pub data_file: Option<String>,
}

/// Top-level application config.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub risk: RiskParameters,
    #[serde(default, rename = "strategy")]
    pub strategies: Vec<StrategySection>,
    #[serde(default)]
    pub backtest: Option<BacktestSection>,
}

fn default_enabled() -> bool {
    true
}
fn default_timeframe() -> String {
    "1h".to_string()
}
fn default_initial_balance() -> f64 {
    10_000.0
}
fn default_fee_rate() -> f64 {
    0.001
}
fn default_slippage_pct() -> f64 {
    0.05
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Materialize the `[backtest]` section into a runnable config.
    pub fn to_backtest_config(&self) -> Result<Option<BacktestConfig>, BacktestError> {
        let Some(section) = &self.backtest else {
            return Ok(None);
        };
        Ok(Some(BacktestConfig {
            initial_balance: section.initial_balance,
            timeframe: section.timeframe.clone(),
            symbol: section.symbol.clone(),
            start_ms: parse_date(&section.start_date)?,
            end_ms: parse_date(&section.end_date)?,
            fee_rate: section.fee_rate,
            slippage_pct: section.slippage_pct,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[risk]
capital_pct = 3.0
max_symbol_exposure = 15.0
max_positions = 4

[[strategy]]
type = "rsi"
params = { period = 10, oversold = 25.0 }

[[strategy]]
type = "macd"
enabled = false

[backtest]
symbol = "BTCUSDT"
start_date = "2024-01-01"
end_date = "2024-06-30"
initial_balance = 5000.0
fee_rate = 0.0
data_file = "candles.csv"
"#;

    #[test]
    fn parses_full_document() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.risk.capital_pct, 3.0);
        assert_eq!(config.risk.max_symbol_exposure, 15.0);
        assert_eq!(config.risk.max_positions, 4);
        // Omitted risk fields keep their defaults.
        assert_eq!(config.risk.max_daily_loss, 10.0);

        assert_eq!(config.strategies.len(), 2);
        assert!(config.strategies[0].enabled);
        assert!(!config.strategies[1].enabled);
        let params = config.strategies[0].params_json();
        assert_eq!(params["period"], 10);
        assert_eq!(params["oversold"], 25.0);
    }

    #[test]
    fn backtest_section_materializes() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let backtest = config.to_backtest_config().unwrap().unwrap();
        assert_eq!(backtest.symbol, "BTCUSDT");
        assert_eq!(backtest.initial_balance, 5_000.0);
        assert_eq!(backtest.fee_rate, 0.0);
        assert_eq!(backtest.slippage_pct, 0.05);
        assert!(backtest.start_ms < backtest.end_ms);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.risk, RiskParameters::default());
        assert!(config.strategies.is_empty());
        assert!(config.backtest.is_none());
        assert!(config.to_backtest_config().unwrap().is_none());
    }

    #[test]
    fn malformed_document_is_parse_error() {
        let result = AppConfig::from_toml("[risk\ncapital_pct = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn bad_date_surfaces_as_invalid_date() {
        let toml_str = r#"
[backtest]
symbol = "BTCUSDT"
start_date = "soon"
end_date = "2024-06-30"
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert!(matches!(
            config.to_backtest_config(),
            Err(BacktestError::InvalidDate(_))
        ));
    }
}
