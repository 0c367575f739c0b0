//! Strategy-level configuration record.

use serde::{Deserialize, Serialize};

/// Trading style tag carried by every strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    Scalping,
    Swing,
    Position,
    Arbitrage,
    Grid,
    Dca,
    Momentum,
    MeanReversion,
}

/// Configuration shared by all strategies. Indicator-specific parameters
/// live in `custom_params` and are interpreted by each strategy's
/// `configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    pub kind: StrategyKind,
    pub symbols: Vec<String>,
    pub timeframe: String,
    /// Per-trade risk, percent of capital.
    pub risk_percentage: f64,
    /// Maximum tolerated drawdown, percent.
    pub max_drawdown: f64,
    pub max_open_positions: u32,
    pub enabled: bool,
    #[serde(default)]
    pub custom_params: serde_json::Value,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: StrategyKind::Swing,
            symbols: Vec::new(),
            timeframe: "1h".to_string(),
            risk_percentage: 2.0,
            max_drawdown: 10.0,
            max_open_positions: 3,
            enabled: true,
            custom_params: serde_json::Value::Null,
        }
    }
}
