//! Backtest result: summary metrics, trade log, equity and drawdown curves.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{SignalKind, TimestampMs};

use super::BacktestError;

/// One point of the equity curve, keyed by candle open time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: TimestampMs,
    pub equity: f64,
}

/// One point of the drawdown curve (percent decline from the peak).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownPoint {
    pub timestamp: TimestampMs,
    pub drawdown: f64,
}

/// One executed simulated trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: TimestampMs,
    pub kind: SignalKind,
    pub price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub balance: f64,
}

/// Headline metrics of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub initial_balance: f64,
    pub final_balance: f64,
    /// Percent.
    pub total_return: f64,
    /// Percent.
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Percent.
    pub win_rate: f64,
    pub pair: String,
    pub timeframe: String,
    pub start_timestamp: TimestampMs,
    pub end_timestamp: TimestampMs,
}

/// Complete result of one backtest run. Serializes to the structured
/// key/value form used for persistence and charting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub summary: BacktestSummary,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<TradeRecord>,
    pub drawdown_curve: Vec<DrawdownPoint>,
}

impl BacktestResult {
    pub fn to_json(&self) -> Result<serde_json::Value, BacktestError> {
        serde_json::to_value(self).map_err(|e| BacktestError::Io(e.to_string()))
    }

    pub fn save_to_json(&self, path: &Path) -> Result<(), BacktestError> {
        let text = serde_json::to_string_pretty(self).map_err(|e| BacktestError::Io(e.to_string()))?;
        fs::write(path, text).map_err(|e| BacktestError::Io(e.to_string()))
    }
}
