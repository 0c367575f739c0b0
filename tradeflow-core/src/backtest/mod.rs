//! Backtester — deterministic replay of the live pipeline over historical
//! candles.
//!
//! Each candle feeds the strategy's `update`; non-Hold signals run through
//! a slippage/fee fill model maintaining a single long-only position per
//! symbol; the equity and drawdown curves, period returns and the
//! annualized Sharpe ratio are computed alongside.

pub mod data;
pub mod result;

pub use result::{BacktestResult, BacktestSummary, DrawdownPoint, EquityPoint, TradeRecord};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{Candle, Signal, SignalKind, Ticker, TimestampMs};
use crate::exchange::ExchangeClient;
use crate::strategy::Strategy;

/// Annualization basis: crypto markets trade every day.
const TRADING_DAYS_PER_YEAR: f64 = 365.0;

/// Annual risk-free rate assumed for the Sharpe ratio.
const RISK_FREE_RATE: f64 = 0.02;

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("historical data load failed: {0}")]
    DataLoad(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("no historical data available")]
    NoData,

    #[error("no strategy set")]
    NoStrategy,

    #[error("i/o error: {0}")]
    Io(String),
}

/// Backtest configuration.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub initial_balance: f64,
    pub timeframe: String,
    pub symbol: String,
    pub start_ms: TimestampMs,
    pub end_ms: TimestampMs,
    /// Per-trade fee rate applied to the gross amount.
    pub fee_rate: f64,
    /// Percent slippage applied multiplicatively: buys execute at
    /// price·(1+s), sells at price/(1+s).
    pub slippage_pct: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            timeframe: "1h".to_string(),
            symbol: "BTCUSDT".to_string(),
            start_ms: 0,
            end_ms: 0,
            fee_rate: 0.001,
            slippage_pct: 0.05,
        }
    }
}

/// Parse a date in "YYYY-MM-DD", "DD/MM/YYYY" or "YYYY-MM-DD HH:MM:SS"
/// form into milliseconds since epoch (UTC midnight for date-only forms).
pub fn parse_date(text: &str) -> Result<TimestampMs, BacktestError> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%d/%m/%Y") {
        return Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp_millis());
    }
    Err(BacktestError::InvalidDate(text.to_string()))
}

/// The backtest driver. Owns one strategy and a candle series; `run`
/// replays them deterministically. Cancellable cooperatively through the
/// handle returned by `cancel_handle`.
pub struct Backtester {
    config: BacktestConfig,
    strategy: Option<Arc<dyn Strategy>>,
    candles: Vec<Candle>,
    cancelled: Arc<AtomicBool>,

    // Replay state, rebuilt on every run.
    balance: f64,
    position_qty: f64,
    position_value: f64,
    total_trades: u32,
    winning_trades: u32,
    losing_trades: u32,
    max_drawdown: f64,
    equity_curve: Vec<EquityPoint>,
    drawdown_curve: Vec<DrawdownPoint>,
    trades: Vec<TradeRecord>,
    returns: Vec<f64>,
    result: Option<BacktestResult>,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Self {
        let balance = config.initial_balance;
        Self {
            config,
            strategy: None,
            candles: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            balance,
            position_qty: 0.0,
            position_value: 0.0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            max_drawdown: 0.0,
            equity_curve: Vec::new(),
            drawdown_curve: Vec::new(),
            trades: Vec::new(),
            returns: Vec::new(),
            result: None,
        }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn set_strategy(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategy = Some(strategy);
    }

    pub fn set_start_date(&mut self, date: &str) -> Result<(), BacktestError> {
        self.config.start_ms = parse_date(date)?;
        Ok(())
    }

    pub fn set_end_date(&mut self, date: &str) -> Result<(), BacktestError> {
        self.config.end_ms = parse_date(date)?;
        Ok(())
    }

    /// Load candles from a CSV file.
    pub fn load_historical_data(&mut self, path: &Path) -> Result<(), BacktestError> {
        self.candles = data::load_csv(path)?;
        Ok(())
    }

    /// Pull candles from an exchange over the configured window.
    pub fn load_historical_data_from_api(
        &mut self,
        client: &dyn ExchangeClient,
    ) -> Result<(), BacktestError> {
        self.candles = data::load_from_api(
            client,
            &self.config.symbol,
            &self.config.timeframe,
            self.config.start_ms,
            self.config.end_ms,
        )?;
        Ok(())
    }

    /// Seed candles directly (tests, paper sessions).
    pub fn set_candles(&mut self, candles: Vec<Candle>) {
        self.candles = candles;
    }

    /// Handle for cooperative cancellation from another thread.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn result(&self) -> Option<&BacktestResult> {
        self.result.as_ref()
    }

    /// Reset replay state; intermediate state from a cancelled run is
    /// discarded here.
    pub fn reset(&mut self) {
        self.balance = self.config.initial_balance;
        self.position_qty = 0.0;
        self.position_value = 0.0;
        self.total_trades = 0;
        self.winning_trades = 0;
        self.losing_trades = 0;
        self.max_drawdown = 0.0;
        self.equity_curve.clear();
        self.drawdown_curve.clear();
        self.trades.clear();
        self.returns.clear();
        self.result = None;
        if let Some(strategy) = &self.strategy {
            strategy.reset();
        }
    }

    /// Replay the candle series through the strategy. Per-candle trade
    /// anomalies are survived; only a missing strategy or empty data halt
    /// the run.
    pub fn run(&mut self) -> Result<BacktestResult, BacktestError> {
        let strategy = self.strategy.clone().ok_or(BacktestError::NoStrategy)?;
        if self.candles.is_empty() {
            return Err(BacktestError::NoData);
        }

        self.reset();
        strategy.start();

        let candles = std::mem::take(&mut self.candles);
        let mut peak_equity = self.config.initial_balance;

        for (i, candle) in candles.iter().enumerate() {
            // One-shot: observing the flag consumes it.
            if self.cancelled.swap(false, Ordering::SeqCst) {
                info!(processed = i, "backtest cancelled");
                break;
            }

            let ticker = Ticker::from_last(&self.config.symbol, candle.close, candle.open_time);
            let signal = match strategy.update(std::slice::from_ref(candle), &ticker) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(%err, candle = candle.open_time, "strategy update failed, skipping candle");
                    continue;
                }
            };

            if !signal.kind.is_hold() {
                self.execute_trade(&signal, candle);
            }

            let equity = self.balance + self.position_qty * candle.close;
            self.equity_curve.push(EquityPoint { timestamp: candle.open_time, equity });

            peak_equity = peak_equity.max(equity);
            let drawdown =
                if peak_equity > 0.0 { (peak_equity - equity) / peak_equity * 100.0 } else { 0.0 };
            self.drawdown_curve.push(DrawdownPoint { timestamp: candle.open_time, drawdown });
            self.max_drawdown = self.max_drawdown.max(drawdown);

            if i > 0 {
                let previous = self.equity_curve[self.equity_curve.len() - 2].equity;
                if previous != 0.0 {
                    self.returns.push((equity - previous) / previous);
                }
            }
        }
        self.candles = candles;

        let final_balance = self
            .equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(self.config.initial_balance);
        let total_return =
            (final_balance - self.config.initial_balance) / self.config.initial_balance * 100.0;
        let win_rate = if self.total_trades > 0 {
            self.winning_trades as f64 / self.total_trades as f64 * 100.0
        } else {
            0.0
        };

        let result = BacktestResult {
            summary: BacktestSummary {
                initial_balance: self.config.initial_balance,
                final_balance,
                total_return,
                max_drawdown: self.max_drawdown,
                sharpe_ratio: sharpe_ratio(&self.returns, RISK_FREE_RATE),
                total_trades: self.total_trades,
                winning_trades: self.winning_trades,
                losing_trades: self.losing_trades,
                win_rate,
                pair: self.config.symbol.clone(),
                timeframe: self.config.timeframe.clone(),
                start_timestamp: self.config.start_ms,
                end_timestamp: self.config.end_ms,
            },
            equity_curve: self.equity_curve.clone(),
            trades: self.trades.clone(),
            drawdown_curve: self.drawdown_curve.clone(),
        };

        info!(
            trades = result.summary.total_trades,
            final_balance = result.summary.final_balance,
            max_drawdown = result.summary.max_drawdown,
            "backtest complete"
        );
        self.result = Some(result.clone());
        Ok(result)
    }

    /// Single long-only position per symbol: a Buy opens when flat, a Sell
    /// closes an open position; other combinations are ignored.
    fn execute_trade(&mut self, signal: &Signal, candle: &Candle) {
        let slippage = 1.0 + self.config.slippage_pct / 100.0;
        let price = match signal.kind {
            SignalKind::Buy => candle.close * slippage,
            _ => candle.close / slippage,
        };

        match signal.kind {
            SignalKind::Buy if self.position_qty == 0.0 => {
                let cost = self.balance * signal.size_fraction;
                let fee = cost * self.config.fee_rate;
                if cost > 0.0 && cost + fee <= self.balance {
                    self.position_qty = cost / price;
                    self.balance -= cost + fee;
                    self.position_value = cost;
                    self.total_trades += 1;
                    self.trades.push(TradeRecord {
                        timestamp: candle.open_time,
                        kind: SignalKind::Buy,
                        price,
                        quantity: self.position_qty,
                        pnl: -fee,
                        balance: self.balance,
                    });
                }
            }
            SignalKind::Sell | SignalKind::CloseLong if self.position_qty > 0.0 => {
                let proceeds = self.position_qty * price;
                let fee = proceeds * self.config.fee_rate;
                let net = proceeds - fee;
                let pnl = net - self.position_value;
                self.balance += net;
                self.total_trades += 1;
                if pnl > 0.0 {
                    self.winning_trades += 1;
                } else {
                    self.losing_trades += 1;
                }
                self.trades.push(TradeRecord {
                    timestamp: candle.open_time,
                    kind: SignalKind::Sell,
                    price,
                    quantity: self.position_qty,
                    pnl,
                    balance: self.balance,
                });
                self.position_qty = 0.0;
                self.position_value = 0.0;
            }
            _ => {}
        }
    }
}

/// Annualized Sharpe ratio over per-period returns: mean excess return
/// over its standard deviation, scaled by √365. Zero deviation yields 0.
pub fn sharpe_ratio(returns: &[f64], annual_risk_free_rate: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let period_rf = annual_risk_free_rate / TRADING_DAYS_PER_YEAR;
    let excess: Vec<f64> = returns.iter().map(|r| r - period_rf).collect();
    let mean = excess.iter().sum::<f64>() / excess.len() as f64;
    let variance = excess.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / excess.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    mean / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
}
