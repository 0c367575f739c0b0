//! Per-strategy trade metrics.
//!
//! A `TradeLedger` accumulates raw observations as positions close; a
//! `StrategyMetrics` snapshot derives the ratios from it on demand.

use serde::{Deserialize, Serialize};

use crate::domain::{now_millis, TimestampMs};

/// Derived performance snapshot for a single strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Percent of closed trades with positive PnL.
    pub win_rate: f64,
    pub total_pnl: f64,
    /// Total PnL relative to the running peak balance.
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub average_trade: f64,
    pub profit_factor: f64,
    pub calmar_ratio: f64,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    /// Mean holding time of closed trades, seconds.
    pub avg_trade_duration_secs: f64,
    pub last_trade_time: Option<TimestampMs>,
    pub start_time: TimestampMs,
}

impl StrategyMetrics {
    fn empty(start_time: TimestampMs) -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            total_pnl: 0.0,
            total_return: 0.0,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            max_drawdown: 0.0,
            current_drawdown: 0.0,
            best_trade: 0.0,
            worst_trade: 0.0,
            average_trade: 0.0,
            profit_factor: 0.0,
            calmar_ratio: 0.0,
            consecutive_wins: 0,
            consecutive_losses: 0,
            max_consecutive_wins: 0,
            max_consecutive_losses: 0,
            avg_trade_duration_secs: 0.0,
            last_trade_time: None,
            start_time,
        }
    }
}

/// Raw trade observations. Guarded by the strategy's metrics mutex; must
/// never be locked while the data mutex is held.
#[derive(Debug, Clone)]
pub struct TradeLedger {
    pnls: Vec<f64>,
    durations_ms: Vec<i64>,
    peak_balance: f64,
    current_balance: f64,
    max_drawdown: f64,
    consecutive_wins: u32,
    consecutive_losses: u32,
    max_consecutive_wins: u32,
    max_consecutive_losses: u32,
    last_trade_time: Option<TimestampMs>,
    start_time: TimestampMs,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self {
            pnls: Vec::new(),
            durations_ms: Vec::new(),
            peak_balance: 0.0,
            current_balance: 0.0,
            max_drawdown: 0.0,
            consecutive_wins: 0,
            consecutive_losses: 0,
            max_consecutive_wins: 0,
            max_consecutive_losses: 0,
            last_trade_time: None,
            start_time: now_millis(),
        }
    }

    /// Record a closed trade. `duration_ms` is entry-to-exit holding time.
    pub fn record_close(&mut self, pnl: f64, duration_ms: i64) {
        self.pnls.push(pnl);
        self.durations_ms.push(duration_ms.max(0));
        self.last_trade_time = Some(now_millis());

        if pnl > 0.0 {
            self.consecutive_wins += 1;
            self.consecutive_losses = 0;
            self.max_consecutive_wins = self.max_consecutive_wins.max(self.consecutive_wins);
        } else {
            self.consecutive_losses += 1;
            self.consecutive_wins = 0;
            self.max_consecutive_losses = self.max_consecutive_losses.max(self.consecutive_losses);
        }

        self.current_balance += pnl;
        self.peak_balance = self.peak_balance.max(self.current_balance);
        let drawdown = self.peak_balance - self.current_balance;
        self.max_drawdown = self.max_drawdown.max(drawdown);
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn total_trades(&self) -> u32 {
        self.pnls.len() as u32
    }

    /// Derive the full metrics snapshot.
    pub fn snapshot(&self) -> StrategyMetrics {
        let mut m = StrategyMetrics::empty(self.start_time);
        m.total_trades = self.pnls.len() as u32;
        if self.pnls.is_empty() {
            return m;
        }

        let wins: Vec<f64> = self.pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = self.pnls.iter().copied().filter(|p| *p <= 0.0).collect();
        m.winning_trades = wins.len() as u32;
        m.losing_trades = losses.len() as u32;
        m.win_rate = wins.len() as f64 / self.pnls.len() as f64 * 100.0;

        m.total_pnl = self.pnls.iter().sum();
        m.total_return = if self.peak_balance > 0.0 { m.total_pnl / self.peak_balance } else { 0.0 };
        m.average_trade = m.total_pnl / self.pnls.len() as f64;
        m.best_trade = self.pnls.iter().copied().fold(f64::MIN, f64::max);
        m.worst_trade = self.pnls.iter().copied().fold(f64::MAX, f64::min);

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().map(|p| p.abs()).sum();
        m.profit_factor = if gross_loss > 0.0 { gross_profit / gross_loss } else { 0.0 };

        m.sharpe_ratio = per_trade_sharpe(&self.pnls);
        m.sortino_ratio = per_trade_sortino(&self.pnls);

        m.max_drawdown = self.max_drawdown;
        m.current_drawdown = (self.peak_balance - self.current_balance).max(0.0);
        m.calmar_ratio = if self.max_drawdown > 0.0 { m.total_pnl / self.max_drawdown } else { 0.0 };

        m.consecutive_wins = self.consecutive_wins;
        m.consecutive_losses = self.consecutive_losses;
        m.max_consecutive_wins = self.max_consecutive_wins;
        m.max_consecutive_losses = self.max_consecutive_losses;

        m.avg_trade_duration_secs =
            self.durations_ms.iter().sum::<i64>() as f64 / self.durations_ms.len() as f64 / 1000.0;
        m.last_trade_time = self.last_trade_time;
        m
    }
}

impl Default for TradeLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean/stddev ratio of per-trade PnL. Not annualized: strategy-level
/// trades have no fixed period (the backtester computes the annualized
/// Sharpe from the equity curve instead).
fn per_trade_sharpe(pnls: &[f64]) -> f64 {
    if pnls.len() < 2 {
        return 0.0;
    }
    let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
    let variance = pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / pnls.len() as f64;
    let std = variance.sqrt();
    if std == 0.0 {
        0.0
    } else {
        mean / std
    }
}

/// Like Sharpe but penalizing only downside deviation.
fn per_trade_sortino(pnls: &[f64]) -> f64 {
    if pnls.len() < 2 {
        return 0.0;
    }
    let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
    let downside: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
    if downside.is_empty() {
        return 0.0;
    }
    let dd = (downside.iter().map(|p| p.powi(2)).sum::<f64>() / downside.len() as f64).sqrt();
    if dd == 0.0 {
        0.0
    } else {
        mean / dd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_split_into_wins_and_losses() {
        let mut ledger = TradeLedger::new();
        ledger.record_close(10.0, 1_000);
        ledger.record_close(-4.0, 2_000);
        ledger.record_close(6.0, 3_000);

        let m = ledger.snapshot();
        assert_eq!(m.total_trades, 3);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 1);
        assert_eq!(m.total_trades, m.winning_trades + m.losing_trades);
        assert!((m.win_rate - 2.0 / 3.0 * 100.0).abs() < 1e-9);
        assert_eq!(m.total_pnl, 12.0);
        assert_eq!(m.best_trade, 10.0);
        assert_eq!(m.worst_trade, -4.0);
    }

    #[test]
    fn drawdown_grows_on_loss_and_recovers_on_gain() {
        let mut ledger = TradeLedger::new();
        ledger.record_close(10.0, 0);
        ledger.record_close(-6.0, 0);
        let m = ledger.snapshot();
        assert_eq!(m.current_drawdown, 6.0);
        assert_eq!(m.max_drawdown, 6.0);

        ledger.record_close(4.0, 0);
        let m = ledger.snapshot();
        assert_eq!(m.current_drawdown, 2.0);
        // Max drawdown is monotone.
        assert_eq!(m.max_drawdown, 6.0);
    }

    #[test]
    fn streaks_track_maxima() {
        let mut ledger = TradeLedger::new();
        for pnl in [1.0, 1.0, 1.0, -1.0, -1.0, 2.0] {
            ledger.record_close(pnl, 0);
        }
        let m = ledger.snapshot();
        assert_eq!(m.max_consecutive_wins, 3);
        assert_eq!(m.max_consecutive_losses, 2);
        assert_eq!(m.consecutive_wins, 1);
        assert_eq!(m.consecutive_losses, 0);
    }

    #[test]
    fn profit_factor_gross_ratio() {
        let mut ledger = TradeLedger::new();
        ledger.record_close(30.0, 0);
        ledger.record_close(-10.0, 0);
        let m = ledger.snapshot();
        assert_eq!(m.profit_factor, 3.0);
    }

    #[test]
    fn average_duration_in_seconds() {
        let mut ledger = TradeLedger::new();
        ledger.record_close(1.0, 2_000);
        ledger.record_close(1.0, 4_000);
        let m = ledger.snapshot();
        assert_eq!(m.avg_trade_duration_secs, 3.0);
    }

    #[test]
    fn empty_ledger_snapshot_is_zeroed() {
        let m = TradeLedger::new().snapshot();
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.win_rate, 0.0);
        assert!(m.last_trade_time.is_none());
    }

    #[test]
    fn reset_clears_everything_but_restarts_clock() {
        let mut ledger = TradeLedger::new();
        ledger.record_close(5.0, 0);
        ledger.reset();
        assert_eq!(ledger.total_trades(), 0);
        assert_eq!(ledger.snapshot().total_pnl, 0.0);
    }
}
