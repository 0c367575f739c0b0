//! Open position owned by the strategy engine.

use serde::{Deserialize, Serialize};

use super::TimestampMs;

/// Order direction, shared by signals, positions and order requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// An open position. Created by the engine on registration, mutated only by
/// the owning engine under its positions lock, destroyed on close. The
/// owning strategy is referenced by name, never by pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Stable id of the form `pos_<ms-timestamp>_<counter>`.
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub entry_price: f64,
    pub quantity: f64,
    /// Entry time, milliseconds since epoch.
    pub entry_time: TimestampMs,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub strategy_name: String,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub commission: f64,
}

impl Position {
    /// Nominal exposure: quantity × entry price.
    pub fn exposure(&self) -> f64 {
        self.quantity * self.entry_price
    }

    /// Re-mark against `current_price` and recompute unrealized PnL:
    /// (current − entry) · qty, sign-flipped for shorts, net of commission.
    pub fn update_mark(&mut self, current_price: f64) {
        self.current_price = current_price;
        let mut diff = current_price - self.entry_price;
        if self.side == OrderSide::Sell {
            diff = -diff;
        }
        self.unrealized_pnl = diff * self.quantity - self.commission;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: OrderSide) -> Position {
        Position {
            id: "pos_1700000000000_0".into(),
            symbol: "BTCUSDT".into(),
            side,
            entry_price: 100.0,
            quantity: 2.0,
            entry_time: 1_700_000_000_000,
            stop_loss: 98.0,
            take_profit: 104.0,
            strategy_name: "RSI Strategy".into(),
            current_price: 100.0,
            unrealized_pnl: 0.0,
            commission: 0.5,
        }
    }

    #[test]
    fn long_unrealized_pnl() {
        let mut p = position(OrderSide::Buy);
        p.update_mark(110.0);
        assert_eq!(p.unrealized_pnl, 2.0 * 10.0 - 0.5);
    }

    #[test]
    fn short_unrealized_pnl() {
        let mut p = position(OrderSide::Sell);
        p.update_mark(90.0);
        assert_eq!(p.unrealized_pnl, 2.0 * 10.0 - 0.5);
    }

    #[test]
    fn exposure_is_entry_notional() {
        let p = position(OrderSide::Buy);
        assert_eq!(p.exposure(), 200.0);
    }
}
