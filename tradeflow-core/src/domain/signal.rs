//! Trading signal emitted by a strategy.

use serde::{Deserialize, Serialize};

use super::{now_millis, TimestampMs};

/// Directional intent of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
    CloseLong,
    CloseShort,
    Cancel,
}

impl SignalKind {
    pub fn is_hold(&self) -> bool {
        matches!(self, SignalKind::Hold)
    }
}

/// An immutable signal. Describes what a strategy wants done, not what the
/// engine ultimately did with it; risk gating happens downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub symbol: String,
    pub price: f64,
    /// Target quantity when the strategy sizes the trade itself.
    pub quantity: Option<f64>,
    /// Fraction of available balance to deploy; consumed by the
    /// backtester's cost model.
    pub size_fraction: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Confidence in [0, 1].
    pub strength: f64,
    pub strategy_name: String,
    pub message: String,
    /// Wall-clock emission time, milliseconds since epoch.
    pub timestamp: TimestampMs,
}

impl Signal {
    /// A Hold carrying an explanatory message, stamped now.
    pub fn hold(strategy_name: impl Into<String>, symbol: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Hold,
            symbol: symbol.into(),
            price: 0.0,
            quantity: None,
            size_fraction: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            strength: 0.0,
            strategy_name: strategy_name.into(),
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    /// Degrade this signal to Hold, keeping provenance and replacing the
    /// message. Used when validation fails.
    pub fn degraded(mut self, message: impl Into<String>) -> Self {
        self.kind = SignalKind::Hold;
        self.message = message.into();
        self
    }
}
