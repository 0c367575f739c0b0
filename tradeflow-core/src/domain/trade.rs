//! Public trade record as reported by an exchange.

use serde::{Deserialize, Serialize};

use super::TimestampMs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeInfo {
    pub symbol: String,
    pub id: String,
    pub price: f64,
    pub quantity: f64,
    /// True when the buyer was the passive side.
    pub is_buyer_maker: bool,
    pub timestamp: TimestampMs,
}
