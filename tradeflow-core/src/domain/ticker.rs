//! Ticker — point-in-time market snapshot for a symbol.

use serde::{Deserialize, Serialize};

use super::TimestampMs;

/// 24h ticker snapshot. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub volume_24h: f64,
    pub price_change_24h: f64,
    pub price_change_percent_24h: f64,
    pub timestamp: TimestampMs,
}

impl Ticker {
    /// Snapshot carrying only symbol, last price and timestamp. Used when a
    /// candle is replayed as if it were live (backtests, paper sessions).
    pub fn from_last(symbol: impl Into<String>, last_price: f64, timestamp: TimestampMs) -> Self {
        Self {
            symbol: symbol.into(),
            last_price,
            bid_price: last_price,
            ask_price: last_price,
            volume_24h: 0.0,
            price_change_24h: 0.0,
            price_change_percent_24h: 0.0,
            timestamp,
        }
    }

    /// Bid/ask midpoint, falling back to last price when the book is empty.
    pub fn mid_price(&self) -> f64 {
        if self.bid_price > 0.0 && self.ask_price > 0.0 {
            (self.bid_price + self.ask_price) / 2.0
        } else {
            self.last_price
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_last_fills_bid_ask() {
        let t = Ticker::from_last("BTCUSDT", 50_000.0, 1_700_000_000_000);
        assert_eq!(t.bid_price, 50_000.0);
        assert_eq!(t.ask_price, 50_000.0);
        assert_eq!(t.mid_price(), 50_000.0);
    }

    #[test]
    fn mid_price_uses_book_when_present() {
        let mut t = Ticker::from_last("BTCUSDT", 50_000.0, 0);
        t.bid_price = 49_990.0;
        t.ask_price = 50_010.0;
        assert_eq!(t.mid_price(), 50_000.0);
    }
}
