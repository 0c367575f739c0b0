//! Order-book snapshot.

use serde::{Deserialize, Serialize};

/// One (price, quantity) level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Snapshot of the book: bids ordered by descending price, asks by
/// ascending price, plus a monotonic update id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub update_id: u64,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&OrderBookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&OrderBookLevel> {
        self.asks.first()
    }

    /// Best-ask minus best-bid; `None` when either side is empty.
    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a.price - b.price),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, quantity: f64) -> OrderBookLevel {
        OrderBookLevel { price, quantity }
    }

    #[test]
    fn spread_from_top_of_book() {
        let book = OrderBook {
            bids: vec![level(99.5, 1.0), level(99.0, 2.0)],
            asks: vec![level(100.5, 1.0), level(101.0, 2.0)],
            update_id: 7,
        };
        assert_eq!(book.spread(), Some(1.0));
    }

    #[test]
    fn spread_none_on_empty_side() {
        let book = OrderBook { bids: vec![], asks: vec![level(100.5, 1.0)], update_id: 1 };
        assert_eq!(book.spread(), None);
    }
}
