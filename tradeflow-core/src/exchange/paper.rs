//! Paper exchange — in-memory venue for tests and dry runs.
//!
//! Holds seeded candle series and balances, fills market orders
//! immediately at the last observed price, and can replay its candles into
//! kline subscribers so a live-shaped session can run without touching a
//! real venue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use super::{
    ExchangeClient, ExchangeError, KlineCallback, OrderBookCallback, OrderRequest, OrderResponse,
    OrderType, StreamKind, TickerCallback, TradeCallback,
};
use crate::domain::{now_millis, Candle, OrderBook, Ticker, TimestampMs, TradeInfo};
use crate::strategy::lock;

struct PaperState {
    candles: HashMap<String, Vec<Candle>>,
    last_price: HashMap<String, f64>,
    balances: HashMap<String, f64>,
    orders: HashMap<String, OrderResponse>,
    kline_subscribers: HashMap<String, Vec<Arc<dyn Fn(&Candle) + Send + Sync>>>,
}

/// Simulated venue backed by seeded data.
pub struct PaperExchange {
    initialized: AtomicBool,
    order_counter: AtomicU64,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            order_counter: AtomicU64::new(0),
            state: Mutex::new(PaperState {
                candles: HashMap::new(),
                last_price: HashMap::new(),
                balances: HashMap::new(),
                orders: HashMap::new(),
                kline_subscribers: HashMap::new(),
            }),
        }
    }

    /// Seed the candle series for a symbol; the final close becomes the
    /// last price.
    pub fn seed_candles(&self, symbol: &str, candles: Vec<Candle>) {
        let mut state = lock(&self.state);
        if let Some(last) = candles.last() {
            state.last_price.insert(symbol.to_string(), last.close);
        }
        state.candles.insert(symbol.to_string(), candles);
    }

    pub fn set_balance(&self, asset: &str, amount: f64) {
        lock(&self.state).balances.insert(asset.to_string(), amount);
    }

    pub fn set_last_price(&self, symbol: &str, price: f64) {
        lock(&self.state).last_price.insert(symbol.to_string(), price);
    }

    /// Push every seeded candle for `symbol` through the kline
    /// subscribers, advancing the last price candle by candle. Callbacks
    /// run with the state lock released so they may call back into the
    /// exchange.
    pub fn replay_klines(&self, symbol: &str) {
        let candles = lock(&self.state).candles.get(symbol).cloned().unwrap_or_default();
        for candle in candles {
            let subscribers = {
                let mut state = lock(&self.state);
                state.last_price.insert(symbol.to_string(), candle.close);
                state.kline_subscribers.get(symbol).cloned().unwrap_or_default()
            };
            for callback in subscribers {
                callback(&candle);
            }
        }
    }

    fn ensure_initialized(&self) -> Result<(), ExchangeError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ExchangeError::Transport("paper exchange not initialized".into()))
        }
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeClient for PaperExchange {
    fn initialize(&self) -> Result<(), ExchangeError> {
        self.initialized.store(true, Ordering::Release);
        info!(exchange = "paper", "initialized");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.ensure_initialized()?;
        let state = lock(&self.state);
        let price = state
            .last_price
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("no data for {symbol}")))?;
        Ok(Ticker::from_last(symbol, price, now_millis()))
    }

    fn order_book(&self, symbol: &str, _depth: usize) -> Result<OrderBook, ExchangeError> {
        self.ensure_initialized()?;
        let ticker = self.ticker(symbol)?;
        // Synthetic one-level book a tick around the last price.
        let tick = ticker.last_price * 0.0001;
        Ok(OrderBook {
            bids: vec![crate::domain::OrderBookLevel {
                price: ticker.last_price - tick,
                quantity: 1.0,
            }],
            asks: vec![crate::domain::OrderBookLevel {
                price: ticker.last_price + tick,
                quantity: 1.0,
            }],
            update_id: now_millis() as u64,
        })
    }

    fn recent_trades(&self, symbol: &str, _limit: usize) -> Result<Vec<TradeInfo>, ExchangeError> {
        self.ensure_initialized()?;
        let _ = self.ticker(symbol)?;
        Ok(Vec::new())
    }

    fn klines(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
        start_ms: TimestampMs,
        end_ms: TimestampMs,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.ensure_initialized()?;
        let state = lock(&self.state);
        let candles = state
            .candles
            .get(symbol)
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("no data for {symbol}")))?;
        let page: Vec<Candle> = candles
            .iter()
            .filter(|c| c.open_time >= start_ms && (end_ms == 0 || c.open_time <= end_ms))
            .take(limit)
            .cloned()
            .collect();
        Ok(page)
    }

    fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, ExchangeError> {
        self.ensure_initialized()?;
        if request.quantity <= 0.0 {
            return Err(ExchangeError::InvalidResponse("quantity must be positive".into()));
        }
        let mut state = lock(&self.state);
        let fill_price = match request.order_type {
            OrderType::Limit => request.price.unwrap_or_default(),
            OrderType::Market => state
                .last_price
                .get(&request.symbol)
                .copied()
                .ok_or_else(|| {
                    ExchangeError::InvalidResponse(format!("no price for {}", request.symbol))
                })?,
        };
        let order_id = format!("paper_{}", self.order_counter.fetch_add(1, Ordering::Relaxed));
        let response = OrderResponse {
            order_id: order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            price: fill_price,
            executed_qty: request.quantity,
            orig_qty: request.quantity,
            status: "FILLED".to_string(),
            transact_time: now_millis(),
        };
        state.orders.insert(order_id, response.clone());
        Ok(response)
    }

    fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<bool, ExchangeError> {
        self.ensure_initialized()?;
        let mut state = lock(&self.state);
        match state.orders.get_mut(order_id) {
            Some(order) if order.status != "FILLED" => {
                order.status = "CANCELED".to_string();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    fn order_status(&self, _symbol: &str, order_id: &str) -> Result<OrderResponse, ExchangeError> {
        self.ensure_initialized()?;
        lock(&self.state)
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("unknown order {order_id}")))
    }

    fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResponse>, ExchangeError> {
        self.ensure_initialized()?;
        Ok(lock(&self.state)
            .orders
            .values()
            .filter(|o| o.status == "NEW")
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    fn account_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        self.ensure_initialized()?;
        Ok(lock(&self.state).balances.get(asset).copied().unwrap_or(0.0))
    }

    fn subscribe_order_book(&self, _symbol: &str, _callback: OrderBookCallback) -> bool {
        false
    }

    fn subscribe_ticker(&self, _symbol: &str, _callback: TickerCallback) -> bool {
        false
    }

    fn subscribe_trades(&self, _symbol: &str, _callback: TradeCallback) -> bool {
        false
    }

    fn subscribe_klines(&self, symbol: &str, _interval: &str, callback: KlineCallback) -> bool {
        lock(&self.state)
            .kline_subscribers
            .entry(symbol.to_string())
            .or_default()
            .push(Arc::from(callback));
        true
    }

    fn unsubscribe(&self, symbol: &str, stream: StreamKind) -> bool {
        if stream == StreamKind::Klines {
            return lock(&self.state).kline_subscribers.remove(symbol).is_some();
        }
        false
    }

    fn exchange_name(&self) -> &'static str {
        "paper"
    }

    fn available_pairs(&self) -> Result<Vec<String>, ExchangeError> {
        self.ensure_initialized()?;
        Ok(lock(&self.state).candles.keys().cloned().collect())
    }

    fn is_valid_pair(&self, symbol: &str) -> bool {
        lock(&self.state).candles.contains_key(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderSide;
    use crate::strategy::test_support::candles_from_closes;

    fn seeded() -> PaperExchange {
        let exchange = PaperExchange::new();
        exchange.initialize().unwrap();
        exchange.seed_candles("BTCUSDT", candles_from_closes(&[100.0, 101.0, 102.0, 103.0]));
        exchange.set_balance("USDT", 10_000.0);
        exchange
    }

    #[test]
    fn calls_before_initialize_fail_with_transport_error() {
        let exchange = PaperExchange::new();
        assert!(matches!(exchange.ticker("BTCUSDT"), Err(ExchangeError::Transport(_))));
    }

    #[test]
    fn ticker_tracks_last_seeded_close() {
        let exchange = seeded();
        let ticker = exchange.ticker("BTCUSDT").unwrap();
        assert_eq!(ticker.last_price, 103.0);
    }

    #[test]
    fn klines_respect_window_and_limit() {
        let exchange = seeded();
        let all = exchange.klines("BTCUSDT", "1h", 500, 0, 0).unwrap();
        assert_eq!(all.len(), 4);

        let page = exchange.klines("BTCUSDT", "1h", 2, 0, 0).unwrap();
        assert_eq!(page.len(), 2);

        let hour_ms = 3_600_000;
        let windowed = exchange.klines("BTCUSDT", "1h", 500, hour_ms, 2 * hour_ms).unwrap();
        assert_eq!(windowed.len(), 2);
        assert_eq!(windowed[0].open_time, hour_ms);
    }

    #[test]
    fn market_order_fills_at_last_price() {
        let exchange = seeded();
        let response = exchange
            .place_order(&OrderRequest {
                symbol: "BTCUSDT".into(),
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                quantity: 0.5,
                price: None,
            })
            .unwrap();
        assert_eq!(response.status, "FILLED");
        assert_eq!(response.price, 103.0);
        assert_eq!(response.executed_qty, 0.5);

        let status = exchange.order_status("BTCUSDT", &response.order_id).unwrap();
        assert_eq!(status, response);
        // A filled order cannot be canceled.
        assert!(!exchange.cancel_order("BTCUSDT", &response.order_id).unwrap());
    }

    #[test]
    fn kline_replay_reaches_subscribers() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let exchange = seeded();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        assert!(exchange.subscribe_klines(
            "BTCUSDT",
            "1h",
            Box::new(move |_c| {
                seen2.fetch_add(1, Ordering::SeqCst);
            })
        ));
        exchange.replay_klines("BTCUSDT");
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert!(exchange.unsubscribe("BTCUSDT", StreamKind::Klines));
    }

    #[test]
    fn pair_utilities() {
        let exchange = seeded();
        assert!(exchange.is_valid_pair("BTCUSDT"));
        assert!(!exchange.is_valid_pair("DOGEUSDT"));
        assert_eq!(exchange.available_pairs().unwrap(), vec!["BTCUSDT".to_string()]);
        assert_eq!(exchange.exchange_name(), "paper");
        assert_eq!(exchange.account_balance("USDT").unwrap(), 10_000.0);
    }
}
