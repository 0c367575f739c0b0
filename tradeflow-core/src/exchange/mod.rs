//! Exchange adapter contract.
//!
//! The core consumes venues through this narrow synchronous interface.
//! Concrete REST/WebSocket clients live outside the core; adapters own
//! symbol and interval normalization from the canonical forms ("BTCUSDT",
//! "1h") to venue-specific strings. Every operation may fail with one of
//! four non-fatal error kinds.

pub mod paper;

pub use paper::PaperExchange;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Candle, OrderBook, OrderSide, Ticker, TimestampMs, TradeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price; ignored for market orders.
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: f64,
    pub executed_qty: f64,
    pub orig_qty: f64,
    /// Venue-native status string ("NEW", "FILLED", "CANCELED", ...).
    pub status: String,
    pub transact_time: TimestampMs,
}

/// Streaming subscription kinds, used for unsubscribe bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    OrderBook,
    Ticker,
    Trades,
    Klines,
}

pub type OrderBookCallback = Box<dyn Fn(&OrderBook) + Send + Sync>;
pub type TickerCallback = Box<dyn Fn(&Ticker) + Send + Sync>;
pub type TradeCallback = Box<dyn Fn(&TradeInfo) + Send + Sync>;
pub type KlineCallback = Box<dyn Fn(&Candle) + Send + Sync>;

/// Non-fatal per-call adapter failures.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("rate limit exceeded")]
    RateLimited,
}

/// Contract every venue adapter implements.
pub trait ExchangeClient: Send + Sync {
    // Lifecycle.
    fn initialize(&self) -> Result<(), ExchangeError>;
    fn is_initialized(&self) -> bool;

    // Market data.
    fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;
    fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError>;
    fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<TradeInfo>, ExchangeError>;
    /// Candles in `[start_ms, end_ms]`; 0 for either bound means open-ended.
    fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        start_ms: TimestampMs,
        end_ms: TimestampMs,
    ) -> Result<Vec<Candle>, ExchangeError>;

    // Trading.
    fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, ExchangeError>;
    fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool, ExchangeError>;
    fn order_status(&self, symbol: &str, order_id: &str) -> Result<OrderResponse, ExchangeError>;
    fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResponse>, ExchangeError>;
    fn account_balance(&self, asset: &str) -> Result<f64, ExchangeError>;

    // Streaming.
    fn subscribe_order_book(&self, symbol: &str, callback: OrderBookCallback) -> bool;
    fn subscribe_ticker(&self, symbol: &str, callback: TickerCallback) -> bool;
    fn subscribe_trades(&self, symbol: &str, callback: TradeCallback) -> bool;
    fn subscribe_klines(&self, symbol: &str, interval: &str, callback: KlineCallback) -> bool;
    fn unsubscribe(&self, symbol: &str, stream: StreamKind) -> bool;

    // Utility.
    fn exchange_name(&self) -> &'static str;
    fn available_pairs(&self) -> Result<Vec<String>, ExchangeError>;
    fn is_valid_pair(&self, symbol: &str) -> bool;
}
