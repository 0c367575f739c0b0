//! Market-data and trading domain types.
//!
//! Everything here is a plain value type: candles, tickers, order books and
//! trades are immutable once produced, signals are immutable once emitted,
//! and positions are mutated only by the engine that owns them.

pub mod candle;
pub mod order_book;
pub mod position;
pub mod signal;
pub mod ticker;
pub mod trade;

pub use candle::{Candle, CandleError};
pub use order_book::{OrderBook, OrderBookLevel};
pub use position::{OrderSide, Position};
pub use signal::{Signal, SignalKind};
pub use ticker::Ticker;
pub use trade::TradeInfo;

/// Milliseconds since the Unix epoch. Wire/data timestamps use this form;
/// cooldowns and execution timing use a monotonic clock instead.
pub type TimestampMs = i64;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}
