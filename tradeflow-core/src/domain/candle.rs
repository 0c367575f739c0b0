//! Candle — one OHLCV bar for a fixed interval.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::TimestampMs;

/// Single OHLCV candle. Immutable once produced; ordered by `open_time`
/// within a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Interval open, milliseconds since epoch.
    pub open_time: TimestampMs,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Interval close, milliseconds since epoch.
    pub close_time: TimestampMs,
}

impl Candle {
    pub fn new(
        open_time: TimestampMs,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: TimestampMs,
    ) -> Self {
        Self { open_time, open, high, low, close, volume, close_time }
    }

    /// Validate candle invariants.
    pub fn validate(&self) -> Result<(), CandleError> {
        if self.high < self.low {
            return Err(CandleError::InvalidRange { high: self.high, low: self.low });
        }
        if self.open < 0.0 || self.high < 0.0 || self.low < 0.0 || self.close < 0.0 {
            return Err(CandleError::NegativePrice);
        }
        if self.volume < 0.0 {
            return Err(CandleError::NegativeVolume);
        }
        if !(self.low..=self.high).contains(&self.open) {
            return Err(CandleError::OpenOutOfRange);
        }
        if !(self.low..=self.high).contains(&self.close) {
            return Err(CandleError::CloseOutOfRange);
        }
        if self.close_time < self.open_time {
            return Err(CandleError::InvertedInterval);
        }
        Ok(())
    }

    /// Close above open.
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// High minus low.
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

#[derive(Debug, Error)]
pub enum CandleError {
    #[error("invalid candle range: high={high}, low={low}")]
    InvalidRange { high: f64, low: f64 },

    #[error("negative price not allowed")]
    NegativePrice,

    #[error("negative volume not allowed")]
    NegativeVolume,

    #[error("open price outside high/low range")]
    OpenOutOfRange,

    #[error("close price outside high/low range")]
    CloseOutOfRange,

    #[error("close time precedes open time")]
    InvertedInterval,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_well_formed_candle() {
        let c = Candle::new(0, 100.0, 105.0, 95.0, 102.0, 1000.0, 3_600_000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let c = Candle::new(0, 100.0, 99.0, 101.0, 100.0, 1000.0, 3_600_000);
        assert!(matches!(c.validate(), Err(CandleError::InvalidRange { .. })));
    }

    #[test]
    fn validate_rejects_negative_volume() {
        let c = Candle::new(0, 100.0, 105.0, 95.0, 102.0, -1.0, 3_600_000);
        assert!(matches!(c.validate(), Err(CandleError::NegativeVolume)));
    }

    #[test]
    fn validate_rejects_close_outside_range() {
        let c = Candle::new(0, 100.0, 105.0, 95.0, 110.0, 1000.0, 3_600_000);
        assert!(matches!(c.validate(), Err(CandleError::CloseOutOfRange)));
    }

    #[test]
    fn bullish_and_range() {
        let c = Candle::new(0, 100.0, 105.0, 95.0, 102.0, 1000.0, 3_600_000);
        assert!(c.is_bullish());
        assert_eq!(c.range(), 10.0);
    }
}
