//! MACD strategy — signal-line and zero-line crossovers, histogram turns,
//! momentum and trend confirmation over the MACD oscillator.
//!
//! MACD is the fast EMA minus the slow EMA; the signal line is an EMA of a
//! rolling buffer of prior MACD values; the histogram is their difference.
//! Classification takes the first matching rule: signal-line cross,
//! zero-line cross, histogram turn or acceleration, momentum acceleration,
//! trend confirmation, divergence. Same-kind emissions are throttled to one
//! per five minutes.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::domain::{now_millis, Candle, OrderSide, Position, Signal, SignalKind, Ticker};
use crate::indicators::ema;
use crate::strategy::history::BoundedSeries;
use crate::strategy::{
    lock, merge_bool, merge_f64, merge_usize, stop_loss_level, take_profit_level, Strategy,
    StrategyCore, StrategyError, StrategyKind,
};

/// Same-kind signal cooldown.
const SIGNAL_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Strength scale divisors.
const CROSSOVER_SCALE: f64 = 0.01;
const ZERO_CROSS_SCALE: f64 = 0.005;
const HISTOGRAM_SCALE: f64 = 0.001;
const MOMENTUM_SCALE: f64 = 0.002;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacdParams {
    pub fast_period: usize,
    pub slow_period: usize,
    pub signal_period: usize,
    pub position_size: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Minimum |Δhistogram| for acceleration signals; half of it gates any
    /// emission.
    pub min_histogram_change: f64,
    pub use_divergence: bool,
    pub use_histogram_analysis: bool,
    pub use_zero_line_cross: bool,
    pub trend_confirmation_periods: usize,
    pub divergence_lookback: usize,
}

impl Default for MacdParams {
    fn default() -> Self {
        Self {
            fast_period: 12,
            slow_period: 26,
            signal_period: 9,
            position_size: 0.1,
            stop_loss_pct: 2.0,
            take_profit_pct: 4.0,
            min_histogram_change: 0.0001,
            use_divergence: true,
            use_histogram_analysis: true,
            use_zero_line_cross: true,
            trend_confirmation_periods: 5,
            divergence_lookback: 20,
        }
    }
}

impl MacdParams {
    /// Tight EMAs for short timeframes.
    pub fn scalping() -> Self {
        Self {
            fast_period: 5,
            slow_period: 13,
            signal_period: 5,
            position_size: 0.05,
            stop_loss_pct: 0.5,
            take_profit_pct: 1.0,
            min_histogram_change: 0.0002,
            use_divergence: false,
            ..Self::default()
        }
    }

    /// Standard EMAs, larger size and wider exits.
    pub fn swing() -> Self {
        Self {
            position_size: 0.15,
            stop_loss_pct: 3.0,
            take_profit_pct: 6.0,
            trend_confirmation_periods: 5,
            ..Self::default()
        }
    }

    /// Small size, tight exits, high histogram bar.
    pub fn conservative() -> Self {
        Self {
            position_size: 0.05,
            stop_loss_pct: 1.5,
            take_profit_pct: 3.0,
            min_histogram_change: 0.001,
            trend_confirmation_periods: 5,
            ..Self::default()
        }
    }

    /// Short EMAs, large size, quick confirmation.
    pub fn aggressive() -> Self {
        Self {
            fast_period: 8,
            slow_period: 17,
            signal_period: 5,
            position_size: 0.2,
            stop_loss_pct: 3.0,
            take_profit_pct: 6.0,
            min_histogram_change: 0.0002,
            trend_confirmation_periods: 2,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.fast_period == 0 || self.slow_period == 0 || self.signal_period == 0 {
            return Err(StrategyError::Configuration("MACD periods must be positive".into()));
        }
        if self.fast_period >= self.slow_period {
            return Err(StrategyError::Configuration(
                "fast EMA period must be less than slow EMA period".into(),
            ));
        }
        if self.trend_confirmation_periods == 0 {
            return Err(StrategyError::Configuration(
                "trend confirmation periods must be positive".into(),
            ));
        }
        Ok(())
    }

    fn close_buffer_cap(&self) -> usize {
        (self.slow_period * 3).max(200)
    }

    fn macd_buffer_cap(&self) -> usize {
        (self.signal_period * 2).max(50)
    }
}

/// Trend classification from MACD vs the signal line and zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MacdTrend {
    StrongBullish,
    Bullish,
    Neutral,
    Bearish,
    StrongBearish,
}

impl MacdTrend {
    pub fn label(&self) -> &'static str {
        match self {
            MacdTrend::StrongBullish => "Strong Bullish",
            MacdTrend::Bullish => "Bullish",
            MacdTrend::Neutral => "Neutral",
            MacdTrend::Bearish => "Bearish",
            MacdTrend::StrongBearish => "Strong Bearish",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MacdSignalType {
    BullishCrossover,
    BearishCrossover,
    ZeroLineCrossUp,
    ZeroLineCrossDown,
    HistogramTurnPositive,
    HistogramTurnNegative,
    HistogramAcceleratingUp,
    HistogramAcceleratingDown,
    MomentumAccelerationUp,
    MomentumAccelerationDown,
    TrendConfirmationBullish,
    TrendConfirmationBearish,
    DivergenceBullish,
    DivergenceBearish,
}

impl MacdSignalType {
    pub fn label(&self) -> &'static str {
        match self {
            MacdSignalType::BullishCrossover => "Bullish Crossover",
            MacdSignalType::BearishCrossover => "Bearish Crossover",
            MacdSignalType::ZeroLineCrossUp => "Zero Line Cross Up",
            MacdSignalType::ZeroLineCrossDown => "Zero Line Cross Down",
            MacdSignalType::HistogramTurnPositive => "Histogram Turn Positive",
            MacdSignalType::HistogramTurnNegative => "Histogram Turn Negative",
            MacdSignalType::HistogramAcceleratingUp => "Histogram Accelerating Up",
            MacdSignalType::HistogramAcceleratingDown => "Histogram Accelerating Down",
            MacdSignalType::MomentumAccelerationUp => "Momentum Acceleration Up",
            MacdSignalType::MomentumAccelerationDown => "Momentum Acceleration Down",
            MacdSignalType::TrendConfirmationBullish => "Trend Confirmation Bullish",
            MacdSignalType::TrendConfirmationBearish => "Trend Confirmation Bearish",
            MacdSignalType::DivergenceBullish => "Bullish Divergence",
            MacdSignalType::DivergenceBearish => "Bearish Divergence",
        }
    }

    pub fn direction(&self) -> SignalKind {
        match self {
            MacdSignalType::BullishCrossover
            | MacdSignalType::ZeroLineCrossUp
            | MacdSignalType::HistogramTurnPositive
            | MacdSignalType::HistogramAcceleratingUp
            | MacdSignalType::MomentumAccelerationUp
            | MacdSignalType::TrendConfirmationBullish
            | MacdSignalType::DivergenceBullish => SignalKind::Buy,
            MacdSignalType::BearishCrossover
            | MacdSignalType::ZeroLineCrossDown
            | MacdSignalType::HistogramTurnNegative
            | MacdSignalType::HistogramAcceleratingDown
            | MacdSignalType::MomentumAccelerationDown
            | MacdSignalType::TrendConfirmationBearish
            | MacdSignalType::DivergenceBearish => SignalKind::Sell,
        }
    }
}

/// One computed MACD snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MacdValues {
    pub fast_ema: f64,
    pub slow_ema: f64,
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    pub macd_change: f64,
    pub histogram_change: f64,
    pub period_count: usize,
    pub is_valid: bool,
}

#[derive(Debug, Clone)]
struct MacdSignalRecord {
    signal_type: MacdSignalType,
    trend: MacdTrend,
    price: f64,
    strength: f64,
    timestamp: i64,
    emitted: Instant,
}

struct MacdData {
    params: MacdParams,
    closes: BoundedSeries<f64>,
    /// Rolling MACD values feeding the signal-line EMA.
    macd_for_signal: BoundedSeries<f64>,
    history: BoundedSeries<MacdValues>,
    signals: BoundedSeries<MacdSignalRecord>,
    current: MacdValues,
    previous: MacdValues,
    current_trend: MacdTrend,
    in_position: bool,
    position_side: OrderSide,
    position_id: String,
    signal_counts: BTreeMap<&'static str, u64>,
    trend_counts: BTreeMap<&'static str, u64>,
}

impl MacdData {
    fn new(params: MacdParams) -> Self {
        let close_cap = params.close_buffer_cap();
        let macd_cap = params.macd_buffer_cap();
        Self {
            params,
            closes: BoundedSeries::new(close_cap),
            macd_for_signal: BoundedSeries::new(macd_cap),
            history: BoundedSeries::new(500),
            signals: BoundedSeries::new(100),
            current: MacdValues::default(),
            previous: MacdValues::default(),
            current_trend: MacdTrend::Neutral,
            in_position: false,
            position_side: OrderSide::Buy,
            position_id: String::new(),
            signal_counts: BTreeMap::new(),
            trend_counts: BTreeMap::new(),
        }
    }

    fn clear_market_state(&mut self) {
        self.closes.clear();
        self.closes.set_cap(self.params.close_buffer_cap());
        self.macd_for_signal.clear();
        self.macd_for_signal.set_cap(self.params.macd_buffer_cap());
        self.history.clear();
        self.signals.clear();
        self.current = MacdValues::default();
        self.previous = MacdValues::default();
        self.current_trend = MacdTrend::Neutral;
        self.in_position = false;
        self.position_id.clear();
        self.signal_counts.clear();
        self.trend_counts.clear();
    }

    fn has_sufficient_data(&self) -> bool {
        self.closes.len() >= self.params.slow_period + self.params.signal_period
    }

    fn compute_values(&mut self) -> MacdValues {
        let closes = self.closes.as_vec();
        let (fast_period, slow_period, signal_period) =
            (self.params.fast_period, self.params.slow_period, self.params.signal_period);

        let fast_ema = ema(&closes, fast_period);
        let slow_ema = ema(&closes, slow_period);
        let macd = fast_ema - slow_ema;

        self.macd_for_signal.push(macd);
        let signal = if self.macd_for_signal.len() >= signal_period {
            ema(&self.macd_for_signal.as_vec(), signal_period)
        } else {
            0.0
        };
        let histogram = macd - signal;

        MacdValues {
            fast_ema,
            slow_ema,
            macd,
            signal,
            histogram,
            macd_change: macd - self.current.macd,
            histogram_change: histogram - self.current.histogram,
            period_count: closes.len(),
            is_valid: fast_ema.is_finite() && slow_ema.is_finite() && signal.is_finite(),
        }
    }

    fn trend_of(values: &MacdValues) -> MacdTrend {
        if !values.is_valid {
            return MacdTrend::Neutral;
        }
        if values.macd > values.signal && values.macd > 0.0 {
            MacdTrend::StrongBullish
        } else if values.macd > values.signal {
            MacdTrend::Bullish
        } else if values.macd < values.signal && values.macd < 0.0 {
            MacdTrend::StrongBearish
        } else if values.macd < values.signal {
            MacdTrend::Bearish
        } else {
            MacdTrend::Neutral
        }
    }

    fn detect_crossover(&self) -> Option<MacdSignalType> {
        let cur = &self.current;
        let prev = &self.previous;
        if prev.macd <= prev.signal && cur.macd > cur.signal {
            return Some(MacdSignalType::BullishCrossover);
        }
        if prev.macd >= prev.signal && cur.macd < cur.signal {
            return Some(MacdSignalType::BearishCrossover);
        }
        None
    }

    fn detect_zero_cross(&self) -> Option<MacdSignalType> {
        if !self.params.use_zero_line_cross {
            return None;
        }
        let cur = &self.current;
        let prev = &self.previous;
        if prev.macd <= 0.0 && cur.macd > 0.0 {
            return Some(MacdSignalType::ZeroLineCrossUp);
        }
        if prev.macd >= 0.0 && cur.macd < 0.0 {
            return Some(MacdSignalType::ZeroLineCrossDown);
        }
        None
    }

    fn detect_histogram(&self) -> Option<MacdSignalType> {
        if !self.params.use_histogram_analysis {
            return None;
        }
        let cur = &self.current;
        let prev = &self.previous;
        if prev.histogram <= 0.0 && cur.histogram > 0.0 {
            return Some(MacdSignalType::HistogramTurnPositive);
        }
        if prev.histogram >= 0.0 && cur.histogram < 0.0 {
            return Some(MacdSignalType::HistogramTurnNegative);
        }
        if cur.histogram_change.abs() > self.params.min_histogram_change {
            if cur.histogram_change > 0.0 && cur.histogram > 0.0 {
                return Some(MacdSignalType::HistogramAcceleratingUp);
            }
            if cur.histogram_change < 0.0 && cur.histogram < 0.0 {
                return Some(MacdSignalType::HistogramAcceleratingDown);
            }
        }
        None
    }

    fn detect_momentum(&self) -> Option<MacdSignalType> {
        let cur = &self.current;
        let prev = &self.previous;
        if cur.macd > prev.macd && cur.histogram > prev.histogram && cur.histogram_change > 0.0 {
            return Some(MacdSignalType::MomentumAccelerationUp);
        }
        if cur.macd < prev.macd && cur.histogram < prev.histogram && cur.histogram_change < 0.0 {
            return Some(MacdSignalType::MomentumAccelerationDown);
        }
        None
    }

    /// At least 2/3 of the last `trend_confirmation_periods` snapshots must
    /// classify to the same trend.
    fn detect_trend_confirmation(&self) -> Option<MacdSignalType> {
        let periods = self.params.trend_confirmation_periods;
        if self.history.len() < periods {
            return None;
        }
        let needed = periods * 2 / 3;
        for (trend, signal_type) in [
            (MacdTrend::StrongBullish, MacdSignalType::TrendConfirmationBullish),
            (MacdTrend::StrongBearish, MacdSignalType::TrendConfirmationBearish),
        ] {
            let count = self
                .history
                .tail(periods)
                .iter()
                .filter(|v| Self::trend_of(v) == trend)
                .count();
            if count >= needed.max(1) {
                return Some(signal_type);
            }
        }
        None
    }

    fn detect_divergence(&self) -> Option<(MacdSignalType, f64)> {
        if !self.params.use_divergence {
            return None;
        }
        let lookback = self.params.divergence_lookback;
        if self.closes.len() < lookback + 2 || self.history.len() < lookback + 2 {
            return None;
        }

        let closes = self.closes.as_vec();
        let macds: Vec<f64> = self.history.iter().map(|v| v.macd).collect();

        let (price_highs, price_lows) = super::rsi::find_pivots(&closes, lookback);
        let (macd_highs, macd_lows) = super::rsi::find_pivots(&macds, lookback);

        if price_lows.len() >= 2 && macd_lows.len() >= 2 {
            let (pp, pl) = (price_lows[price_lows.len() - 2], price_lows[price_lows.len() - 1]);
            let (mp, ml) = (macd_lows[macd_lows.len() - 2], macd_lows[macd_lows.len() - 1]);
            if closes[pl] < closes[pp] && macds[ml] > macds[mp] {
                return Some((MacdSignalType::DivergenceBullish, 0.9));
            }
        }
        if price_highs.len() >= 2 && macd_highs.len() >= 2 {
            let (pp, ph) = (price_highs[price_highs.len() - 2], price_highs[price_highs.len() - 1]);
            let (mp, mh) = (macd_highs[macd_highs.len() - 2], macd_highs[macd_highs.len() - 1]);
            if closes[ph] > closes[pp] && macds[mh] < macds[mp] {
                return Some((MacdSignalType::DivergenceBearish, 0.9));
            }
        }
        None
    }

    /// First matching rule wins: signal-line cross, zero-line cross,
    /// histogram, momentum, trend confirmation, divergence.
    fn classify_signal(&self) -> Option<(MacdSignalType, f64)> {
        if !self.current.is_valid || !self.previous.is_valid {
            return None;
        }
        if let Some(t) = self.detect_crossover() {
            return Some((t, self.signal_strength(t)));
        }
        if let Some(t) = self.detect_zero_cross() {
            return Some((t, self.signal_strength(t)));
        }
        if let Some(t) = self.detect_histogram() {
            return Some((t, self.signal_strength(t)));
        }
        if let Some(t) = self.detect_momentum() {
            return Some((t, self.signal_strength(t)));
        }
        if let Some(t) = self.detect_trend_confirmation() {
            return Some((t, self.signal_strength(t)));
        }
        self.detect_divergence()
    }

    fn signal_strength(&self, signal_type: MacdSignalType) -> f64 {
        let v = &self.current;
        let strength = match signal_type {
            MacdSignalType::BullishCrossover | MacdSignalType::BearishCrossover => {
                ((v.macd - v.signal).abs() / CROSSOVER_SCALE).min(1.0)
            }
            MacdSignalType::ZeroLineCrossUp | MacdSignalType::ZeroLineCrossDown => {
                (v.macd.abs() / ZERO_CROSS_SCALE).min(1.0)
            }
            MacdSignalType::HistogramTurnPositive
            | MacdSignalType::HistogramTurnNegative
            | MacdSignalType::HistogramAcceleratingUp
            | MacdSignalType::HistogramAcceleratingDown => {
                (v.histogram_change.abs() / HISTOGRAM_SCALE).min(1.0)
            }
            MacdSignalType::MomentumAccelerationUp | MacdSignalType::MomentumAccelerationDown => {
                (v.histogram_change.abs() / MOMENTUM_SCALE).min(1.0)
            }
            MacdSignalType::DivergenceBullish | MacdSignalType::DivergenceBearish => 0.9,
            MacdSignalType::TrendConfirmationBullish | MacdSignalType::TrendConfirmationBearish => {
                0.5
            }
        };
        strength.clamp(0.0, 1.0)
    }

    fn should_emit(&self, signal_type: MacdSignalType) -> bool {
        match self.signals.back() {
            Some(last) if last.signal_type == signal_type => {
                last.emitted.elapsed() >= SIGNAL_COOLDOWN
            }
            _ => true,
        }
    }

    /// Emission filter: the histogram move must be at least half the
    /// acceleration threshold.
    fn passes_filter(&self) -> bool {
        self.current.histogram_change.abs() >= self.params.min_histogram_change / 2.0
    }

    fn should_close_position(&self) -> bool {
        if !self.in_position {
            return false;
        }
        let cur = &self.current;
        let prev = &self.previous;
        if self.position_side == OrderSide::Buy
            && cur.macd < cur.signal
            && prev.macd >= prev.signal
        {
            return true;
        }
        if self.position_side == OrderSide::Sell
            && cur.macd > cur.signal
            && prev.macd <= prev.signal
        {
            return true;
        }
        if cur.histogram_change.abs() > 2.0 * self.params.min_histogram_change {
            if self.position_side == OrderSide::Buy && cur.histogram_change < 0.0 {
                return true;
            }
            if self.position_side == OrderSide::Sell && cur.histogram_change > 0.0 {
                return true;
            }
        }
        false
    }
}

/// The MACD strategy.
pub struct MacdStrategy {
    core: StrategyCore,
    data: Mutex<MacdData>,
}

impl MacdStrategy {
    pub const NAME: &'static str = "MACD Strategy";

    pub fn new() -> Self {
        Self::with_params(MacdParams::default())
    }

    pub fn with_params(params: MacdParams) -> Self {
        Self { core: StrategyCore::new(Self::NAME), data: Mutex::new(MacdData::new(params)) }
    }

    pub fn params(&self) -> MacdParams {
        lock(&self.data).params.clone()
    }

    pub fn current_values(&self) -> MacdValues {
        lock(&self.data).current.clone()
    }

    pub fn current_trend(&self) -> MacdTrend {
        lock(&self.data).current_trend
    }

    pub fn history(&self, count: usize) -> Vec<MacdValues> {
        lock(&self.data).history.tail_cloned(count)
    }

    pub fn signal_history_len(&self) -> usize {
        lock(&self.data).signals.len()
    }

    /// Last `count` emitted signals, oldest first.
    pub fn signal_history(&self, count: usize) -> Vec<MacdSignalEvent> {
        lock(&self.data)
            .signals
            .tail(count)
            .iter()
            .map(|r| MacdSignalEvent {
                signal_type: r.signal_type,
                trend: r.trend,
                price: r.price,
                strength: r.strength,
                timestamp: r.timestamp,
            })
            .collect()
    }
}

/// Public view of one emitted MACD signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacdSignalEvent {
    pub signal_type: MacdSignalType,
    pub trend: MacdTrend,
    pub price: f64,
    pub strength: f64,
    pub timestamp: i64,
}

impl Default for MacdStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for MacdStrategy {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    fn description(&self) -> &'static str {
        "Moving average convergence divergence strategy"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Momentum
    }

    fn configure(&self, params: &Value) -> Result<(), StrategyError> {
        let mut data = lock(&self.data);
        let mut next = data.params.clone();

        merge_usize(params, "fast_period", &mut next.fast_period);
        merge_usize(params, "slow_period", &mut next.slow_period);
        merge_usize(params, "signal_period", &mut next.signal_period);
        merge_f64(params, "position_size", &mut next.position_size);
        merge_f64(params, "stop_loss_pct", &mut next.stop_loss_pct);
        merge_f64(params, "take_profit_pct", &mut next.take_profit_pct);
        merge_f64(params, "min_histogram_change", &mut next.min_histogram_change);
        merge_bool(params, "use_divergence", &mut next.use_divergence);
        merge_bool(params, "use_histogram_analysis", &mut next.use_histogram_analysis);
        merge_bool(params, "use_zero_line_cross", &mut next.use_zero_line_cross);
        merge_usize(params, "trend_confirmation_periods", &mut next.trend_confirmation_periods);
        merge_usize(params, "divergence_lookback", &mut next.divergence_lookback);

        next.validate()?;
        data.closes.set_cap(next.close_buffer_cap());
        data.macd_for_signal.set_cap(next.macd_buffer_cap());
        data.params = next;
        Ok(())
    }

    fn initialize(&self) {
        {
            let mut data = lock(&self.data);
            data.clear_market_state();
        }
        self.core.reset_metrics();
        self.core.set_initialized(true);
        let params = self.params();
        info!(
            strategy = Self::NAME,
            fast = params.fast_period,
            slow = params.slow_period,
            signal = params.signal_period,
            "initialized"
        );
    }

    fn reset(&self) {
        {
            let mut data = lock(&self.data);
            data.clear_market_state();
        }
        self.core.reset_metrics();
        debug!(strategy = Self::NAME, "reset");
    }

    fn update(&self, candles: &[Candle], ticker: &Ticker) -> Result<Signal, StrategyError> {
        if !self.core.is_initialized() || candles.is_empty() {
            return Ok(Signal::hold(Self::NAME, &ticker.symbol, "Strategy not initialized or no data"));
        }

        let outcome = {
            let mut data = lock(&self.data);

            for candle in candles {
                data.closes.push(candle.close);
            }

            if !data.has_sufficient_data() {
                return Ok(Signal::hold(
                    Self::NAME,
                    &ticker.symbol,
                    "Insufficient data for MACD calculation",
                ));
            }

            data.previous = data.current.clone();
            data.current = data.compute_values();

            if !data.current.is_valid {
                return Ok(Signal::hold(Self::NAME, &ticker.symbol, "Invalid MACD values calculated"));
            }

            data.current_trend = MacdData::trend_of(&data.current);
            let snapshot = data.current.clone();
            data.history.push(snapshot);
            let trend_label = data.current_trend.label();
            *data.trend_counts.entry(trend_label).or_insert(0) += 1;

            match data.classify_signal() {
                Some((signal_type, strength))
                    if data.should_emit(signal_type) && data.passes_filter() =>
                {
                    let kind = signal_type.direction();
                    let side = if kind == SignalKind::Buy { OrderSide::Buy } else { OrderSide::Sell };
                    let price = ticker.last_price;
                    let signal = Signal {
                        kind,
                        symbol: ticker.symbol.clone(),
                        price,
                        quantity: None,
                        size_fraction: data.params.position_size,
                        stop_loss: stop_loss_level(price, side, data.params.stop_loss_pct),
                        take_profit: take_profit_level(price, side, data.params.take_profit_pct),
                        strength,
                        strategy_name: Self::NAME.to_string(),
                        message: signal_type.label().to_string(),
                        timestamp: now_millis(),
                    };

                    *data.signal_counts.entry(signal_type.label()).or_insert(0) += 1;
                    let trend = data.current_trend;
                    data.signals.push(MacdSignalRecord {
                        signal_type,
                        trend,
                        price,
                        strength,
                        timestamp: signal.timestamp,
                        emitted: Instant::now(),
                    });

                    info!(
                        strategy = Self::NAME,
                        signal = signal_type.label(),
                        price,
                        macd = data.current.macd,
                        line = data.current.signal,
                        histogram = data.current.histogram,
                        trend = trend.label(),
                        "signal"
                    );
                    Some(signal)
                }
                _ => None,
            }
        };

        match outcome {
            Some(signal) => {
                self.core.notify_signal(&signal);
                Ok(signal)
            }
            None => Ok(Signal::hold(Self::NAME, &ticker.symbol, "")),
        }
    }

    fn on_position_opened(&self, position: &Position) {
        if position.strategy_name != Self::NAME {
            return;
        }
        {
            let mut data = lock(&self.data);
            data.in_position = true;
            data.position_side = position.side;
            data.position_id = position.id.clone();
        }
        info!(strategy = Self::NAME, position = %position.id, side = ?position.side, "position opened");
    }

    fn on_position_closed(&self, position: &Position, _exit_price: f64, pnl: f64) {
        if position.strategy_name != Self::NAME {
            return;
        }
        let matched = {
            let mut data = lock(&self.data);
            let matched = data.position_id == position.id;
            if matched {
                data.in_position = false;
                data.position_id.clear();
            }
            matched
        };
        if matched {
            let duration_ms = now_millis() - position.entry_time;
            self.core.record_trade(pnl, duration_ms);
            info!(strategy = Self::NAME, position = %position.id, pnl, "position closed");
        }
    }

    fn on_position_updated(&self, position: &Position) {
        if position.strategy_name != Self::NAME {
            return;
        }
        let close_signal = {
            let data = lock(&self.data);
            if data.position_id == position.id && data.should_close_position() {
                let kind = match data.position_side {
                    OrderSide::Buy => SignalKind::CloseLong,
                    OrderSide::Sell => SignalKind::CloseShort,
                };
                Some(Signal {
                    kind,
                    symbol: position.symbol.clone(),
                    price: position.current_price,
                    quantity: Some(position.quantity),
                    size_fraction: 0.0,
                    stop_loss: 0.0,
                    take_profit: 0.0,
                    strength: 1.0,
                    strategy_name: Self::NAME.to_string(),
                    message: "MACD close condition".to_string(),
                    timestamp: now_millis(),
                })
            } else {
                None
            }
        };
        if let Some(signal) = close_signal {
            self.core.notify_signal(&signal);
        }
    }

    fn validate_signal(&self, signal: &Signal) -> bool {
        if signal.strategy_name != Self::NAME {
            return false;
        }
        if signal.kind.is_hold() {
            return true;
        }
        if signal.strength < 0.3 {
            return false;
        }
        lock(&self.data).passes_filter()
    }

    fn position_size(&self, _symbol: &str, price: f64, available_balance: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        available_balance * lock(&self.data).params.position_size / price
    }

    fn snapshot(&self) -> Value {
        // Metrics are read before the data mutex is taken.
        let metrics = serde_json::to_value(self.core.metrics()).unwrap_or(Value::Null);
        let data = lock(&self.data);
        let history: Vec<Value> = data
            .history
            .tail(100)
            .iter()
            .map(|v| {
                json!({
                    "macd": v.macd,
                    "signal": v.signal,
                    "histogram": v.histogram,
                })
            })
            .collect();

        json!({
            "type": "MacdStrategy",
            "name": Self::NAME,
            "config": serde_json::to_value(&data.params).unwrap_or(Value::Null),
            "metrics": metrics,
            "in_position": data.in_position,
            "current_position_id": data.position_id,
            "current_values": serde_json::to_value(&data.current).unwrap_or(Value::Null),
            "current_trend": serde_json::to_value(data.current_trend).unwrap_or(Value::Null),
            "history": history,
        })
    }

    fn restore(&self, snapshot: &Value) -> Result<(), StrategyError> {
        if let Some(config) = snapshot.get("config") {
            let params: MacdParams = serde_json::from_value(config.clone())
                .map_err(|e| StrategyError::Persistence(e.to_string()))?;
            params.validate()?;
            let mut data = lock(&self.data);
            data.closes.set_cap(params.close_buffer_cap());
            data.macd_for_signal.set_cap(params.macd_buffer_cap());
            data.params = params;
        }

        let mut data = lock(&self.data);
        if let Some(v) = snapshot.get("in_position").and_then(Value::as_bool) {
            data.in_position = v;
        }
        if let Some(v) = snapshot.get("current_position_id").and_then(Value::as_str) {
            data.position_id = v.to_string();
        }
        if let Some(values) = snapshot.get("current_values") {
            if let Ok(values) = serde_json::from_value::<MacdValues>(values.clone()) {
                data.current = values;
            }
        }
        if let Some(trend) = snapshot.get("current_trend") {
            if let Ok(trend) = serde_json::from_value::<MacdTrend>(trend.clone()) {
                data.current_trend = trend;
            }
        }
        if let Some(entries) = snapshot.get("history").and_then(Value::as_array) {
            data.history.clear();
            for item in entries {
                data.history.push(MacdValues {
                    macd: item.get("macd").and_then(Value::as_f64).unwrap_or(0.0),
                    signal: item.get("signal").and_then(Value::as_f64).unwrap_or(0.0),
                    histogram: item.get("histogram").and_then(Value::as_f64).unwrap_or(0.0),
                    is_valid: true,
                    ..MacdValues::default()
                });
            }
        }
        Ok(())
    }

    fn required_indicators(&self) -> Vec<&'static str> {
        vec!["EMA", "MACD"]
    }

    fn custom_metrics(&self) -> BTreeMap<String, f64> {
        let data = lock(&self.data);
        let mut metrics = BTreeMap::new();
        metrics.insert("current_macd".to_string(), data.current.macd);
        metrics.insert("current_signal".to_string(), data.current.signal);
        metrics.insert("current_histogram".to_string(), data.current.histogram);
        metrics.insert("histogram_change".to_string(), data.current.histogram_change);
        for (label, count) in &data.signal_counts {
            metrics.insert(format!("signal_{label}"), *count as f64);
        }
        for (label, count) in &data.trend_counts {
            metrics.insert(format!("trend_{label}"), *count as f64);
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::candles_from_closes;

    fn active_strategy(params: MacdParams) -> MacdStrategy {
        let strategy = MacdStrategy::with_params(params);
        strategy.start();
        strategy
    }

    fn drive(strategy: &MacdStrategy, closes: &[f64]) -> Vec<Signal> {
        let candles = candles_from_closes(closes);
        candles
            .iter()
            .map(|c| {
                let ticker = Ticker::from_last("BTCUSDT", c.close, c.close_time);
                strategy.update(std::slice::from_ref(c), &ticker).unwrap()
            })
            .collect()
    }

    fn small_params() -> MacdParams {
        MacdParams {
            fast_period: 3,
            slow_period: 5,
            signal_period: 3,
            use_divergence: false,
            ..MacdParams::default()
        }
    }

    #[test]
    fn trend_classification_table() {
        let strong_bull = MacdValues { macd: 0.5, signal: 0.2, is_valid: true, ..MacdValues::default() };
        assert_eq!(MacdData::trend_of(&strong_bull), MacdTrend::StrongBullish);

        let bull = MacdValues { macd: -0.1, signal: -0.3, is_valid: true, ..MacdValues::default() };
        assert_eq!(MacdData::trend_of(&bull), MacdTrend::Bullish);

        let strong_bear = MacdValues { macd: -0.5, signal: -0.2, is_valid: true, ..MacdValues::default() };
        assert_eq!(MacdData::trend_of(&strong_bear), MacdTrend::StrongBearish);

        let bear = MacdValues { macd: 0.1, signal: 0.3, is_valid: true, ..MacdValues::default() };
        assert_eq!(MacdData::trend_of(&bear), MacdTrend::Bearish);

        let invalid = MacdValues::default();
        assert_eq!(MacdData::trend_of(&invalid), MacdTrend::Neutral);
    }

    #[test]
    fn bullish_crossover_fires_with_gap_strength() {
        let strategy = active_strategy(small_params());
        // Decline drags MACD below its signal line, then a sharp rally
        // lifts MACD back through it.
        let mut closes: Vec<f64> = (0..12).map(|i| 100.0 - i as f64).collect();
        for i in 0..6 {
            closes.push(89.0 + (i as f64 + 1.0) * 3.0);
        }
        let signals = drive(&strategy, &closes);

        let cross = signals
            .iter()
            .find(|s| s.message == "Bullish Crossover")
            .expect("expected a bullish crossover");
        assert_eq!(cross.kind, SignalKind::Buy);
        assert!(cross.strength > 0.0 && cross.strength <= 1.0);
    }

    #[test]
    fn crossover_strength_formula() {
        let mut data = MacdData::new(small_params());
        data.current = MacdValues { macd: 0.004, signal: 0.001, is_valid: true, ..MacdValues::default() };
        let strength = data.signal_strength(MacdSignalType::BullishCrossover);
        assert!((strength - 0.003 / CROSSOVER_SCALE).abs() < 1e-12);

        // Saturates at 1.
        data.current.macd = 1.0;
        assert_eq!(data.signal_strength(MacdSignalType::BullishCrossover), 1.0);
    }

    #[test]
    fn zero_line_cross_detected_when_enabled() {
        let mut data = MacdData::new(small_params());
        data.previous = MacdValues { macd: -0.002, signal: -0.001, is_valid: true, ..MacdValues::default() };
        data.current = MacdValues { macd: 0.003, signal: 0.004, is_valid: true, ..MacdValues::default() };
        // No signal-line cross here (macd stays below signal), so the
        // zero-line rule is reached.
        assert_eq!(data.detect_crossover(), None);
        assert_eq!(data.detect_zero_cross(), Some(MacdSignalType::ZeroLineCrossUp));

        data.params.use_zero_line_cross = false;
        assert_eq!(data.detect_zero_cross(), None);
    }

    #[test]
    fn histogram_turn_fires_on_sign_change() {
        let mut data = MacdData::new(small_params());
        data.previous = MacdValues { histogram: -0.002, is_valid: true, ..MacdValues::default() };
        data.current =
            MacdValues { histogram: 0.003, histogram_change: 0.005, is_valid: true, ..MacdValues::default() };
        assert_eq!(data.detect_histogram(), Some(MacdSignalType::HistogramTurnPositive));

        // Same sign, large positive change while positive: acceleration.
        data.previous.histogram = 0.001;
        assert_eq!(data.detect_histogram(), Some(MacdSignalType::HistogramAcceleratingUp));

        data.params.use_histogram_analysis = false;
        assert_eq!(data.detect_histogram(), None);
    }

    #[test]
    fn trend_confirmation_needs_two_thirds() {
        let mut data = MacdData::new(MacdParams {
            trend_confirmation_periods: 3,
            ..small_params()
        });
        // Two of three strongly bullish snapshots confirm.
        for (macd, signal) in [(0.5, 0.2), (0.6, 0.3), (-0.1, 0.2)] {
            data.history.push(MacdValues { macd, signal, is_valid: true, ..MacdValues::default() });
        }
        assert_eq!(
            data.detect_trend_confirmation(),
            Some(MacdSignalType::TrendConfirmationBullish)
        );

        // Mixed trends with no 2/3 majority: no confirmation.
        data.history.clear();
        for (macd, signal) in [(0.5, 0.2), (-0.6, -0.3), (0.1, 0.3)] {
            data.history.push(MacdValues { macd, signal, is_valid: true, ..MacdValues::default() });
        }
        assert_eq!(data.detect_trend_confirmation(), None);
    }

    #[test]
    fn close_trigger_on_opposing_crossover() {
        let mut data = MacdData::new(small_params());
        data.in_position = true;
        data.position_side = OrderSide::Buy;
        data.previous = MacdValues { macd: 0.5, signal: 0.2, is_valid: true, ..MacdValues::default() };
        data.current = MacdValues { macd: 0.1, signal: 0.2, is_valid: true, ..MacdValues::default() };
        assert!(data.should_close_position());
    }

    #[test]
    fn close_trigger_on_large_histogram_swing_against_side() {
        let mut data = MacdData::new(small_params());
        data.in_position = true;
        data.position_side = OrderSide::Buy;
        // No crossover, but the histogram lurches down hard.
        data.previous = MacdValues { macd: 0.5, signal: 0.2, is_valid: true, ..MacdValues::default() };
        data.current = MacdValues {
            macd: 0.4,
            signal: 0.2,
            histogram_change: -0.01,
            is_valid: true,
            ..MacdValues::default()
        };
        assert!(data.should_close_position());

        // The same swing upward does not close a long.
        data.current.histogram_change = 0.01;
        assert!(!data.should_close_position());
    }

    #[test]
    fn preset_params_are_valid() {
        for params in [
            MacdParams::default(),
            MacdParams::scalping(),
            MacdParams::swing(),
            MacdParams::conservative(),
            MacdParams::aggressive(),
        ] {
            params.validate().unwrap();
        }
        assert_eq!(MacdParams::scalping().signal_period, 5);
        assert_eq!(MacdParams::swing().position_size, 0.15);
        assert_eq!(MacdParams::conservative().min_histogram_change, 0.001);
        assert_eq!(MacdParams::aggressive().trend_confirmation_periods, 2);
    }

    #[test]
    fn configure_rejects_fast_not_below_slow() {
        let strategy = MacdStrategy::new();
        let result = strategy.configure(&json!({ "fast_period": 26, "slow_period": 12 }));
        assert!(matches!(result, Err(StrategyError::Configuration(_))));
        assert!(strategy.configure(&json!({ "fast_period": 0 })).is_err());
    }

    #[test]
    fn buffers_stay_bounded() {
        let strategy = active_strategy(small_params());
        let closes: Vec<f64> = (0..600).map(|i| 100.0 + (i as f64 * 0.3).sin() * 6.0).collect();
        drive(&strategy, &closes);

        let data = lock(&strategy.data);
        assert!(data.closes.len() <= data.params.close_buffer_cap());
        assert!(data.macd_for_signal.len() <= data.params.macd_buffer_cap());
        assert!(data.history.len() <= 500);
        assert!(data.signals.len() <= 100);
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let strategy = active_strategy(small_params());
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64 * 0.4).cos() * 2.0).collect();
        drive(&strategy, &closes);

        let snapshot = strategy.snapshot();
        let fresh = MacdStrategy::new();
        fresh.restore(&snapshot).unwrap();

        assert_eq!(fresh.params(), strategy.params());
        assert_eq!(fresh.current_values().macd, strategy.current_values().macd);
        assert_eq!(fresh.current_trend(), strategy.current_trend());
    }

    #[test]
    fn insufficient_data_emits_explanatory_hold() {
        let strategy = active_strategy(MacdParams::default());
        let closes = [100.0, 101.0, 102.0];
        let candles = candles_from_closes(&closes);
        let ticker = Ticker::from_last("BTCUSDT", 102.0, 0);
        let signal = strategy.update(&candles, &ticker).unwrap();
        assert!(signal.kind.is_hold());
        assert_eq!(signal.message, "Insufficient data for MACD calculation");
    }
}
