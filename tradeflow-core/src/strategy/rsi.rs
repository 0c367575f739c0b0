//! RSI strategy — zone, divergence and momentum signals over the
//! Relative Strength Index.
//!
//! The strategy maintains a rolling close buffer, recomputes RSI on every
//! update, classifies the value into one of six zones and emits a signal on
//! the first matching rule: zone entry, zone exit, extreme reversal,
//! momentum, divergence. Same-kind emissions are throttled to one per ten
//! minutes.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::domain::{now_millis, Candle, OrderSide, Position, Signal, SignalKind, Ticker};
use crate::indicators::{rsi, wilder_smoothing};
use crate::strategy::history::BoundedSeries;
use crate::strategy::{
    lock, merge_bool, merge_f64, merge_usize, stop_loss_level, take_profit_level, Strategy,
    StrategyCore, StrategyError, StrategyKind,
};

/// Same-kind signal cooldown.
const SIGNAL_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// Parameters for the RSI strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsiParams {
    pub period: usize,
    pub oversold: f64,
    pub overbought: f64,
    pub extreme_oversold: f64,
    pub extreme_overbought: f64,
    /// Fraction of balance per trade.
    pub position_size: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Minimum |ΔRSI| for momentum signals; half of it gates any emission.
    pub min_rsi_change: f64,
    pub use_divergence: bool,
    pub divergence_lookback: usize,
}

impl Default for RsiParams {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: 30.0,
            overbought: 70.0,
            extreme_oversold: 20.0,
            extreme_overbought: 80.0,
            position_size: 0.1,
            stop_loss_pct: 2.0,
            take_profit_pct: 4.0,
            min_rsi_change: 5.0,
            use_divergence: true,
            divergence_lookback: 20,
        }
    }
}

impl RsiParams {
    /// Short period, tight thresholds, divergence off.
    pub fn scalping() -> Self {
        Self {
            period: 7,
            oversold: 25.0,
            overbought: 75.0,
            extreme_oversold: 15.0,
            extreme_overbought: 85.0,
            position_size: 0.05,
            stop_loss_pct: 0.5,
            take_profit_pct: 1.0,
            min_rsi_change: 3.0,
            use_divergence: false,
            ..Self::default()
        }
    }

    /// Longer period, wider bands.
    pub fn swing() -> Self {
        Self {
            period: 21,
            oversold: 35.0,
            overbought: 65.0,
            extreme_oversold: 25.0,
            extreme_overbought: 75.0,
            position_size: 0.15,
            stop_loss_pct: 3.0,
            take_profit_pct: 6.0,
            ..Self::default()
        }
    }

    /// Tight thresholds, small size, high change bar.
    pub fn conservative() -> Self {
        Self {
            oversold: 25.0,
            overbought: 75.0,
            extreme_oversold: 15.0,
            extreme_overbought: 85.0,
            position_size: 0.08,
            stop_loss_pct: 1.5,
            take_profit_pct: 3.0,
            min_rsi_change: 8.0,
            ..Self::default()
        }
    }

    /// Short period, narrow bands, large size.
    pub fn aggressive() -> Self {
        Self {
            period: 10,
            oversold: 35.0,
            overbought: 65.0,
            extreme_oversold: 25.0,
            extreme_overbought: 75.0,
            position_size: 0.2,
            stop_loss_pct: 3.0,
            take_profit_pct: 6.0,
            min_rsi_change: 3.0,
            ..Self::default()
        }
    }

    /// Standard bands, divergence off, wider exits.
    pub fn mean_reversion() -> Self {
        Self {
            position_size: 0.12,
            stop_loss_pct: 2.5,
            take_profit_pct: 5.0,
            use_divergence: false,
            ..Self::default()
        }
    }

    /// Compressed bands so divergences fire well before the extremes.
    pub fn divergence_hunter() -> Self {
        Self {
            oversold: 40.0,
            overbought: 60.0,
            extreme_oversold: 30.0,
            extreme_overbought: 70.0,
            min_rsi_change: 10.0,
            use_divergence: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        if !(2..=50).contains(&self.period) {
            return Err(StrategyError::Configuration(
                "RSI period must be between 2 and 50".into(),
            ));
        }
        if self.oversold >= self.overbought {
            return Err(StrategyError::Configuration(
                "oversold threshold must be less than overbought threshold".into(),
            ));
        }
        if self.extreme_oversold >= self.oversold {
            return Err(StrategyError::Configuration(
                "extreme oversold must be less than oversold threshold".into(),
            ));
        }
        if self.extreme_overbought <= self.overbought {
            return Err(StrategyError::Configuration(
                "extreme overbought must be greater than overbought threshold".into(),
            ));
        }
        Ok(())
    }

    fn close_buffer_cap(&self) -> usize {
        (self.period * 3).max(200)
    }
}

/// Zone classification of an RSI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RsiZone {
    ExtremeOversold,
    Oversold,
    NeutralLow,
    NeutralHigh,
    Overbought,
    ExtremeOverbought,
}

impl RsiZone {
    pub fn label(&self) -> &'static str {
        match self {
            RsiZone::ExtremeOversold => "Extreme Oversold",
            RsiZone::Oversold => "Oversold",
            RsiZone::NeutralLow => "Neutral Low",
            RsiZone::NeutralHigh => "Neutral High",
            RsiZone::Overbought => "Overbought",
            RsiZone::ExtremeOverbought => "Extreme Overbought",
        }
    }

    fn is_oversold_side(&self) -> bool {
        matches!(self, RsiZone::Oversold | RsiZone::ExtremeOversold)
    }

    fn is_overbought_side(&self) -> bool {
        matches!(self, RsiZone::Overbought | RsiZone::ExtremeOverbought)
    }

    fn is_neutral(&self) -> bool {
        matches!(self, RsiZone::NeutralLow | RsiZone::NeutralHigh)
    }
}

/// Typed RSI signal, prior to mapping onto the generic `SignalKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RsiSignalType {
    BuyOversold,
    SellOverbought,
    BuyOversoldExit,
    SellOverboughtExit,
    ExtremeReversalBuy,
    ExtremeReversalSell,
    MomentumBullish,
    MomentumBearish,
    DivergenceBullish,
    DivergenceBearish,
}

impl RsiSignalType {
    pub fn label(&self) -> &'static str {
        match self {
            RsiSignalType::BuyOversold => "Buy Oversold",
            RsiSignalType::SellOverbought => "Sell Overbought",
            RsiSignalType::BuyOversoldExit => "Buy Oversold Exit",
            RsiSignalType::SellOverboughtExit => "Sell Overbought Exit",
            RsiSignalType::ExtremeReversalBuy => "Extreme Reversal Buy",
            RsiSignalType::ExtremeReversalSell => "Extreme Reversal Sell",
            RsiSignalType::MomentumBullish => "Bullish Momentum",
            RsiSignalType::MomentumBearish => "Bearish Momentum",
            RsiSignalType::DivergenceBullish => "Bullish Divergence",
            RsiSignalType::DivergenceBearish => "Bearish Divergence",
        }
    }

    pub fn direction(&self) -> SignalKind {
        match self {
            RsiSignalType::BuyOversold
            | RsiSignalType::BuyOversoldExit
            | RsiSignalType::ExtremeReversalBuy
            | RsiSignalType::MomentumBullish
            | RsiSignalType::DivergenceBullish => SignalKind::Buy,
            RsiSignalType::SellOverbought
            | RsiSignalType::SellOverboughtExit
            | RsiSignalType::ExtremeReversalSell
            | RsiSignalType::MomentumBearish
            | RsiSignalType::DivergenceBearish => SignalKind::Sell,
        }
    }
}

/// One computed RSI snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsiValues {
    pub rsi: f64,
    pub previous_rsi: f64,
    pub change: f64,
    pub average_gain: f64,
    pub average_loss: f64,
    pub period_count: usize,
    pub is_valid: bool,
}

impl Default for RsiValues {
    fn default() -> Self {
        Self {
            rsi: 50.0,
            previous_rsi: 50.0,
            change: 0.0,
            average_gain: 0.0,
            average_loss: 0.0,
            period_count: 0,
            is_valid: false,
        }
    }
}

/// Emitted-signal record kept in the rolling history.
#[derive(Debug, Clone)]
struct RsiSignalRecord {
    signal_type: RsiSignalType,
    zone: RsiZone,
    price: f64,
    strength: f64,
    timestamp: i64,
    emitted: Instant,
}

/// Everything guarded by the data mutex.
struct RsiData {
    params: RsiParams,
    closes: BoundedSeries<f64>,
    history: BoundedSeries<RsiValues>,
    signals: BoundedSeries<RsiSignalRecord>,
    current: RsiValues,
    previous: RsiValues,
    current_zone: RsiZone,
    previous_zone: RsiZone,
    in_position: bool,
    position_side: OrderSide,
    position_id: String,
    signal_counts: BTreeMap<&'static str, u64>,
    zone_counts: BTreeMap<&'static str, u64>,
    oversold_entries: u64,
    overbought_entries: u64,
    divergence_signals: u64,
}

impl RsiData {
    fn new(params: RsiParams) -> Self {
        let cap = params.close_buffer_cap();
        Self {
            params,
            closes: BoundedSeries::new(cap),
            history: BoundedSeries::new(500),
            signals: BoundedSeries::new(100),
            current: RsiValues::default(),
            previous: RsiValues::default(),
            current_zone: RsiZone::NeutralLow,
            previous_zone: RsiZone::NeutralLow,
            in_position: false,
            position_side: OrderSide::Buy,
            position_id: String::new(),
            signal_counts: BTreeMap::new(),
            zone_counts: BTreeMap::new(),
            oversold_entries: 0,
            overbought_entries: 0,
            divergence_signals: 0,
        }
    }

    fn clear_market_state(&mut self) {
        self.closes.clear();
        self.closes.set_cap(self.params.close_buffer_cap());
        self.history.clear();
        self.signals.clear();
        self.current = RsiValues::default();
        self.previous = RsiValues::default();
        self.current_zone = RsiZone::NeutralLow;
        self.previous_zone = RsiZone::NeutralLow;
        self.in_position = false;
        self.position_id.clear();
        self.signal_counts.clear();
        self.zone_counts.clear();
        self.oversold_entries = 0;
        self.overbought_entries = 0;
        self.divergence_signals = 0;
    }

    fn has_sufficient_data(&self) -> bool {
        self.closes.len() >= self.params.period + 1
    }

    fn zone_of(&self, value: f64) -> RsiZone {
        let p = &self.params;
        if value <= p.extreme_oversold {
            RsiZone::ExtremeOversold
        } else if value <= p.oversold {
            RsiZone::Oversold
        } else if value < 50.0 {
            RsiZone::NeutralLow
        } else if value < p.overbought {
            RsiZone::NeutralHigh
        } else if value < p.extreme_overbought {
            RsiZone::Overbought
        } else {
            RsiZone::ExtremeOverbought
        }
    }

    fn compute_values(&self) -> RsiValues {
        let closes = self.closes.as_vec();
        let period = self.params.period;
        let value = rsi(&closes, period);

        let mut gains = Vec::with_capacity(period);
        let mut losses = Vec::with_capacity(period);
        for i in closes.len() - period..closes.len() {
            let change = closes[i] - closes[i - 1];
            gains.push(change.max(0.0));
            losses.push((-change).max(0.0));
        }

        RsiValues {
            rsi: value,
            previous_rsi: self.current.rsi,
            change: value - self.current.rsi,
            average_gain: wilder_smoothing(&gains, period),
            average_loss: wilder_smoothing(&losses, period),
            period_count: closes.len(),
            is_valid: (0.0..=100.0).contains(&value),
        }
    }

    /// Direction flip over the last `periods` history entries.
    fn is_reversing(&self, periods: usize) -> bool {
        if self.history.len() < periods + 1 {
            return false;
        }
        let tail = self.history.tail(periods);
        let mut was_increasing = true;
        let mut was_decreasing = true;
        for pair in tail.windows(2) {
            if pair[1].rsi <= pair[0].rsi {
                was_increasing = false;
            }
            if pair[1].rsi >= pair[0].rsi {
                was_decreasing = false;
            }
        }
        let current_change = self.current.change;
        (was_increasing && current_change < 0.0) || (was_decreasing && current_change > 0.0)
    }

    /// First matching rule wins: zone entry, zone exit, extreme reversal,
    /// momentum, divergence.
    fn classify_signal(&self) -> Option<(RsiSignalType, f64)> {
        if !self.current.is_valid || !self.previous.is_valid {
            return None;
        }
        let cur = self.current_zone;
        let prev = self.previous_zone;

        // 1. Zone entry.
        if cur == RsiZone::Oversold && !prev.is_oversold_side() {
            let t = RsiSignalType::BuyOversold;
            return Some((t, self.signal_strength(t, None)));
        }
        if cur == RsiZone::Overbought && !prev.is_overbought_side() {
            let t = RsiSignalType::SellOverbought;
            return Some((t, self.signal_strength(t, None)));
        }

        // 2. Zone exit.
        if prev.is_oversold_side() && cur.is_neutral() {
            let t = RsiSignalType::BuyOversoldExit;
            return Some((t, self.signal_strength(t, None)));
        }
        if prev.is_overbought_side() && cur.is_neutral() {
            let t = RsiSignalType::SellOverboughtExit;
            return Some((t, self.signal_strength(t, None)));
        }

        // 3. Extreme reversal.
        if cur == RsiZone::ExtremeOversold && self.is_reversing(3) {
            let t = RsiSignalType::ExtremeReversalBuy;
            return Some((t, self.signal_strength(t, None)));
        }
        if cur == RsiZone::ExtremeOverbought && self.is_reversing(3) {
            let t = RsiSignalType::ExtremeReversalSell;
            return Some((t, self.signal_strength(t, None)));
        }

        // 4. Momentum acceleration.
        let min_change = self.params.min_rsi_change;
        if self.current.change > min_change
            && self.current.change > self.previous.change
            && self.current.rsi > 50.0
        {
            let t = RsiSignalType::MomentumBullish;
            return Some((t, self.signal_strength(t, None)));
        }
        if self.current.change < -min_change
            && self.current.change < self.previous.change
            && self.current.rsi < 50.0
        {
            let t = RsiSignalType::MomentumBearish;
            return Some((t, self.signal_strength(t, None)));
        }

        // 5. Divergence.
        if self.params.use_divergence {
            if let Some((t, strength)) = self.detect_divergence() {
                return Some((t, strength));
            }
        }

        None
    }

    /// Three-point pivot divergence over the configured lookback: price lows
    /// descending while RSI lows ascend is bullish; the mirror is bearish.
    fn detect_divergence(&self) -> Option<(RsiSignalType, f64)> {
        let lookback = self.params.divergence_lookback;
        if self.closes.len() < lookback + 2 || self.history.len() < lookback + 2 {
            return None;
        }

        let closes = self.closes.as_vec();
        let rsis: Vec<f64> = self.history.iter().map(|v| v.rsi).collect();

        let (price_highs, price_lows) = find_pivots(&closes, lookback);
        let (rsi_highs, rsi_lows) = find_pivots(&rsis, lookback);

        if price_lows.len() >= 2 && rsi_lows.len() >= 2 {
            let (pp, pl) = (price_lows[price_lows.len() - 2], price_lows[price_lows.len() - 1]);
            let (rp, rl) = (rsi_lows[rsi_lows.len() - 2], rsi_lows[rsi_lows.len() - 1]);
            if closes[pl] < closes[pp] && rsis[rl] > rsis[rp] {
                let strength = ((50.0 - rsis[rl]) / 30.0).min(1.0).max(0.1);
                return Some((RsiSignalType::DivergenceBullish, strength));
            }
        }

        if price_highs.len() >= 2 && rsi_highs.len() >= 2 {
            let (pp, ph) = (price_highs[price_highs.len() - 2], price_highs[price_highs.len() - 1]);
            let (rp, rh) = (rsi_highs[rsi_highs.len() - 2], rsi_highs[rsi_highs.len() - 1]);
            if closes[ph] > closes[pp] && rsis[rh] < rsis[rp] {
                let strength = ((rsis[rh] - 50.0) / 30.0).min(1.0).max(0.1);
                return Some((RsiSignalType::DivergenceBearish, strength));
            }
        }

        None
    }

    fn signal_strength(&self, signal_type: RsiSignalType, divergence: Option<f64>) -> f64 {
        let p = &self.params;
        let v = &self.current;
        let strength = match signal_type {
            RsiSignalType::BuyOversold => ((p.oversold - v.rsi) / p.oversold).max(0.0),
            RsiSignalType::SellOverbought => {
                ((v.rsi - p.overbought) / (100.0 - p.overbought)).max(0.0)
            }
            RsiSignalType::ExtremeReversalBuy | RsiSignalType::ExtremeReversalSell => 0.9,
            RsiSignalType::DivergenceBullish | RsiSignalType::DivergenceBearish => {
                divergence.unwrap_or(0.8)
            }
            RsiSignalType::MomentumBullish | RsiSignalType::MomentumBearish => {
                (v.change.abs() / 20.0).min(1.0)
            }
            _ => 0.5,
        };
        strength.clamp(0.0, 1.0)
    }

    /// Same-kind cooldown on a monotonic clock.
    fn should_emit(&self, signal_type: RsiSignalType) -> bool {
        match self.signals.back() {
            Some(last) if last.signal_type == signal_type => {
                last.emitted.elapsed() >= SIGNAL_COOLDOWN
            }
            _ => true,
        }
    }

    /// Emission filter: the RSI move must be at least half the momentum
    /// threshold, otherwise the signal is noise.
    fn passes_filter(&self) -> bool {
        self.current.change.abs() >= self.params.min_rsi_change / 2.0
    }

    fn should_close_position(&self) -> bool {
        if !self.in_position {
            return false;
        }
        if self.position_side == OrderSide::Buy && self.current.rsi >= self.params.overbought {
            return true;
        }
        if self.position_side == OrderSide::Sell && self.current.rsi <= self.params.oversold {
            return true;
        }
        self.is_reversing(2)
    }
}

/// Local maxima/minima with a 3-point window over the last `lookback`
/// values; returns indices into the original slice. Shared with the MACD
/// strategy's divergence detector.
pub(crate) fn find_pivots(values: &[f64], lookback: usize) -> (Vec<usize>, Vec<usize>) {
    let mut highs = Vec::new();
    let mut lows = Vec::new();
    if values.len() < lookback + 2 {
        return (highs, lows);
    }
    let start = values.len() - lookback;
    for i in start.max(1)..values.len() - 1 {
        if values[i] > values[i - 1] && values[i] > values[i + 1] {
            highs.push(i);
        }
        if values[i] < values[i - 1] && values[i] < values[i + 1] {
            lows.push(i);
        }
    }
    (highs, lows)
}

/// The RSI strategy.
pub struct RsiStrategy {
    core: StrategyCore,
    data: Mutex<RsiData>,
}

impl RsiStrategy {
    pub const NAME: &'static str = "RSI Strategy";

    pub fn new() -> Self {
        Self::with_params(RsiParams::default())
    }

    pub fn with_params(params: RsiParams) -> Self {
        Self { core: StrategyCore::new(Self::NAME), data: Mutex::new(RsiData::new(params)) }
    }

    pub fn params(&self) -> RsiParams {
        lock(&self.data).params.clone()
    }

    pub fn current_values(&self) -> RsiValues {
        lock(&self.data).current.clone()
    }

    pub fn current_zone(&self) -> RsiZone {
        lock(&self.data).current_zone
    }

    /// Last `count` RSI snapshots, oldest first.
    pub fn history(&self, count: usize) -> Vec<RsiValues> {
        lock(&self.data).history.tail_cloned(count)
    }

    pub fn signal_history_len(&self) -> usize {
        lock(&self.data).signals.len()
    }

    /// Last `count` emitted signals, oldest first.
    pub fn signal_history(&self, count: usize) -> Vec<RsiSignalEvent> {
        lock(&self.data)
            .signals
            .tail(count)
            .iter()
            .map(|r| RsiSignalEvent {
                signal_type: r.signal_type,
                zone: r.zone,
                price: r.price,
                strength: r.strength,
                timestamp: r.timestamp,
            })
            .collect()
    }
}

/// Public view of one emitted RSI signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsiSignalEvent {
    pub signal_type: RsiSignalType,
    pub zone: RsiZone,
    pub price: f64,
    pub strength: f64,
    pub timestamp: i64,
}

impl Default for RsiStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RsiStrategy {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    fn description(&self) -> &'static str {
        "Relative Strength Index strategy"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::MeanReversion
    }

    fn configure(&self, params: &Value) -> Result<(), StrategyError> {
        let mut data = lock(&self.data);
        let mut next = data.params.clone();

        merge_usize(params, "period", &mut next.period);
        merge_f64(params, "oversold", &mut next.oversold);
        merge_f64(params, "overbought", &mut next.overbought);
        merge_f64(params, "extreme_oversold", &mut next.extreme_oversold);
        merge_f64(params, "extreme_overbought", &mut next.extreme_overbought);
        merge_f64(params, "position_size", &mut next.position_size);
        merge_f64(params, "stop_loss_pct", &mut next.stop_loss_pct);
        merge_f64(params, "take_profit_pct", &mut next.take_profit_pct);
        merge_f64(params, "min_rsi_change", &mut next.min_rsi_change);
        merge_bool(params, "use_divergence", &mut next.use_divergence);
        merge_usize(params, "divergence_lookback", &mut next.divergence_lookback);

        next.validate()?;
        data.closes.set_cap(next.close_buffer_cap());
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
            period = params.period,
            oversold = params.oversold,
            overbought = params.overbought,
            divergence = params.use_divergence,
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
                    "Insufficient data for RSI calculation",
                ));
            }

            data.previous = data.current.clone();
            data.previous_zone = data.current_zone;
            data.current = data.compute_values();

            if !data.current.is_valid {
                return Ok(Signal::hold(Self::NAME, &ticker.symbol, "Invalid RSI values calculated"));
            }

            data.current_zone = data.zone_of(data.current.rsi);
            let snapshot = data.current.clone();
            data.history.push(snapshot);
            let zone_label = data.current_zone.label();
            *data.zone_counts.entry(zone_label).or_insert(0) += 1;

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
                    match signal_type {
                        RsiSignalType::BuyOversold | RsiSignalType::BuyOversoldExit => {
                            data.oversold_entries += 1
                        }
                        RsiSignalType::SellOverbought | RsiSignalType::SellOverboughtExit => {
                            data.overbought_entries += 1
                        }
                        RsiSignalType::DivergenceBullish | RsiSignalType::DivergenceBearish => {
                            data.divergence_signals += 1
                        }
                        _ => {}
                    }

                    let zone = data.current_zone;
                    data.signals.push(RsiSignalRecord {
                        signal_type,
                        zone,
                        price,
                        strength,
                        timestamp: signal.timestamp,
                        emitted: Instant::now(),
                    });

                    info!(
                        strategy = Self::NAME,
                        signal = signal_type.label(),
                        price,
                        rsi = data.current.rsi,
                        change = data.current.change,
                        zone = zone.label(),
                        "signal"
                    );
                    Some(signal)
                }
                _ => None,
            }
        };

        // Callback runs with the data mutex released.
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
        let rsi_now = {
            let mut data = lock(&self.data);
            data.in_position = true;
            data.position_side = position.side;
            data.position_id = position.id.clone();
            data.current.rsi
        };
        info!(strategy = Self::NAME, position = %position.id, side = ?position.side, rsi = rsi_now, "position opened");
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
            // Metrics mutex is taken only after the data mutex is released.
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
                    message: "RSI close condition".to_string(),
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
                    "rsi": v.rsi,
                    "change": v.change,
                    "average_gain": v.average_gain,
                    "average_loss": v.average_loss,
                })
            })
            .collect();

        json!({
            "type": "RsiStrategy",
            "name": Self::NAME,
            "config": serde_json::to_value(&data.params).unwrap_or(Value::Null),
            "metrics": metrics,
            "in_position": data.in_position,
            "current_position_id": data.position_id,
            "current_rsi": data.current.rsi,
            "current_zone": serde_json::to_value(data.current_zone).unwrap_or(Value::Null),
            "history": history,
        })
    }

    fn restore(&self, snapshot: &Value) -> Result<(), StrategyError> {
        if let Some(config) = snapshot.get("config") {
            let params: RsiParams = serde_json::from_value(config.clone())
                .map_err(|e| StrategyError::Persistence(e.to_string()))?;
            params.validate()?;
            let mut data = lock(&self.data);
            data.closes.set_cap(params.close_buffer_cap());
            data.params = params;
        }

        let mut data = lock(&self.data);
        if let Some(v) = snapshot.get("in_position").and_then(Value::as_bool) {
            data.in_position = v;
        }
        if let Some(v) = snapshot.get("current_position_id").and_then(Value::as_str) {
            data.position_id = v.to_string();
        }
        if let Some(v) = snapshot.get("current_rsi").and_then(Value::as_f64) {
            data.current.rsi = v;
            data.current.is_valid = true;
        }
        if let Some(zone) = snapshot.get("current_zone") {
            if let Ok(zone) = serde_json::from_value::<RsiZone>(zone.clone()) {
                data.current_zone = zone;
            }
        }
        if let Some(entries) = snapshot.get("history").and_then(Value::as_array) {
            data.history.clear();
            for item in entries {
                data.history.push(RsiValues {
                    rsi: item.get("rsi").and_then(Value::as_f64).unwrap_or(50.0),
                    previous_rsi: 50.0,
                    change: item.get("change").and_then(Value::as_f64).unwrap_or(0.0),
                    average_gain: item.get("average_gain").and_then(Value::as_f64).unwrap_or(0.0),
                    average_loss: item.get("average_loss").and_then(Value::as_f64).unwrap_or(0.0),
                    period_count: 0,
                    is_valid: true,
                });
            }
        }
        Ok(())
    }

    fn required_indicators(&self) -> Vec<&'static str> {
        vec!["RSI"]
    }

    fn custom_metrics(&self) -> BTreeMap<String, f64> {
        let data = lock(&self.data);
        let mut metrics = BTreeMap::new();
        metrics.insert("current_rsi".to_string(), data.current.rsi);
        metrics.insert("rsi_change".to_string(), data.current.change);
        metrics.insert("oversold_entries".to_string(), data.oversold_entries as f64);
        metrics.insert("overbought_entries".to_string(), data.overbought_entries as f64);
        metrics.insert("divergence_signals".to_string(), data.divergence_signals as f64);
        for (label, count) in &data.signal_counts {
            metrics.insert(format!("signal_{label}"), *count as f64);
        }
        for (label, count) in &data.zone_counts {
            metrics.insert(format!("zone_{label}"), *count as f64);
        }
        metrics
    }
}
