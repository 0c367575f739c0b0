//! SMA strategy — dual/triple moving-average crossover and trend engine.
//!
//! Maintains rolling close and volume buffers, recomputes fast/slow (and
//! optionally long) SMAs with their least-squares slopes on every update,
//! classifies the trend from the MA spread, and emits on the first matching
//! rule: golden/death cross, trend acceleration/deceleration, pullback,
//! triple-MA alignment (on its transition edge). Same-kind emissions are
//! throttled to one per fifteen minutes.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::domain::{now_millis, Candle, OrderSide, Position, Signal, SignalKind, Ticker};
use crate::indicators::{linreg_slope, sma};
use crate::strategy::history::BoundedSeries;
use crate::strategy::{
    lock, merge_bool, merge_f64, merge_usize, stop_loss_level, take_profit_level, Strategy,
    StrategyCore, StrategyError, StrategyKind,
};

/// Same-kind signal cooldown.
const SIGNAL_COOLDOWN: Duration = Duration::from_secs(15 * 60);

/// Number of samples in the MA slope regression.
const SLOPE_WINDOW: usize = 3;

/// Volume average window for the volume filter.
const VOLUME_WINDOW: usize = 20;

/// Pullback tolerance: last close within 0.5% of the fast MA.
const PULLBACK_TOLERANCE: f64 = 0.005;

/// Spread thresholds (percent) separating weak and strong trends.
const WEAK_TREND_SPREAD_PCT: f64 = 0.5;
const STRONG_TREND_SPREAD_PCT: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmaParams {
    pub fast_period: usize,
    pub slow_period: usize,
    /// Only consulted when `use_triple_ma` is set.
    pub long_period: usize,
    pub position_size: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub use_triple_ma: bool,
    pub use_slope_filter: bool,
    pub min_slope: f64,
    pub use_volume_filter: bool,
    /// Multiplier over the rolling average volume.
    pub volume_threshold: f64,
}

impl Default for SmaParams {
    fn default() -> Self {
        Self {
            fast_period: 10,
            slow_period: 20,
            long_period: 50,
            position_size: 0.1,
            stop_loss_pct: 2.0,
            take_profit_pct: 4.0,
            use_triple_ma: false,
            use_slope_filter: true,
            min_slope: 0.001,
            use_volume_filter: false,
            volume_threshold: 1.5,
        }
    }
}

impl SmaParams {
    /// Three-average trend following.
    pub fn triple() -> Self {
        Self { use_triple_ma: true, ..Self::default() }
    }

    /// Fast crossover pair for short timeframes.
    pub fn scalping() -> Self {
        Self {
            fast_period: 5,
            slow_period: 10,
            long_period: 20,
            position_size: 0.05,
            stop_loss_pct: 0.5,
            take_profit_pct: 1.0,
            min_slope: 0.002,
            use_volume_filter: true,
            volume_threshold: 2.0,
            ..Self::default()
        }
    }

    /// Slow triple-MA set for multi-day holds.
    pub fn swing() -> Self {
        Self {
            fast_period: 20,
            slow_period: 50,
            long_period: 100,
            position_size: 0.15,
            stop_loss_pct: 3.0,
            take_profit_pct: 6.0,
            use_triple_ma: true,
            min_slope: 0.0005,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.fast_period == 0 {
            return Err(StrategyError::Configuration("fast period must be >= 1".into()));
        }
        if self.fast_period >= self.slow_period {
            return Err(StrategyError::Configuration(
                "fast period must be less than slow period".into(),
            ));
        }
        if self.use_triple_ma && self.slow_period >= self.long_period {
            return Err(StrategyError::Configuration(
                "slow period must be less than long period".into(),
            ));
        }
        Ok(())
    }

    fn largest_active_period(&self) -> usize {
        if self.use_triple_ma {
            self.long_period
        } else {
            self.slow_period
        }
    }

    fn close_buffer_cap(&self) -> usize {
        (self.largest_active_period() * 3).max(200)
    }
}

/// Trend classification from the MA spread and slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SmaTrend {
    StrongUptrend,
    WeakUptrend,
    Sideways,
    WeakDowntrend,
    StrongDowntrend,
}

impl SmaTrend {
    pub fn label(&self) -> &'static str {
        match self {
            SmaTrend::StrongUptrend => "Strong Uptrend",
            SmaTrend::WeakUptrend => "Weak Uptrend",
            SmaTrend::Sideways => "Sideways",
            SmaTrend::WeakDowntrend => "Weak Downtrend",
            SmaTrend::StrongDowntrend => "Strong Downtrend",
        }
    }

    fn is_up(&self) -> bool {
        matches!(self, SmaTrend::StrongUptrend | SmaTrend::WeakUptrend)
    }

    fn is_down(&self) -> bool {
        matches!(self, SmaTrend::StrongDowntrend | SmaTrend::WeakDowntrend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SmaSignalType {
    GoldenCross,
    DeathCross,
    TrendAcceleration,
    TrendDeceleration,
    PullbackBuy,
    PullbackSell,
    TripleAlignmentBull,
    TripleAlignmentBear,
}

impl SmaSignalType {
    pub fn label(&self) -> &'static str {
        match self {
            SmaSignalType::GoldenCross => "Golden Cross",
            SmaSignalType::DeathCross => "Death Cross",
            SmaSignalType::TrendAcceleration => "Trend Acceleration",
            SmaSignalType::TrendDeceleration => "Trend Deceleration",
            SmaSignalType::PullbackBuy => "Pullback Buy",
            SmaSignalType::PullbackSell => "Pullback Sell",
            SmaSignalType::TripleAlignmentBull => "Triple Alignment Bull",
            SmaSignalType::TripleAlignmentBear => "Triple Alignment Bear",
        }
    }

    pub fn direction(&self) -> SignalKind {
        match self {
            SmaSignalType::GoldenCross
            | SmaSignalType::TrendAcceleration
            | SmaSignalType::PullbackBuy
            | SmaSignalType::TripleAlignmentBull => SignalKind::Buy,
            SmaSignalType::DeathCross
            | SmaSignalType::TrendDeceleration
            | SmaSignalType::PullbackSell
            | SmaSignalType::TripleAlignmentBear => SignalKind::Sell,
        }
    }
}

/// One computed SMA snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SmaValues {
    pub fast_sma: f64,
    pub slow_sma: f64,
    pub long_sma: f64,
    pub fast_slope: f64,
    pub slow_slope: f64,
    pub long_slope: f64,
    pub spread: f64,
    pub spread_pct: f64,
    pub period_count: usize,
    pub is_valid: bool,
}

#[derive(Debug, Clone)]
struct SmaSignalRecord {
    signal_type: SmaSignalType,
    trend: SmaTrend,
    price: f64,
    volume: f64,
    strength: f64,
    timestamp: i64,
    emitted: Instant,
}

struct SmaData {
    params: SmaParams,
    closes: BoundedSeries<f64>,
    volumes: BoundedSeries<f64>,
    history: BoundedSeries<SmaValues>,
    signals: BoundedSeries<SmaSignalRecord>,
    current: SmaValues,
    previous: SmaValues,
    current_trend: SmaTrend,
    previous_trend: SmaTrend,
    trend_changing: bool,
    trend_strength: f64,
    support_level: f64,
    resistance_level: f64,
    was_triple_bull: bool,
    was_triple_bear: bool,
    in_position: bool,
    position_side: OrderSide,
    position_id: String,
    signal_counts: BTreeMap<&'static str, u64>,
    trend_counts: BTreeMap<&'static str, u64>,
    golden_crosses: u64,
    death_crosses: u64,
    trend_changes: u64,
}

impl SmaData {
    fn new(params: SmaParams) -> Self {
        let cap = params.close_buffer_cap();
        Self {
            params,
            closes: BoundedSeries::new(cap),
            volumes: BoundedSeries::new(200),
            history: BoundedSeries::new(500),
            signals: BoundedSeries::new(100),
            current: SmaValues::default(),
            previous: SmaValues::default(),
            current_trend: SmaTrend::Sideways,
            previous_trend: SmaTrend::Sideways,
            trend_changing: false,
            trend_strength: 0.0,
            support_level: 0.0,
            resistance_level: 0.0,
            was_triple_bull: false,
            was_triple_bear: false,
            in_position: false,
            position_side: OrderSide::Buy,
            position_id: String::new(),
            signal_counts: BTreeMap::new(),
            trend_counts: BTreeMap::new(),
            golden_crosses: 0,
            death_crosses: 0,
            trend_changes: 0,
        }
    }

    fn clear_market_state(&mut self) {
        self.closes.clear();
        self.closes.set_cap(self.params.close_buffer_cap());
        self.volumes.clear();
        self.history.clear();
        self.signals.clear();
        self.current = SmaValues::default();
        self.previous = SmaValues::default();
        self.current_trend = SmaTrend::Sideways;
        self.previous_trend = SmaTrend::Sideways;
        self.trend_changing = false;
        self.trend_strength = 0.0;
        self.support_level = 0.0;
        self.resistance_level = 0.0;
        self.was_triple_bull = false;
        self.was_triple_bear = false;
        self.in_position = false;
        self.position_id.clear();
        self.signal_counts.clear();
        self.trend_counts.clear();
        self.golden_crosses = 0;
        self.death_crosses = 0;
        self.trend_changes = 0;
    }

    fn has_sufficient_data(&self) -> bool {
        self.closes.len() >= self.params.largest_active_period()
    }

    fn compute_values(&self) -> SmaValues {
        let closes = self.closes.as_vec();
        let p = &self.params;

        let mut values = SmaValues {
            fast_sma: sma(&closes, p.fast_period),
            slow_sma: sma(&closes, p.slow_period),
            period_count: closes.len(),
            ..SmaValues::default()
        };
        if p.use_triple_ma && closes.len() >= p.long_period {
            values.long_sma = sma(&closes, p.long_period);
        }

        // Slopes over the last few MA values plus the freshly computed one.
        let mut fast_series: Vec<f64> =
            self.history.tail(SLOPE_WINDOW).iter().map(|v| v.fast_sma).collect();
        let mut slow_series: Vec<f64> =
            self.history.tail(SLOPE_WINDOW).iter().map(|v| v.slow_sma).collect();
        fast_series.push(values.fast_sma);
        slow_series.push(values.slow_sma);
        values.fast_slope = linreg_slope(&fast_series, SLOPE_WINDOW);
        values.slow_slope = linreg_slope(&slow_series, SLOPE_WINDOW);
        if p.use_triple_ma {
            let mut long_series: Vec<f64> =
                self.history.tail(SLOPE_WINDOW).iter().map(|v| v.long_sma).collect();
            long_series.push(values.long_sma);
            values.long_slope = linreg_slope(&long_series, SLOPE_WINDOW);
        }

        values.spread = values.fast_sma - values.slow_sma;
        if values.slow_sma != 0.0 {
            values.spread_pct = values.spread / values.slow_sma * 100.0;
        }

        values.is_valid = values.fast_sma > 0.0
            && values.slow_sma > 0.0
            && (!p.use_triple_ma || values.long_sma > 0.0);
        values
    }

    fn trend_of(&self, values: &SmaValues) -> SmaTrend {
        if !values.is_valid {
            return SmaTrend::Sideways;
        }
        let spread_pct = values.spread_pct.abs();
        let min_slope = self.params.min_slope;

        if values.fast_sma > values.slow_sma {
            if spread_pct > STRONG_TREND_SPREAD_PCT && values.fast_slope > min_slope {
                return SmaTrend::StrongUptrend;
            }
            if spread_pct > WEAK_TREND_SPREAD_PCT {
                return SmaTrend::WeakUptrend;
            }
        } else {
            if spread_pct > STRONG_TREND_SPREAD_PCT && values.fast_slope < -min_slope {
                return SmaTrend::StrongDowntrend;
            }
            if spread_pct > WEAK_TREND_SPREAD_PCT {
                return SmaTrend::WeakDowntrend;
            }
        }
        SmaTrend::Sideways
    }

    fn compute_trend_strength(&self, values: &SmaValues) -> f64 {
        if !values.is_valid {
            return 0.0;
        }
        let spread_strength = (values.spread_pct.abs() / 2.0).min(1.0);
        let slope_strength = (values.fast_slope.abs() * 200.0).min(1.0);
        (spread_strength + slope_strength) / 2.0
    }

    fn is_golden_cross(&self) -> bool {
        self.previous.fast_sma <= self.previous.slow_sma
            && self.current.fast_sma > self.current.slow_sma
    }

    fn is_death_cross(&self) -> bool {
        self.previous.fast_sma >= self.previous.slow_sma
            && self.current.fast_sma < self.current.slow_sma
    }

    fn is_triple_alignment(&self, bullish: bool) -> bool {
        if !self.params.use_triple_ma {
            return false;
        }
        let v = &self.current;
        if bullish {
            v.fast_sma > v.slow_sma && v.slow_sma > v.long_sma
        } else {
            v.fast_sma < v.slow_sma && v.slow_sma < v.long_sma
        }
    }

    fn is_pullback(&self, bullish: bool) -> bool {
        let v = &self.current;
        let Some(&last_close) = self.closes.back() else {
            return false;
        };
        if v.fast_sma == 0.0 {
            return false;
        }
        let near_fast = ((last_close - v.fast_sma) / v.fast_sma).abs() < PULLBACK_TOLERANCE;
        if bullish {
            v.fast_sma > v.slow_sma && self.current_trend == SmaTrend::StrongUptrend && near_fast
        } else {
            v.fast_sma < v.slow_sma && self.current_trend == SmaTrend::StrongDowntrend && near_fast
        }
    }

    /// First matching rule wins: crossover, trend acceleration or
    /// deceleration, pullback, triple alignment on its transition edge.
    fn classify_signal(&self) -> Option<SmaSignalType> {
        if !self.current.is_valid || !self.previous.is_valid {
            return None;
        }

        if self.is_golden_cross() {
            return Some(SmaSignalType::GoldenCross);
        }
        if self.is_death_cross() {
            return Some(SmaSignalType::DeathCross);
        }

        let min_slope = self.params.min_slope;
        if self.current.fast_slope > self.previous.fast_slope
            && self.current.fast_slope > 2.0 * min_slope
        {
            return Some(SmaSignalType::TrendAcceleration);
        }
        if self.current.fast_slope < self.previous.fast_slope
            && self.current.fast_slope.abs() < min_slope
        {
            return Some(SmaSignalType::TrendDeceleration);
        }

        if self.is_pullback(true) {
            return Some(SmaSignalType::PullbackBuy);
        }
        if self.is_pullback(false) {
            return Some(SmaSignalType::PullbackSell);
        }

        // Alignment fires exactly when it becomes true.
        if self.params.use_triple_ma {
            if self.is_triple_alignment(true) && !self.was_triple_bull {
                return Some(SmaSignalType::TripleAlignmentBull);
            }
            if self.is_triple_alignment(false) && !self.was_triple_bear {
                return Some(SmaSignalType::TripleAlignmentBear);
            }
        }

        None
    }

    fn signal_strength(&self, signal_type: SmaSignalType) -> f64 {
        let v = &self.current;
        let strength = match signal_type {
            SmaSignalType::GoldenCross | SmaSignalType::DeathCross => {
                (v.spread_pct.abs() * 2.0 + v.fast_slope.abs() * 100.0).min(1.0)
            }
            SmaSignalType::TripleAlignmentBull | SmaSignalType::TripleAlignmentBear => {
                0.8 + (v.fast_slope.abs() * 50.0).min(0.2)
            }
            SmaSignalType::TrendAcceleration | SmaSignalType::TrendDeceleration => {
                ((v.fast_slope - self.previous.fast_slope).abs() * 1000.0).min(1.0)
            }
            SmaSignalType::PullbackBuy | SmaSignalType::PullbackSell => 0.5,
        };
        strength.clamp(0.0, 1.0)
    }

    fn should_emit(&self, signal_type: SmaSignalType) -> bool {
        match self.signals.back() {
            Some(last) if last.signal_type == signal_type => {
                last.emitted.elapsed() >= SIGNAL_COOLDOWN
            }
            _ => true,
        }
    }

    /// Emission filter: volume confirmation when the volume filter is on.
    fn passes_filter(&self, current_volume: f64) -> bool {
        if !self.params.use_volume_filter {
            return true;
        }
        let volumes = self.volumes.as_vec();
        let average = sma(&volumes, VOLUME_WINDOW.min(volumes.len().max(1)));
        if average == 0.0 {
            return true;
        }
        current_volume >= average * self.params.volume_threshold
    }

    fn passes_slope_filter(&self) -> bool {
        if !self.params.use_slope_filter {
            return true;
        }
        self.current.fast_slope.abs() >= self.params.min_slope
    }

    /// Support sits on the lowest active MA in an uptrend; resistance on the
    /// highest in a downtrend; both default to the slow MA otherwise.
    fn refresh_support_resistance(&mut self) {
        let v = &self.current;
        let mut active = vec![v.fast_sma, v.slow_sma];
        if self.params.use_triple_ma {
            active.push(v.long_sma);
        }
        self.support_level = if self.current_trend.is_up() {
            active.iter().copied().fold(f64::MAX, f64::min)
        } else {
            v.slow_sma
        };
        self.resistance_level = if self.current_trend.is_down() {
            active.iter().copied().fold(f64::MIN, f64::max)
        } else {
            v.slow_sma
        };
    }

    fn should_close_position(&self) -> bool {
        if !self.in_position {
            return false;
        }
        let v = &self.current;
        if self.position_side == OrderSide::Buy && v.fast_sma < v.slow_sma {
            return true;
        }
        if self.position_side == OrderSide::Sell && v.fast_sma > v.slow_sma {
            return true;
        }
        if self.trend_changing {
            let against_long = self.position_side == OrderSide::Buy && self.current_trend.is_down();
            let against_short = self.position_side == OrderSide::Sell && self.current_trend.is_up();
            return against_long || against_short;
        }
        false
    }
}

/// The SMA crossover strategy.
pub struct SmaStrategy {
    core: StrategyCore,
    data: Mutex<SmaData>,
}

impl SmaStrategy {
    pub const NAME: &'static str = "SMA Strategy";

    pub fn new() -> Self {
        Self::with_params(SmaParams::default())
    }

    pub fn with_params(params: SmaParams) -> Self {
        Self { core: StrategyCore::new(Self::NAME), data: Mutex::new(SmaData::new(params)) }
    }

    pub fn params(&self) -> SmaParams {
        lock(&self.data).params.clone()
    }

    pub fn current_values(&self) -> SmaValues {
        lock(&self.data).current.clone()
    }

    pub fn current_trend(&self) -> SmaTrend {
        lock(&self.data).current_trend
    }

    pub fn trend_strength(&self) -> f64 {
        lock(&self.data).trend_strength
    }

    /// (support, resistance) derived from the active MAs.
    pub fn dynamic_levels(&self) -> (f64, f64) {
        let data = lock(&self.data);
        (data.support_level, data.resistance_level)
    }

    pub fn history(&self, count: usize) -> Vec<SmaValues> {
        lock(&self.data).history.tail_cloned(count)
    }

    pub fn signal_history_len(&self) -> usize {
        lock(&self.data).signals.len()
    }

    /// Last `count` emitted signals, oldest first.
    pub fn signal_history(&self, count: usize) -> Vec<SmaSignalEvent> {
        lock(&self.data)
            .signals
            .tail(count)
            .iter()
            .map(|r| SmaSignalEvent {
                signal_type: r.signal_type,
                trend: r.trend,
                price: r.price,
                volume: r.volume,
                strength: r.strength,
                timestamp: r.timestamp,
            })
            .collect()
    }

    /// Current trend analysis: classification, its predecessor, strength,
    /// and the dynamic support/resistance levels.
    pub fn trend_analysis(&self) -> TrendAnalysis {
        let data = lock(&self.data);
        TrendAnalysis {
            current_trend: data.current_trend,
            previous_trend: data.previous_trend,
            trend_strength: data.trend_strength,
            is_trend_changing: data.trend_changing,
            support_level: data.support_level,
            resistance_level: data.resistance_level,
        }
    }
}

/// Public view of one emitted SMA signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmaSignalEvent {
    pub signal_type: SmaSignalType,
    pub trend: SmaTrend,
    pub price: f64,
    pub volume: f64,
    pub strength: f64,
    pub timestamp: i64,
}

/// Snapshot of the trend state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub current_trend: SmaTrend,
    pub previous_trend: SmaTrend,
    pub trend_strength: f64,
    pub is_trend_changing: bool,
    pub support_level: f64,
    pub resistance_level: f64,
}

impl Default for SmaStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for SmaStrategy {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    fn description(&self) -> &'static str {
        "Simple moving average crossover strategy"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Momentum
    }

    fn configure(&self, params: &Value) -> Result<(), StrategyError> {
        let mut data = lock(&self.data);
        let mut next = data.params.clone();

        merge_usize(params, "fast_period", &mut next.fast_period);
        merge_usize(params, "slow_period", &mut next.slow_period);
        merge_usize(params, "long_period", &mut next.long_period);
        merge_f64(params, "position_size", &mut next.position_size);
        merge_f64(params, "stop_loss_pct", &mut next.stop_loss_pct);
        merge_f64(params, "take_profit_pct", &mut next.take_profit_pct);
        merge_bool(params, "use_triple_ma", &mut next.use_triple_ma);
        merge_bool(params, "use_slope_filter", &mut next.use_slope_filter);
        merge_f64(params, "min_slope", &mut next.min_slope);
        merge_bool(params, "use_volume_filter", &mut next.use_volume_filter);
        merge_f64(params, "volume_threshold", &mut next.volume_threshold);

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
            fast = params.fast_period,
            slow = params.slow_period,
            long = params.long_period,
            triple = params.use_triple_ma,
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
                data.volumes.push(candle.volume);
            }

            if !data.has_sufficient_data() {
                return Ok(Signal::hold(
                    Self::NAME,
                    &ticker.symbol,
                    "Insufficient data for SMA calculation",
                ));
            }

            data.previous = data.current.clone();
            data.current = data.compute_values();

            if !data.current.is_valid {
                return Ok(Signal::hold(Self::NAME, &ticker.symbol, "Invalid SMA values calculated"));
            }

            let snapshot = data.current.clone();
            data.history.push(snapshot);

            // Trend bookkeeping before classification: pullbacks read it.
            let new_trend = data.trend_of(&data.current);
            data.trend_changing = new_trend != data.current_trend;
            if data.trend_changing {
                data.previous_trend = data.current_trend;
                data.current_trend = new_trend;
                data.trend_changes += 1;
            }
            data.trend_strength = data.compute_trend_strength(&data.current);
            data.refresh_support_resistance();
            let trend_label = data.current_trend.label();
            *data.trend_counts.entry(trend_label).or_insert(0) += 1;

            let classified = data.classify_signal();

            // Alignment edge state advances every update, emitted or not.
            let bull_now = data.is_triple_alignment(true);
            let bear_now = data.is_triple_alignment(false);

            let result = match classified {
                Some(signal_type)
                    if data.should_emit(signal_type)
                        && data.passes_filter(data.volumes.back().copied().unwrap_or(0.0)) =>
                {
                    let strength = data.signal_strength(signal_type);
                    let kind = signal_type.direction();
                    let side = if kind == SignalKind::Buy { OrderSide::Buy } else { OrderSide::Sell };
                    let price = ticker.last_price;
                    let volume = data.volumes.back().copied().unwrap_or(0.0);
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
                        SmaSignalType::GoldenCross => data.golden_crosses += 1,
                        SmaSignalType::DeathCross => data.death_crosses += 1,
                        _ => {}
                    }

                    let trend = data.current_trend;
                    data.signals.push(SmaSignalRecord {
                        signal_type,
                        trend,
                        price,
                        volume,
                        strength,
                        timestamp: signal.timestamp,
                        emitted: Instant::now(),
                    });

                    info!(
                        strategy = Self::NAME,
                        signal = signal_type.label(),
                        price,
                        fast = data.current.fast_sma,
                        slow = data.current.slow_sma,
                        spread_pct = data.current.spread_pct,
                        trend = trend.label(),
                        "signal"
                    );
                    Some(signal)
                }
                _ => None,
            };

            data.was_triple_bull = bull_now;
            data.was_triple_bear = bear_now;
            result
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
                    message: "SMA close condition".to_string(),
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
        lock(&self.data).passes_slope_filter()
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
                    "fast_sma": v.fast_sma,
                    "slow_sma": v.slow_sma,
                    "long_sma": v.long_sma,
                    "spread": v.spread,
                })
            })
            .collect();

        json!({
            "type": "SmaStrategy",
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
            let params: SmaParams = serde_json::from_value(config.clone())
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
        if let Some(values) = snapshot.get("current_values") {
            if let Ok(values) = serde_json::from_value::<SmaValues>(values.clone()) {
                data.current = values;
            }
        }
        if let Some(trend) = snapshot.get("current_trend") {
            if let Ok(trend) = serde_json::from_value::<SmaTrend>(trend.clone()) {
                data.current_trend = trend;
            }
        }
        if let Some(entries) = snapshot.get("history").and_then(Value::as_array) {
            data.history.clear();
            for item in entries {
                data.history.push(SmaValues {
                    fast_sma: item.get("fast_sma").and_then(Value::as_f64).unwrap_or(0.0),
                    slow_sma: item.get("slow_sma").and_then(Value::as_f64).unwrap_or(0.0),
                    long_sma: item.get("long_sma").and_then(Value::as_f64).unwrap_or(0.0),
                    spread: item.get("spread").and_then(Value::as_f64).unwrap_or(0.0),
                    is_valid: true,
                    ..SmaValues::default()
                });
            }
        }
        Ok(())
    }

    fn required_indicators(&self) -> Vec<&'static str> {
        vec!["SMA"]
    }

    fn custom_metrics(&self) -> BTreeMap<String, f64> {
        let data = lock(&self.data);
        let mut metrics = BTreeMap::new();
        metrics.insert("golden_crosses".to_string(), data.golden_crosses as f64);
        metrics.insert("death_crosses".to_string(), data.death_crosses as f64);
        metrics.insert("trend_changes".to_string(), data.trend_changes as f64);
        metrics.insert("current_fast_sma".to_string(), data.current.fast_sma);
        metrics.insert("current_slow_sma".to_string(), data.current.slow_sma);
        metrics.insert("current_spread".to_string(), data.current.spread);
        metrics.insert("trend_strength".to_string(), data.trend_strength);
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
    use crate::strategy::test_support::{candles_from_closes_volumes, ticker_for};

    fn active_strategy(params: SmaParams) -> SmaStrategy {
        let strategy = SmaStrategy::with_params(params);
        strategy.start();
        strategy
    }

    fn drive(strategy: &SmaStrategy, closes: &[f64], volumes: &[f64]) -> Vec<Signal> {
        let candles = candles_from_closes_volumes(closes, volumes);
        candles
            .iter()
            .map(|c| {
                let ticker = Ticker::from_last("BTCUSDT", c.close, c.close_time);
                strategy.update(std::slice::from_ref(c), &ticker).unwrap()
            })
            .collect()
    }

    #[test]
    fn golden_cross_fires_buy_with_spread_strength() {
        let params = SmaParams { fast_period: 3, slow_period: 5, ..SmaParams::default() };
        let strategy = active_strategy(params);
        let closes = [10.0, 10.0, 10.0, 10.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0];
        let volumes = [1.0; 10];
        let signals = drive(&strategy, &closes, &volumes);

        let cross = signals
            .iter()
            .find(|s| s.message == "Golden Cross")
            .expect("expected a golden cross");
        assert_eq!(cross.kind, SignalKind::Buy);
        assert!(cross.strength > 0.0);
        // Non-strict to strict: previous fast <= slow, current fast > slow.
        assert!(strategy.current_values().fast_sma > strategy.current_values().slow_sma);
        assert!(matches!(
            strategy.current_trend(),
            SmaTrend::WeakUptrend | SmaTrend::StrongUptrend | SmaTrend::Sideways
        ));
    }

    #[test]
    fn death_cross_fires_sell() {
        let params =
            SmaParams { fast_period: 3, slow_period: 5, use_slope_filter: false, ..SmaParams::default() };
        let strategy = active_strategy(params);
        let closes = [15.0, 15.0, 15.0, 15.0, 15.0, 14.0, 13.0, 12.0, 11.0, 10.0];
        let volumes = [1.0; 10];
        let signals = drive(&strategy, &closes, &volumes);

        let cross = signals
            .iter()
            .find(|s| s.message == "Death Cross")
            .expect("expected a death cross");
        assert_eq!(cross.kind, SignalKind::Sell);
    }

    #[test]
    fn crossover_predicate_non_strict_to_strict() {
        let mut data = SmaData::new(SmaParams::default());
        data.previous = SmaValues { fast_sma: 10.0, slow_sma: 10.0, is_valid: true, ..SmaValues::default() };
        data.current = SmaValues { fast_sma: 10.1, slow_sma: 10.0, is_valid: true, ..SmaValues::default() };
        assert!(data.is_golden_cross());
        // Equal on both snapshots is not a cross.
        data.current.fast_sma = 10.0;
        assert!(!data.is_golden_cross());
    }

    #[test]
    fn trend_classification_thresholds() {
        let data = SmaData::new(SmaParams::default());
        let values = SmaValues {
            fast_sma: 102.0,
            slow_sma: 100.0,
            spread_pct: 2.0,
            fast_slope: 0.01,
            is_valid: true,
            ..SmaValues::default()
        };
        assert_eq!(data.trend_of(&values), SmaTrend::StrongUptrend);

        let weak = SmaValues { spread_pct: 0.7, fast_slope: 0.0, ..values.clone() };
        assert_eq!(data.trend_of(&weak), SmaTrend::WeakUptrend);

        let flat = SmaValues { spread_pct: 0.2, ..values.clone() };
        assert_eq!(data.trend_of(&flat), SmaTrend::Sideways);

        let down = SmaValues {
            fast_sma: 98.0,
            slow_sma: 100.0,
            spread_pct: -2.0,
            fast_slope: -0.01,
            ..values
        };
        assert_eq!(data.trend_of(&down), SmaTrend::StrongDowntrend);
    }

    #[test]
    fn triple_alignment_fires_only_on_transition_edge() {
        let mut data = SmaData::new(SmaParams::triple());
        data.previous = SmaValues { fast_sma: 1.0, slow_sma: 1.0, long_sma: 1.0, is_valid: true, ..SmaValues::default() };
        data.current = SmaValues {
            fast_sma: 103.0,
            slow_sma: 102.0,
            long_sma: 101.0,
            // Slopes chosen so no acceleration/deceleration rule matches:
            // decelerating but still above the minimum slope.
            fast_slope: 0.002,
            is_valid: true,
            ..SmaValues::default()
        };
        data.previous.fast_slope = 0.003;
        // Keep the crossover rules quiet: previous fast above previous slow.
        data.previous.fast_sma = 103.0;
        data.previous.slow_sma = 102.0;
        data.previous.long_sma = 101.0;

        assert!(!data.was_triple_bull);
        assert_eq!(data.classify_signal(), Some(SmaSignalType::TripleAlignmentBull));

        // Once the alignment has been observed, the edge has passed.
        data.was_triple_bull = true;
        assert_eq!(data.classify_signal(), None);
    }

    #[test]
    fn volume_filter_blocks_thin_volume() {
        let mut data = SmaData::new(SmaParams {
            use_volume_filter: true,
            volume_threshold: 1.5,
            ..SmaParams::default()
        });
        for _ in 0..20 {
            data.volumes.push(10.0);
        }
        assert!(!data.passes_filter(10.0));
        assert!(data.passes_filter(15.0));
        assert!(data.passes_filter(20.0));
    }

    #[test]
    fn slope_filter_gates_validation() {
        let params =
            SmaParams { fast_period: 3, slow_period: 5, min_slope: 0.5, ..SmaParams::default() };
        let strategy = active_strategy(params);
        {
            let mut data = lock(&strategy.data);
            data.current.fast_slope = 0.1;
        }
        let mut signal = Signal::hold(SmaStrategy::NAME, "BTCUSDT", "x");
        signal.kind = SignalKind::Buy;
        signal.strength = 0.9;
        assert!(!strategy.validate_signal(&signal));
        {
            let mut data = lock(&strategy.data);
            data.current.fast_slope = 0.7;
        }
        assert!(strategy.validate_signal(&signal));
    }

    #[test]
    fn pullback_requires_strong_trend_and_proximity() {
        let mut data = SmaData::new(SmaParams::default());
        data.current = SmaValues {
            fast_sma: 100.0,
            slow_sma: 98.0,
            is_valid: true,
            ..SmaValues::default()
        };
        data.current_trend = SmaTrend::StrongUptrend;
        data.closes.push(100.2);
        assert!(data.is_pullback(true));

        // Too far from the fast MA.
        data.closes.push(103.0);
        assert!(!data.is_pullback(true));

        // Weak trend disqualifies.
        data.closes.push(100.2);
        data.current_trend = SmaTrend::WeakUptrend;
        assert!(!data.is_pullback(true));
    }

    #[test]
    fn dynamic_support_is_lowest_active_ma_in_uptrend() {
        let mut data = SmaData::new(SmaParams::triple());
        data.current = SmaValues {
            fast_sma: 103.0,
            slow_sma: 102.0,
            long_sma: 101.0,
            is_valid: true,
            ..SmaValues::default()
        };
        data.current_trend = SmaTrend::StrongUptrend;
        data.refresh_support_resistance();
        assert_eq!(data.support_level, 101.0);

        data.current_trend = SmaTrend::StrongDowntrend;
        data.refresh_support_resistance();
        assert_eq!(data.resistance_level, 103.0);
    }

    #[test]
    fn close_trigger_on_opposing_cross() {
        let mut data = SmaData::new(SmaParams::default());
        data.in_position = true;
        data.position_side = OrderSide::Buy;
        data.current = SmaValues { fast_sma: 99.0, slow_sma: 100.0, is_valid: true, ..SmaValues::default() };
        assert!(data.should_close_position());

        data.position_side = OrderSide::Sell;
        assert!(!data.should_close_position());
    }

    #[test]
    fn preset_params_are_valid() {
        for params in [
            SmaParams::default(),
            SmaParams::scalping(),
            SmaParams::swing(),
            SmaParams::triple(),
        ] {
            params.validate().unwrap();
        }
        let swing = SmaParams::swing();
        assert_eq!((swing.fast_period, swing.slow_period, swing.long_period), (20, 50, 100));
        assert!(swing.use_triple_ma);
        assert_eq!(swing.min_slope, 0.0005);
        assert!(SmaParams::scalping().use_volume_filter);
    }

    #[test]
    fn configure_rejects_fast_not_below_slow() {
        let strategy = SmaStrategy::new();
        let result = strategy.configure(&json!({ "fast_period": 20, "slow_period": 10 }));
        assert!(matches!(result, Err(StrategyError::Configuration(_))));
    }

    #[test]
    fn configure_rejects_slow_not_below_long_in_triple_mode() {
        let strategy = SmaStrategy::new();
        let result = strategy
            .configure(&json!({ "use_triple_ma": true, "slow_period": 60, "long_period": 50 }));
        assert!(matches!(result, Err(StrategyError::Configuration(_))));
    }

    #[test]
    fn buffers_stay_bounded() {
        let params = SmaParams { fast_period: 3, slow_period: 5, ..SmaParams::default() };
        let strategy = active_strategy(params);
        let closes: Vec<f64> = (0..600).map(|i| 100.0 + (i as f64 * 0.5).sin() * 4.0).collect();
        let volumes = vec![1.0; closes.len()];
        drive(&strategy, &closes, &volumes);

        let data = lock(&strategy.data);
        assert!(data.closes.len() <= data.params.close_buffer_cap());
        assert!(data.volumes.len() <= 200);
        assert!(data.history.len() <= 500);
        assert!(data.signals.len() <= 100);
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let params = SmaParams { fast_period: 3, slow_period: 5, ..SmaParams::default() };
        let strategy = active_strategy(params);
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let volumes = vec![1.0; closes.len()];
        drive(&strategy, &closes, &volumes);

        let snapshot = strategy.snapshot();
        let fresh = SmaStrategy::new();
        fresh.restore(&snapshot).unwrap();

        assert_eq!(fresh.params(), strategy.params());
        assert_eq!(fresh.current_values().fast_sma, strategy.current_values().fast_sma);
        assert_eq!(fresh.current_trend(), strategy.current_trend());
    }

    #[test]
    fn insufficient_data_emits_explanatory_hold() {
        let strategy = active_strategy(SmaParams::default());
        let closes = [10.0, 11.0];
        let volumes = [1.0, 1.0];
        let candles = candles_from_closes_volumes(&closes, &volumes);
        let signal = strategy.update(&candles, &ticker_for("BTCUSDT", &closes)).unwrap();
        assert!(signal.kind.is_hold());
        assert_eq!(signal.message, "Insufficient data for SMA calculation");
    }
}
