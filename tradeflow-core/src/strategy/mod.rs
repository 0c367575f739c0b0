//! Strategy framework.
//!
//! Strategies are modeled as a capability trait (`Strategy`) plus a shared
//! `StrategyCore` composed into each implementation: the lifecycle state
//! machine, bounded error log, callbacks, execution timing and trade
//! metrics live in the core; each strategy carries its own parameter and
//! indicator-state records behind its own data mutex.
//!
//! Locking discipline: a strategy's data mutex and its metrics mutex are
//! never held together — callbacks that mutate metrics run after the data
//! mutex is released, so an in-flight `update` cannot deadlock with a
//! position-close notification.

pub mod config;
pub mod history;
pub mod macd;
pub mod metrics;
pub mod rsi;
pub mod sma;

pub use config::{StrategyConfig, StrategyKind};
pub use history::BoundedSeries;
pub use macd::MacdStrategy;
pub use metrics::{StrategyMetrics, TradeLedger};
pub use rsi::RsiStrategy;
pub use sma::SmaStrategy;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::domain::{Candle, Position, Signal, Ticker};

/// Lock a mutex, recovering the inner value if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle state shared by strategies and the engine's view of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyState {
    Inactive,
    Initializing,
    Active,
    Paused,
    Error,
    Stopped,
}

#[derive(Debug, Error)]
pub enum StrategyError {
    /// Invalid or out-of-range parameter at configure time. The strategy
    /// stays Inactive.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Snapshot serialization or restoration failed; state is unchanged.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("strategy internal error: {0}")]
    Internal(String),
}

pub type SignalCallback = Box<dyn Fn(&Signal) + Send + Sync>;
pub type PositionCallback = Box<dyn Fn(&Position) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Bounded error ring size.
const ERROR_LOG_CAP: usize = 50;

/// State shared by every strategy, composed in rather than inherited.
pub struct StrategyCore {
    name: String,
    state: Mutex<StrategyState>,
    config: Mutex<StrategyConfig>,
    errors: Mutex<VecDeque<String>>,
    ledger: Mutex<TradeLedger>,
    last_execution: Mutex<Duration>,
    initialized: AtomicBool,
    signal_cb: Mutex<Option<SignalCallback>>,
    position_cb: Mutex<Option<PositionCallback>>,
    error_cb: Mutex<Option<ErrorCallback>>,
}

impl StrategyCore {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let config = StrategyConfig { name: name.clone(), ..StrategyConfig::default() };
        Self {
            name,
            state: Mutex::new(StrategyState::Inactive),
            config: Mutex::new(config),
            errors: Mutex::new(VecDeque::new()),
            ledger: Mutex::new(TradeLedger::new()),
            last_execution: Mutex::new(Duration::ZERO),
            initialized: AtomicBool::new(false),
            signal_cb: Mutex::new(None),
            position_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StrategyState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: StrategyState) {
        *lock(&self.state) = state;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::Release);
    }

    pub fn config(&self) -> StrategyConfig {
        lock(&self.config).clone()
    }

    pub fn set_config(&self, config: StrategyConfig) {
        *lock(&self.config) = config;
    }

    /// Record an error in the bounded ring and notify the error callback.
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        {
            let mut errors = lock(&self.errors);
            errors.push_back(message.clone());
            while errors.len() > ERROR_LOG_CAP {
                errors.pop_front();
            }
        }
        if let Some(cb) = lock(&self.error_cb).as_ref() {
            cb(&message);
        }
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).iter().cloned().collect()
    }

    pub fn clear_errors(&self) {
        lock(&self.errors).clear();
    }

    /// Apply a realized PnL to the metrics ledger. Takes only the metrics
    /// mutex; callers must not hold the data mutex.
    pub fn record_trade(&self, pnl: f64, duration_ms: i64) {
        lock(&self.ledger).record_close(pnl, duration_ms);
    }

    pub fn metrics(&self) -> StrategyMetrics {
        lock(&self.ledger).snapshot()
    }

    pub fn reset_metrics(&self) {
        lock(&self.ledger).reset();
    }

    pub fn note_execution(&self, elapsed: Duration) {
        *lock(&self.last_execution) = elapsed;
    }

    pub fn last_execution(&self) -> Duration {
        *lock(&self.last_execution)
    }

    pub fn set_signal_callback(&self, cb: SignalCallback) {
        *lock(&self.signal_cb) = Some(cb);
    }

    pub fn set_position_callback(&self, cb: PositionCallback) {
        *lock(&self.position_cb) = Some(cb);
    }

    pub fn set_error_callback(&self, cb: ErrorCallback) {
        *lock(&self.error_cb) = Some(cb);
    }

    /// Invoke the signal callback. Callers must not hold the data mutex.
    pub fn notify_signal(&self, signal: &Signal) {
        if let Some(cb) = lock(&self.signal_cb).as_ref() {
            cb(signal);
        }
    }

    pub fn notify_position(&self, position: &Position) {
        if let Some(cb) = lock(&self.position_cb).as_ref() {
            cb(position);
        }
    }
}

/// Capability contract shared by the concrete strategies.
///
/// `update` is the hot path: append new candles to the rolling buffers,
/// recompute the indicator snapshot, classify, throttle, and either emit a
/// typed signal or a Hold with an explanatory message. Insufficient data is
/// never an error. Within a single strategy, updates are serialized by its
/// data mutex: call N observes all state written by call N−1.
pub trait Strategy: Send + Sync {
    /// The composed shared core.
    fn core(&self) -> &StrategyCore;

    fn description(&self) -> &'static str;

    fn kind(&self) -> StrategyKind;

    /// Apply indicator-specific parameters. Invalid parameters are
    /// reported to the caller and the strategy stays Inactive.
    fn configure(&self, params: &Value) -> Result<(), StrategyError>;

    /// Clear rolling state and mark the strategy ready.
    fn initialize(&self);

    /// Clear rolling state, keep configuration.
    fn reset(&self);

    /// Ingest new candles and the current ticker, produce one signal.
    fn update(&self, candles: &[Candle], ticker: &Ticker) -> Result<Signal, StrategyError>;

    fn on_position_opened(&self, position: &Position);

    fn on_position_closed(&self, position: &Position, exit_price: f64, pnl: f64);

    fn on_position_updated(&self, position: &Position);

    /// Strategy-level acceptance test applied by the engine; failing
    /// signals are degraded to Hold.
    fn validate_signal(&self, signal: &Signal) -> bool;

    /// Fraction-of-balance position sizing.
    fn position_size(&self, symbol: &str, price: f64, available_balance: f64) -> f64;

    /// Structured snapshot of config, metrics and indicator state.
    fn snapshot(&self) -> Value;

    /// Restore from a snapshot previously produced by `snapshot`.
    fn restore(&self, data: &Value) -> Result<(), StrategyError>;

    fn required_indicators(&self) -> Vec<&'static str>;

    // Provided behaviour, shared by all strategies.

    fn name(&self) -> &str {
        self.core().name()
    }

    fn state(&self) -> StrategyState {
        self.core().state()
    }

    /// Idempotent: starting an Active strategy is a no-op.
    fn start(&self) {
        if !self.core().is_initialized() {
            self.core().set_state(StrategyState::Initializing);
            self.initialize();
        }
        self.core().set_state(StrategyState::Active);
        debug!(strategy = self.name(), "started");
    }

    /// Idempotent: stopping an Inactive strategy is a no-op.
    fn stop(&self) {
        self.core().set_state(StrategyState::Inactive);
        debug!(strategy = self.name(), "stopped");
    }

    fn pause(&self) {
        self.core().set_state(StrategyState::Paused);
    }

    fn resume(&self) {
        self.core().set_state(StrategyState::Active);
    }

    /// Terminal: a shut-down strategy must be re-initialized before use.
    fn shutdown(&self) {
        self.core().set_initialized(false);
        self.core().set_state(StrategyState::Stopped);
    }

    fn metrics(&self) -> StrategyMetrics {
        self.core().metrics()
    }

    /// Indicator-specific gauges and counters, keyed by name.
    fn custom_metrics(&self) -> std::collections::BTreeMap<String, f64> {
        std::collections::BTreeMap::new()
    }

    fn can_trade(&self, symbol: &str) -> bool {
        !symbol.is_empty()
    }

    fn supported_symbols(&self) -> Vec<String> {
        // Empty means every symbol is supported.
        Vec::new()
    }

    fn errors(&self) -> Vec<String> {
        self.core().errors()
    }

    fn clear_errors(&self) {
        self.core().clear_errors();
    }

    fn last_execution(&self) -> Duration {
        self.core().last_execution()
    }

    fn on_order_filled(&self, order_id: &str, _position: &Position) {
        debug!(strategy = self.name(), order_id, "order filled");
    }

    fn on_order_canceled(&self, order_id: &str, reason: &str) {
        debug!(strategy = self.name(), order_id, reason, "order canceled");
    }

    fn on_order_rejected(&self, order_id: &str, reason: &str) {
        self.core().record_error(format!("order {order_id} rejected: {reason}"));
    }
}

/// Overlay helpers for `configure`: apply a JSON key onto a typed slot when
/// present, leaving the slot untouched otherwise.
pub(crate) fn merge_f64(params: &Value, key: &str, slot: &mut f64) {
    if let Some(v) = params.get(key).and_then(Value::as_f64) {
        *slot = v;
    }
}

pub(crate) fn merge_usize(params: &Value, key: &str, slot: &mut usize) {
    if let Some(v) = params.get(key).and_then(Value::as_u64) {
        *slot = v as usize;
    }
}

pub(crate) fn merge_bool(params: &Value, key: &str, slot: &mut bool) {
    if let Some(v) = params.get(key).and_then(Value::as_bool) {
        *slot = v;
    }
}

/// Stop-loss level for an entry at `entry_price`: below entry for longs,
/// above for shorts.
pub(crate) fn stop_loss_level(entry_price: f64, side: crate::domain::OrderSide, percent: f64) -> f64 {
    match side {
        crate::domain::OrderSide::Buy => entry_price * (1.0 - percent / 100.0),
        crate::domain::OrderSide::Sell => entry_price * (1.0 + percent / 100.0),
    }
}

/// Take-profit level, mirrored around entry the opposite way.
pub(crate) fn take_profit_level(entry_price: f64, side: crate::domain::OrderSide, percent: f64) -> f64 {
    match side {
        crate::domain::OrderSide::Buy => entry_price * (1.0 + percent / 100.0),
        crate::domain::OrderSide::Sell => entry_price * (1.0 - percent / 100.0),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_error_ring_is_bounded() {
        let core = StrategyCore::new("Test");
        for i in 0..(ERROR_LOG_CAP + 10) {
            core.record_error(format!("error {i}"));
        }
        let errors = core.errors();
        assert_eq!(errors.len(), ERROR_LOG_CAP);
        assert_eq!(errors.last().unwrap(), &format!("error {}", ERROR_LOG_CAP + 9));
    }

    #[test]
    fn core_state_transitions() {
        let core = StrategyCore::new("Test");
        assert_eq!(core.state(), StrategyState::Inactive);
        core.set_state(StrategyState::Active);
        assert_eq!(core.state(), StrategyState::Active);
    }

    #[test]
    fn error_callback_fires_without_locks_held() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let core = Arc::new(StrategyCore::new("Test"));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let core2 = Arc::clone(&core);
        core.set_error_callback(Box::new(move |_msg| {
            // Re-entering the error ring from the callback must not deadlock.
            let _ = core2.errors();
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        core.record_error("boom");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exit_levels_mirror_by_side() {
        use crate::domain::OrderSide;
        assert_eq!(stop_loss_level(100.0, OrderSide::Buy, 2.0), 98.0);
        assert_eq!(stop_loss_level(100.0, OrderSide::Sell, 2.0), 102.0);
        assert_eq!(take_profit_level(100.0, OrderSide::Buy, 4.0), 104.0);
        assert_eq!(take_profit_level(100.0, OrderSide::Sell, 4.0), 96.0);
    }
}
