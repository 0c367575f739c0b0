//! Strategy engine — registry, dispatch and position book.
//!
//! The engine owns two locks: the registry mutex (strategies, their states,
//! per-strategy parameters and statistics) and the positions mutex (open
//! positions, id→strategy, strategy→ids). When both are needed the
//! acquisition order is registry → positions, never reversed. Strategy
//! `update` calls and user callbacks always run with both released.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::domain::{now_millis, Candle, Position, Signal, Ticker, TimestampMs};
use crate::risk::RiskManager;
use crate::strategy::{lock, Strategy, StrategyConfig, StrategyState};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("strategy '{0}' not found")]
    StrategyNotFound(String),

    #[error("strategy '{0}' already registered")]
    DuplicateStrategy(String),

    #[error("invalid strategy: {0}")]
    InvalidStrategy(String),

    #[error("invalid position: {0}")]
    InvalidPosition(String),

    #[error("position '{0}' not found")]
    PositionNotFound(String),

    #[error("persistence failed: {0}")]
    Persistence(String),
}

/// Engine-level statistics for one strategy, updated on every close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub strategy_name: String,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Percent.
    pub win_rate: f64,
    pub total_pnl: f64,
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub last_trade_time: Option<TimestampMs>,
    pub start_time: TimestampMs,
}

impl StrategyStats {
    fn new(strategy_name: &str) -> Self {
        Self {
            strategy_name: strategy_name.to_string(),
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            total_pnl: 0.0,
            max_drawdown: 0.0,
            current_drawdown: 0.0,
            last_trade_time: None,
            start_time: now_millis(),
        }
    }

    fn apply_close(&mut self, pnl: f64) {
        self.total_trades += 1;
        self.total_pnl += pnl;
        self.last_trade_time = Some(now_millis());
        if pnl > 0.0 {
            self.winning_trades += 1;
        } else {
            self.losing_trades += 1;
        }
        self.win_rate = self.winning_trades as f64 / self.total_trades as f64 * 100.0;
        if pnl < 0.0 {
            self.current_drawdown += pnl.abs();
            self.max_drawdown = self.max_drawdown.max(self.current_drawdown);
        } else {
            self.current_drawdown = (self.current_drawdown - pnl).max(0.0);
        }
    }
}

struct Registry {
    strategies: HashMap<String, Arc<dyn Strategy>>,
    states: HashMap<String, StrategyState>,
    params: HashMap<String, StrategyConfig>,
    stats: HashMap<String, StrategyStats>,
}

struct PositionBook {
    open: HashMap<String, Position>,
    position_to_strategy: HashMap<String, String>,
    strategy_positions: HashMap<String, Vec<String>>,
}

pub type EngineSignalCallback = Box<dyn Fn(&str, &Signal) + Send + Sync>;
pub type EnginePositionCallback = Box<dyn Fn(&str, &Position) + Send + Sync>;
pub type EngineErrorCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// The strategy engine. Safe to share across market-data feed threads and
/// an operator thread.
pub struct StrategyEngine {
    registry: Mutex<Registry>,
    positions: Mutex<PositionBook>,
    risk_manager: Mutex<Option<Arc<RiskManager>>>,
    signal_cb: Mutex<Option<EngineSignalCallback>>,
    position_cb: Mutex<Option<EnginePositionCallback>>,
    error_cb: Mutex<Option<EngineErrorCallback>>,
    position_counter: AtomicU64,
}

impl StrategyEngine {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                strategies: HashMap::new(),
                states: HashMap::new(),
                params: HashMap::new(),
                stats: HashMap::new(),
            }),
            positions: Mutex::new(PositionBook {
                open: HashMap::new(),
                position_to_strategy: HashMap::new(),
                strategy_positions: HashMap::new(),
            }),
            risk_manager: Mutex::new(None),
            signal_cb: Mutex::new(None),
            position_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            position_counter: AtomicU64::new(0),
        }
    }

    // Registry management.

    /// Register a strategy under its unique name, initializing it under the
    /// registry lock and seeding its statistics.
    pub fn register_strategy(&self, strategy: Arc<dyn Strategy>) -> Result<(), EngineError> {
        let name = strategy.name().to_string();
        if name.is_empty() {
            return Err(EngineError::InvalidStrategy("strategy name cannot be empty".into()));
        }

        let mut registry = lock(&self.registry);
        if registry.strategies.contains_key(&name) {
            return Err(EngineError::DuplicateStrategy(name));
        }

        strategy.initialize();

        registry.states.insert(name.clone(), StrategyState::Inactive);
        registry.stats.insert(name.clone(), StrategyStats::new(&name));
        registry.strategies.insert(name.clone(), strategy);
        drop(registry);

        // Registry → positions ordering.
        lock(&self.positions).strategy_positions.entry(name.clone()).or_default();
        info!(strategy = %name, "registered");
        Ok(())
    }

    pub fn remove_strategy(&self, name: &str) -> Result<(), EngineError> {
        let strategy = {
            let mut registry = lock(&self.registry);
            let strategy = registry
                .strategies
                .remove(name)
                .ok_or_else(|| EngineError::StrategyNotFound(name.to_string()))?;
            registry.states.remove(name);
            registry.stats.remove(name);
            registry.params.remove(name);
            strategy
        };
        strategy.stop();
        lock(&self.positions).strategy_positions.remove(name);
        info!(strategy = name, "removed");
        Ok(())
    }

    pub fn strategy(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        lock(&self.registry).strategies.get(name).cloned()
    }

    pub fn available_strategies(&self) -> Vec<String> {
        lock(&self.registry).strategies.keys().cloned().collect()
    }

    pub fn active_strategies(&self) -> Vec<String> {
        lock(&self.registry)
            .states
            .iter()
            .filter(|(_, state)| **state == StrategyState::Active)
            .map(|(name, _)| name.clone())
            .collect()
    }

    // Lifecycle control.

    pub fn start_strategy(&self, name: &str) -> Result<(), EngineError> {
        let strategy = self.lookup(name)?;
        strategy.start();
        lock(&self.registry).states.insert(name.to_string(), StrategyState::Active);
        Ok(())
    }

    pub fn stop_strategy(&self, name: &str) -> Result<(), EngineError> {
        let strategy = self.lookup(name)?;
        strategy.stop();
        lock(&self.registry).states.insert(name.to_string(), StrategyState::Inactive);
        Ok(())
    }

    pub fn pause_strategy(&self, name: &str) -> Result<(), EngineError> {
        let strategy = self.lookup(name)?;
        strategy.pause();
        lock(&self.registry).states.insert(name.to_string(), StrategyState::Paused);
        Ok(())
    }

    pub fn resume_strategy(&self, name: &str) -> Result<(), EngineError> {
        let strategy = self.lookup(name)?;
        strategy.resume();
        lock(&self.registry).states.insert(name.to_string(), StrategyState::Active);
        Ok(())
    }

    pub fn strategy_state(&self, name: &str) -> Result<StrategyState, EngineError> {
        lock(&self.registry)
            .states
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::StrategyNotFound(name.to_string()))
    }

    /// Reset the strategy's rolling state and reseed its statistics. The
    /// strategy comes back Inactive.
    pub fn reset_strategy(&self, name: &str) -> Result<(), EngineError> {
        let strategy = self.lookup(name)?;
        strategy.reset();
        let mut registry = lock(&self.registry);
        registry.states.insert(name.to_string(), StrategyState::Inactive);
        registry.stats.insert(name.to_string(), StrategyStats::new(name));
        Ok(())
    }

    pub fn reset_all_strategies(&self) {
        for name in self.available_strategies() {
            if let Err(err) = self.reset_strategy(&name) {
                warn!(strategy = %name, %err, "reset failed");
            }
        }
    }

    // Configuration.

    pub fn configure_strategy(&self, name: &str, config: &Value) -> Result<(), EngineError> {
        let strategy = self.lookup(name)?;
        if let Err(err) = strategy.configure(config) {
            self.notify_error(name, &err.to_string());
            return Err(EngineError::InvalidStrategy(err.to_string()));
        }
        Ok(())
    }

    pub fn set_strategy_params(&self, name: &str, params: StrategyConfig) -> Result<(), EngineError> {
        let mut registry = lock(&self.registry);
        if !registry.strategies.contains_key(name) {
            return Err(EngineError::StrategyNotFound(name.to_string()));
        }
        registry.params.insert(name.to_string(), params);
        Ok(())
    }

    pub fn strategy_params(&self, name: &str) -> Result<StrategyConfig, EngineError> {
        lock(&self.registry)
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::StrategyNotFound(name.to_string()))
    }

    // Execution.

    /// Run one update for the named strategy. A strategy that is not Active
    /// yields an explanatory Hold; invalid signals degrade to Hold; an
    /// update failure flips the strategy to Error and yields a synthesized
    /// Hold. Neither engine lock is held across the strategy call.
    pub fn execute_strategy(
        &self,
        name: &str,
        candles: &[Candle],
        ticker: &Ticker,
    ) -> Result<Signal, EngineError> {
        let (strategy, state) = {
            let registry = lock(&self.registry);
            let strategy = registry
                .strategies
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::StrategyNotFound(name.to_string()))?;
            let state =
                registry.states.get(name).copied().unwrap_or(StrategyState::Inactive);
            (strategy, state)
        };

        if state != StrategyState::Active {
            return Ok(Signal::hold(name, &ticker.symbol, "Strategy is not active"));
        }

        let started = Instant::now();
        let result = strategy.update(candles, ticker);
        strategy.core().note_execution(started.elapsed());

        let mut signal = match result {
            Ok(signal) => signal,
            Err(err) => {
                lock(&self.registry).states.insert(name.to_string(), StrategyState::Error);
                self.notify_error(name, &format!("strategy execution failed: {err}"));
                return Ok(Signal::hold(name, &ticker.symbol, format!("Execution error: {err}")));
            }
        };

        if !self.is_strategy_active(name) || !strategy.validate_signal(&signal) {
            signal = signal.degraded("Signal validation failed");
        }

        self.notify_signal(name, &signal);
        Ok(signal)
    }

    /// Run one update for every active strategy, isolating failures.
    pub fn execute_all_strategies(&self, candles: &[Candle], ticker: &Ticker) {
        for name in self.active_strategies() {
            if let Err(err) = self.execute_strategy(&name, candles, ticker) {
                error!(strategy = %name, %err, "execution failed");
            }
        }
    }

    // Position lifecycle.

    /// Register an open position with the engine, wiring it to its owning
    /// strategy.
    pub fn register_position(&self, position: Position) -> Result<(), EngineError> {
        if position.id.is_empty() {
            return Err(EngineError::InvalidPosition("position id cannot be empty".into()));
        }
        if position.strategy_name.is_empty() {
            return Err(EngineError::InvalidPosition("strategy name cannot be empty".into()));
        }

        // Registry → positions ordering.
        let strategy = {
            let registry = lock(&self.registry);
            registry
                .strategies
                .get(&position.strategy_name)
                .cloned()
                .ok_or_else(|| EngineError::StrategyNotFound(position.strategy_name.clone()))?
        };

        {
            let mut book = lock(&self.positions);
            book.position_to_strategy.insert(position.id.clone(), position.strategy_name.clone());
            book.strategy_positions
                .entry(position.strategy_name.clone())
                .or_default()
                .push(position.id.clone());
            book.open.insert(position.id.clone(), position.clone());
        }

        strategy.on_position_opened(&position);
        self.notify_position(&position.strategy_name, &position);
        Ok(())
    }

    /// Close a position: remove it from the book, fold the realized PnL
    /// into the owning strategy's statistics, and notify the strategy.
    pub fn close_position(
        &self,
        position_id: &str,
        exit_price: f64,
        pnl: f64,
    ) -> Result<(), EngineError> {
        let (position, strategy_name) = {
            let mut book = lock(&self.positions);
            let position = book
                .open
                .remove(position_id)
                .ok_or_else(|| EngineError::PositionNotFound(position_id.to_string()))?;
            let strategy_name = book.position_to_strategy.remove(position_id).unwrap_or_default();
            if let Some(ids) = book.strategy_positions.get_mut(&strategy_name) {
                ids.retain(|id| id != position_id);
            }
            (position, strategy_name)
        };

        if !strategy_name.is_empty() {
            {
                let mut registry = lock(&self.registry);
                if let Some(stats) = registry.stats.get_mut(&strategy_name) {
                    stats.apply_close(pnl);
                }
            }
            if let Some(strategy) = self.strategy(&strategy_name) {
                strategy.on_position_closed(&position, exit_price, pnl);
            }
        }

        self.notify_position(&strategy_name, &position);
        Ok(())
    }

    /// Re-mark a position against `current_price` and notify the owner.
    pub fn update_position(&self, position_id: &str, current_price: f64) -> Result<(), EngineError> {
        let (position, strategy_name) = {
            let mut book = lock(&self.positions);
            let position = book
                .open
                .get_mut(position_id)
                .ok_or_else(|| EngineError::PositionNotFound(position_id.to_string()))?;
            position.update_mark(current_price);
            let snapshot = position.clone();
            let strategy_name =
                book.position_to_strategy.get(position_id).cloned().unwrap_or_default();
            (snapshot, strategy_name)
        };

        if let Some(strategy) = self.strategy(&strategy_name) {
            strategy.on_position_updated(&position);
        }
        self.notify_position(&strategy_name, &position);
        Ok(())
    }

    pub fn open_positions(&self) -> Vec<Position> {
        lock(&self.positions).open.values().cloned().collect()
    }

    pub fn positions_by_strategy(&self, name: &str) -> Vec<Position> {
        let book = lock(&self.positions);
        book.strategy_positions
            .get(name)
            .map(|ids| ids.iter().filter_map(|id| book.open.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn positions_by_symbol(&self, symbol: &str) -> Vec<Position> {
        lock(&self.positions)
            .open
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Stable position id: `pos_<ms-timestamp>_<monotonic counter>`.
    pub fn generate_position_id(&self) -> String {
        let counter = self.position_counter.fetch_add(1, Ordering::Relaxed);
        format!("pos_{}_{}", now_millis(), counter)
    }

    // Statistics.

    pub fn strategy_statistics(&self, name: &str) -> Result<StrategyStats, EngineError> {
        lock(&self.registry)
            .stats
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::StrategyNotFound(name.to_string()))
    }

    pub fn all_strategy_statistics(&self) -> HashMap<String, StrategyStats> {
        lock(&self.registry).stats.clone()
    }

    pub fn total_pnl(&self) -> f64 {
        lock(&self.registry).stats.values().map(|s| s.total_pnl).sum()
    }

    pub fn total_pnl_by_strategy(&self, name: &str) -> f64 {
        lock(&self.registry).stats.get(name).map(|s| s.total_pnl).unwrap_or(0.0)
    }

    pub fn is_strategy_active(&self, name: &str) -> bool {
        lock(&self.registry).states.get(name) == Some(&StrategyState::Active)
    }

    pub fn active_strategy_count(&self) -> usize {
        lock(&self.registry)
            .states
            .values()
            .filter(|s| **s == StrategyState::Active)
            .count()
    }

    // Risk manager.

    pub fn set_risk_manager(&self, risk_manager: Arc<RiskManager>) {
        *lock(&self.risk_manager) = Some(risk_manager);
    }

    pub fn risk_manager(&self) -> Option<Arc<RiskManager>> {
        lock(&self.risk_manager).clone()
    }

    // Callbacks. Invoked without holding either engine lock.

    pub fn set_signal_callback(&self, cb: EngineSignalCallback) {
        *lock(&self.signal_cb) = Some(cb);
    }

    pub fn set_position_callback(&self, cb: EnginePositionCallback) {
        *lock(&self.position_cb) = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EngineErrorCallback) {
        *lock(&self.error_cb) = Some(cb);
    }

    fn notify_signal(&self, strategy: &str, signal: &Signal) {
        if let Some(cb) = lock(&self.signal_cb).as_ref() {
            cb(strategy, signal);
        }
    }

    fn notify_position(&self, strategy: &str, position: &Position) {
        if let Some(cb) = lock(&self.position_cb).as_ref() {
            cb(strategy, position);
        }
    }

    fn notify_error(&self, strategy: &str, message: &str) {
        error!(strategy, message, "strategy error");
        if let Some(cb) = lock(&self.error_cb).as_ref() {
            cb(strategy, message);
        }
    }

    // Persistence.

    /// Snapshot every registered strategy, keyed by name.
    pub fn export_all_strategies(&self) -> Value {
        let strategies: Vec<(String, Arc<dyn Strategy>)> = {
            let registry = lock(&self.registry);
            registry.strategies.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut out = serde_json::Map::new();
        for (name, strategy) in strategies {
            out.insert(name, strategy.snapshot());
        }
        Value::Object(out)
    }

    /// Restore previously exported snapshots into matching strategies.
    /// Unknown names are skipped; individual failures are isolated.
    pub fn import_strategies(&self, data: &Value) {
        let Some(map) = data.as_object() else {
            return;
        };
        for (name, snapshot) in map {
            let Some(strategy) = self.strategy(name) else {
                warn!(strategy = %name, "import skipped: not registered");
                continue;
            };
            if let Err(err) = strategy.restore(snapshot) {
                warn!(strategy = %name, %err, "import failed");
            }
        }
    }

    pub fn save_strategy_state(&self, name: &str, path: &Path) -> Result<(), EngineError> {
        let strategy = self.lookup(name)?;
        let data = strategy.snapshot();
        let text = serde_json::to_string_pretty(&data)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        fs::write(path, text).map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub fn load_strategy_state(&self, name: &str, path: &Path) -> Result<(), EngineError> {
        let strategy = self.lookup(name)?;
        let text = fs::read_to_string(path).map_err(|e| EngineError::Persistence(e.to_string()))?;
        let data: Value =
            serde_json::from_str(&text).map_err(|e| EngineError::Persistence(e.to_string()))?;
        strategy.restore(&data).map_err(|e| EngineError::Persistence(e.to_string()))
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Strategy>, EngineError> {
        lock(&self.registry)
            .strategies
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::StrategyNotFound(name.to_string()))
    }
}

impl Default for StrategyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderSide, SignalKind};
    use crate::strategy::test_support::candles_from_closes;
    use crate::strategy::{
        RsiStrategy, SmaStrategy, StrategyCore, StrategyError, StrategyKind,
    };
    use std::sync::atomic::AtomicBool;

    /// Minimal strategy double whose update can be made to fail.
    struct FailingStrategy {
        core: StrategyCore,
        fail: AtomicBool,
    }

    impl FailingStrategy {
        fn new() -> Self {
            Self { core: StrategyCore::new("Failing Strategy"), fail: AtomicBool::new(false) }
        }
    }

    impl Strategy for FailingStrategy {
        fn core(&self) -> &StrategyCore {
            &self.core
        }
        fn description(&self) -> &'static str {
            "test double"
        }
        fn kind(&self) -> StrategyKind {
            StrategyKind::Swing
        }
        fn configure(&self, _params: &Value) -> Result<(), StrategyError> {
            Ok(())
        }
        fn initialize(&self) {
            self.core.set_initialized(true);
        }
        fn reset(&self) {}
        fn update(&self, _candles: &[Candle], ticker: &Ticker) -> Result<Signal, StrategyError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(StrategyError::Internal("synthetic failure".into()))
            } else {
                Ok(Signal::hold(self.name(), &ticker.symbol, ""))
            }
        }
        fn on_position_opened(&self, _position: &Position) {}
        fn on_position_closed(&self, _position: &Position, _exit_price: f64, _pnl: f64) {}
        fn on_position_updated(&self, _position: &Position) {}
        fn validate_signal(&self, _signal: &Signal) -> bool {
            true
        }
        fn position_size(&self, _symbol: &str, _price: f64, _balance: f64) -> f64 {
            0.0
        }
        fn snapshot(&self) -> Value {
            serde_json::json!({ "type": "FailingStrategy" })
        }
        fn restore(&self, _data: &Value) -> Result<(), StrategyError> {
            Ok(())
        }
        fn required_indicators(&self) -> Vec<&'static str> {
            vec![]
        }
    }

    fn ticker(symbol: &str, price: f64) -> Ticker {
        Ticker::from_last(symbol, price, now_millis())
    }

    fn sample_position(engine: &StrategyEngine, strategy_name: &str, symbol: &str) -> Position {
        Position {
            id: engine.generate_position_id(),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            entry_price: 100.0,
            quantity: 1.0,
            entry_time: now_millis(),
            stop_loss: 98.0,
            take_profit: 104.0,
            strategy_name: strategy_name.to_string(),
            current_price: 100.0,
            unrealized_pnl: 0.0,
            commission: 0.0,
        }
    }

    #[test]
    fn register_rejects_duplicate_name() {
        let engine = StrategyEngine::new();
        engine.register_strategy(Arc::new(RsiStrategy::new())).unwrap();
        let result = engine.register_strategy(Arc::new(RsiStrategy::new()));
        assert!(matches!(result, Err(EngineError::DuplicateStrategy(_))));
    }

    #[test]
    fn execute_unknown_strategy_errors() {
        let engine = StrategyEngine::new();
        let result = engine.execute_strategy("nope", &[], &ticker("BTCUSDT", 100.0));
        assert!(matches!(result, Err(EngineError::StrategyNotFound(_))));
    }

    #[test]
    fn execute_inactive_strategy_returns_explanatory_hold() {
        let engine = StrategyEngine::new();
        engine.register_strategy(Arc::new(RsiStrategy::new())).unwrap();
        let signal = engine
            .execute_strategy(RsiStrategy::NAME, &[], &ticker("BTCUSDT", 100.0))
            .unwrap();
        assert!(signal.kind.is_hold());
        assert_eq!(signal.message, "Strategy is not active");
    }

    #[test]
    fn update_failure_flips_strategy_to_error() {
        let engine = StrategyEngine::new();
        let failing = Arc::new(FailingStrategy::new());
        engine.register_strategy(failing.clone()).unwrap();
        engine.start_strategy("Failing Strategy").unwrap();

        failing.fail.store(true, Ordering::SeqCst);
        let signal = engine
            .execute_strategy("Failing Strategy", &[], &ticker("BTCUSDT", 100.0))
            .unwrap();
        assert!(signal.kind.is_hold());
        assert!(signal.message.contains("Execution error"));
        assert_eq!(engine.strategy_state("Failing Strategy").unwrap(), StrategyState::Error);
    }

    #[test]
    fn execute_active_sma_emits_crossover_through_engine() {
        use crate::strategy::sma::SmaParams;

        let engine = StrategyEngine::new();
        let strategy = Arc::new(SmaStrategy::with_params(SmaParams {
            fast_period: 3,
            slow_period: 5,
            use_slope_filter: false,
            ..SmaParams::default()
        }));
        engine.register_strategy(strategy).unwrap();
        engine.start_strategy(SmaStrategy::NAME).unwrap();

        let closes = [10.0, 10.0, 10.0, 10.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0];
        let candles = candles_from_closes(&closes);
        let mut saw_buy = false;
        for candle in &candles {
            let t = ticker("BTCUSDT", candle.close);
            let signal = engine
                .execute_strategy(SmaStrategy::NAME, std::slice::from_ref(candle), &t)
                .unwrap();
            if signal.kind == SignalKind::Buy {
                saw_buy = true;
            }
        }
        assert!(saw_buy, "expected a Buy signal through the engine path");
    }

    #[test]
    fn position_lifecycle_maintains_book_invariants() {
        let engine = StrategyEngine::new();
        engine.register_strategy(Arc::new(RsiStrategy::new())).unwrap();

        let position = sample_position(&engine, RsiStrategy::NAME, "BTCUSDT");
        let id = position.id.clone();
        engine.register_position(position).unwrap();

        assert_eq!(engine.open_positions().len(), 1);
        assert_eq!(engine.positions_by_strategy(RsiStrategy::NAME).len(), 1);
        assert_eq!(engine.positions_by_symbol("BTCUSDT").len(), 1);
        assert_eq!(engine.positions_by_symbol("ETHUSDT").len(), 0);

        engine.update_position(&id, 105.0).unwrap();
        let updated = &engine.open_positions()[0];
        assert_eq!(updated.current_price, 105.0);
        assert_eq!(updated.unrealized_pnl, 5.0);

        engine.close_position(&id, 105.0, 5.0).unwrap();
        assert!(engine.open_positions().is_empty());
        assert!(engine.positions_by_strategy(RsiStrategy::NAME).is_empty());
        // A closed id never reappears.
        assert!(matches!(
            engine.close_position(&id, 105.0, 5.0),
            Err(EngineError::PositionNotFound(_))
        ));

        let stats = engine.strategy_statistics(RsiStrategy::NAME).unwrap();
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.total_trades, stats.winning_trades + stats.losing_trades);
        assert_eq!(stats.total_pnl, 5.0);
        assert_eq!(engine.total_pnl(), 5.0);
    }

    #[test]
    fn stats_drawdown_grows_on_loss_and_recovers_on_gain() {
        let mut stats = StrategyStats::new("s");
        stats.apply_close(-10.0);
        assert_eq!(stats.current_drawdown, 10.0);
        assert_eq!(stats.max_drawdown, 10.0);
        stats.apply_close(4.0);
        assert_eq!(stats.current_drawdown, 6.0);
        assert_eq!(stats.max_drawdown, 10.0);
        stats.apply_close(20.0);
        assert_eq!(stats.current_drawdown, 0.0);
        assert_eq!(stats.win_rate, 2.0 / 3.0 * 100.0);
    }

    #[test]
    fn register_position_requires_known_strategy() {
        let engine = StrategyEngine::new();
        let mut position = Position {
            id: engine.generate_position_id(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            entry_price: 100.0,
            quantity: 1.0,
            entry_time: now_millis(),
            stop_loss: 0.0,
            take_profit: 0.0,
            strategy_name: "ghost".into(),
            current_price: 100.0,
            unrealized_pnl: 0.0,
            commission: 0.0,
        };
        assert!(matches!(
            engine.register_position(position.clone()),
            Err(EngineError::StrategyNotFound(_))
        ));

        position.strategy_name.clear();
        assert!(matches!(
            engine.register_position(position),
            Err(EngineError::InvalidPosition(_))
        ));
    }

    #[test]
    fn generated_ids_are_unique_and_well_formed() {
        let engine = StrategyEngine::new();
        let a = engine.generate_position_id();
        let b = engine.generate_position_id();
        assert_ne!(a, b);
        assert!(a.starts_with("pos_"));
        let parts: Vec<&str> = a.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<i64>().is_ok());
        assert!(parts[2].parse::<u64>().is_ok());
    }

    #[test]
    fn export_import_roundtrip_preserves_strategy_config() {
        let engine = StrategyEngine::new();
        engine.register_strategy(Arc::new(RsiStrategy::new())).unwrap();
        engine
            .configure_strategy(RsiStrategy::NAME, &serde_json::json!({ "period": 21 }))
            .unwrap();

        let exported = engine.export_all_strategies();

        let other = StrategyEngine::new();
        other.register_strategy(Arc::new(RsiStrategy::new())).unwrap();
        other.import_strategies(&exported);

        let restored = other.strategy(RsiStrategy::NAME).unwrap();
        let snapshot = restored.snapshot();
        assert_eq!(snapshot["config"]["period"], 21);
    }

    #[test]
    fn save_and_load_strategy_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rsi.json");

        let engine = StrategyEngine::new();
        engine.register_strategy(Arc::new(RsiStrategy::new())).unwrap();
        engine
            .configure_strategy(RsiStrategy::NAME, &serde_json::json!({ "period": 10 }))
            .unwrap();
        engine.save_strategy_state(RsiStrategy::NAME, &path).unwrap();

        let other = StrategyEngine::new();
        other.register_strategy(Arc::new(RsiStrategy::new())).unwrap();
        other.load_strategy_state(RsiStrategy::NAME, &path).unwrap();
        let snapshot = other.strategy(RsiStrategy::NAME).unwrap().snapshot();
        assert_eq!(snapshot["config"]["period"], 10);
    }

    #[test]
    fn signal_callback_fires_on_execute() {
        use std::sync::atomic::AtomicUsize;

        let engine = StrategyEngine::new();
        engine.register_strategy(Arc::new(RsiStrategy::new())).unwrap();
        engine.start_strategy(RsiStrategy::NAME).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        engine.set_signal_callback(Box::new(move |_name, _signal| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        let closes = [100.0, 101.0];
        let candles = candles_from_closes(&closes);
        engine
            .execute_strategy(RsiStrategy::NAME, &candles, &ticker("BTCUSDT", 101.0))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
