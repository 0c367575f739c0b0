//! TradeFlow CLI.
//!
//! `tradeflow backtest` replays historical candles through a configured
//! strategy and writes the result as JSON. `tradeflow live` runs the full
//! engine + risk pipeline as a paper session over a candle file — the
//! wiring point where real venue adapters would replace the paper
//! exchange. API credentials come from the environment
//! (`TRADEFLOW_API_KEY` / `TRADEFLOW_API_SECRET`), never from config
//! files.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tradeflow_core::backtest::{data, Backtester};
use tradeflow_core::config::AppConfig;
use tradeflow_core::domain::{OrderSide, SignalKind};
use tradeflow_core::engine::StrategyEngine;
use tradeflow_core::exchange::{ExchangeClient, OrderRequest, OrderType, PaperExchange};
use tradeflow_core::risk::RiskManager;
use tradeflow_core::strategy::{MacdStrategy, RsiStrategy, SmaStrategy, Strategy};

#[derive(Parser)]
#[command(name = "tradeflow", about = "Crypto spot trading engine", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "tradeflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay historical candles through the configured strategy.
    Backtest {
        /// CSV candle file; overrides `data_file` from the config.
        #[arg(long)]
        data: Option<PathBuf>,
        /// Where the result JSON is written.
        #[arg(long, default_value = "backtest_result.json")]
        output: PathBuf,
    },
    /// Paper-trade the configured strategies over a candle file.
    Live {
        /// CSV candle file replayed as the live feed.
        #[arg(long)]
        data: PathBuf,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    match cli.command {
        Command::Backtest { data, output } => run_backtest(&config, data, &output),
        Command::Live { data } => run_live(&config, &data),
    }
}

/// Instantiate the configured strategies. Unknown types are an error;
/// disabled entries are skipped.
fn build_strategies(config: &AppConfig) -> Result<Vec<Arc<dyn Strategy>>> {
    let mut strategies: Vec<Arc<dyn Strategy>> = Vec::new();
    for section in &config.strategies {
        if !section.enabled {
            continue;
        }
        let strategy: Arc<dyn Strategy> = match section.strategy_type.as_str() {
            "rsi" => Arc::new(RsiStrategy::new()),
            "sma" => Arc::new(SmaStrategy::new()),
            "macd" => Arc::new(MacdStrategy::new()),
            other => bail!("unknown strategy type '{other}'"),
        };
        strategy
            .configure(&section.params_json())
            .with_context(|| format!("invalid parameters for strategy '{}'", section.strategy_type))?;
        strategies.push(strategy);
    }
    if strategies.is_empty() {
        bail!("no enabled strategies configured");
    }
    Ok(strategies)
}

fn run_backtest(config: &AppConfig, data: Option<PathBuf>, output: &std::path::Path) -> Result<()> {
    let backtest_config = config
        .to_backtest_config()
        .context("invalid [backtest] section")?
        .context("config has no [backtest] section")?;

    let data_file = data.or_else(|| {
        config.backtest.as_ref().and_then(|b| b.data_file.as_ref().map(PathBuf::from))
    });
    let Some(data_file) = data_file else {
        bail!("no candle data: pass --data or set backtest.data_file");
    };

    let mut strategies = build_strategies(config)?;
    if strategies.len() > 1 {
        warn!("backtest drives a single strategy; using the first enabled entry");
    }
    let strategy = strategies.remove(0);

    let mut backtester = Backtester::new(backtest_config);
    backtester.set_strategy(strategy);
    backtester.load_historical_data(&data_file).context("loading historical data")?;

    let result = backtester.run().context("backtest failed")?;
    result.save_to_json(output).context("writing result")?;

    let s = &result.summary;
    info!(
        pair = %s.pair,
        trades = s.total_trades,
        win_rate = format!("{:.1}%", s.win_rate),
        total_return = format!("{:.2}%", s.total_return),
        max_drawdown = format!("{:.2}%", s.max_drawdown),
        sharpe = format!("{:.2}", s.sharpe_ratio),
        output = %output.display(),
        "backtest finished"
    );
    Ok(())
}

/// Paper session: the engine and risk manager run exactly as they would
/// live, fed by candles replayed through the paper venue.
fn run_live(config: &AppConfig, data: &std::path::Path) -> Result<()> {
    let api_key = std::env::var("TRADEFLOW_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        info!("no API credentials in environment; running against the paper exchange");
    }

    let symbol = config
        .backtest
        .as_ref()
        .map(|b| b.symbol.clone())
        .unwrap_or_else(|| "BTCUSDT".to_string());

    let candles = data::load_csv(data).context("loading candle file")?;
    if candles.is_empty() {
        bail!("candle file is empty");
    }

    let exchange = PaperExchange::new();
    exchange.initialize().context("initializing paper exchange")?;
    exchange.seed_candles(&symbol, candles.clone());

    let risk = Arc::new(RiskManager::with_params(config.risk.clone()));
    let engine = Arc::new(StrategyEngine::new());
    engine.set_risk_manager(Arc::clone(&risk));
    engine.set_error_callback(Box::new(|strategy, message| {
        warn!(strategy, message, "strategy error");
    }));

    for strategy in build_strategies(config)? {
        let name = strategy.name().to_string();
        engine.register_strategy(strategy).context("registering strategy")?;
        engine.start_strategy(&name).context("starting strategy")?;
    }

    let balance = risk.account_balance();
    let mut session_pnl = 0.0;

    for candle in &candles {
        exchange.set_last_price(&symbol, candle.close);
        let ticker = exchange.ticker(&symbol).context("reading ticker")?;

        for name in engine.active_strategies() {
            let signal = match engine.execute_strategy(&name, std::slice::from_ref(candle), &ticker)
            {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(strategy = %name, %err, "execution failed");
                    continue;
                }
            };

            match signal.kind {
                SignalKind::Buy | SignalKind::Sell => {
                    let side =
                        if signal.kind == SignalKind::Buy { OrderSide::Buy } else { OrderSide::Sell };
                    let quantity = risk.calculate_position_size(&symbol, signal.price, balance);
                    if quantity <= 0.0 {
                        continue;
                    }
                    if !risk.check_position_allowed(&symbol, side, quantity, signal.price) {
                        continue;
                    }
                    let order = match exchange.place_order(&OrderRequest {
                        symbol: symbol.clone(),
                        side,
                        order_type: OrderType::Market,
                        quantity,
                        price: None,
                    }) {
                        Ok(order) => order,
                        Err(err) => {
                            warn!(%err, "order rejected by venue");
                            continue;
                        }
                    };
                    let (stop_loss, take_profit) =
                        risk.calculate_exit_levels(&symbol, side, order.price);
                    let position = tradeflow_core::domain::Position {
                        id: engine.generate_position_id(),
                        symbol: symbol.clone(),
                        side,
                        entry_price: order.price,
                        quantity: order.executed_qty,
                        entry_time: candle.open_time,
                        stop_loss,
                        take_profit,
                        strategy_name: name.clone(),
                        current_price: order.price,
                        unrealized_pnl: 0.0,
                        commission: 0.0,
                    };
                    risk.register_position(&position);
                    engine.register_position(position).context("registering position")?;
                }
                SignalKind::CloseLong | SignalKind::CloseShort => {
                    for position in engine.positions_by_strategy(&name) {
                        let pnl = position.unrealized_pnl;
                        risk.close_position(&position.id, signal.price, pnl);
                        engine.close_position(&position.id, signal.price, pnl).ok();
                        session_pnl += pnl;
                    }
                }
                _ => {}
            }
        }

        // Mark every open position and let stop/take levels fire.
        for position in engine.open_positions() {
            engine.update_position(&position.id, candle.close).ok();
            let hit_stop = position.side == OrderSide::Buy && candle.close <= position.stop_loss
                || position.side == OrderSide::Sell && candle.close >= position.stop_loss;
            let hit_target = position.side == OrderSide::Buy && candle.close >= position.take_profit
                || position.side == OrderSide::Sell && candle.close <= position.take_profit;
            if hit_stop || hit_target {
                let pnl = match position.side {
                    OrderSide::Buy => (candle.close - position.entry_price) * position.quantity,
                    OrderSide::Sell => (position.entry_price - candle.close) * position.quantity,
                };
                risk.close_position(&position.id, candle.close, pnl);
                engine.close_position(&position.id, candle.close, pnl).ok();
                session_pnl += pnl;
            }
        }
    }

    let open = engine.open_positions().len();
    info!(
        candles = candles.len(),
        session_pnl = format!("{session_pnl:.2}"),
        open_positions = open,
        today_pnl = format!("{:.2}", risk.today_pnl()),
        alerts = risk.active_alerts().len(),
        "paper session finished"
    );
    Ok(())
}
