//! Run command: scan and monitor loops against the paper or live backend

use anyhow::{bail, Context, Result};
use chrono::Utc;
use fib_short::backend::{fill_channel, LiveBackend, PaperBackend, TradingBackend};
use fib_short::binance::BinanceClient;
use fib_short::config::TradingMode;
use fib_short::engine::Engine;
use fib_short::market::{BinanceMarketData, MarketData};
use fib_short::notify::{build_sinks, EventBus};
use fib_short::oms::PositionState;
use fib_short::state_manager::{create_state_manager, StateStore};
use fib_short::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn run(config_path: String, paper: bool, live: bool, interval: Option<u64>) -> Result<()> {
    if paper && live {
        bail!("--paper and --live are mutually exclusive");
    }

    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);
    if paper {
        config.trading.mode = TradingMode::Paper;
    } else if live {
        config.trading.mode = TradingMode::Live;
    }
    if let Some(secs) = interval {
        info!("Overriding scan interval to: {}s", secs);
        config.scanner.scan_interval_secs = secs;
    }
    config.validate()?;

    let store = Arc::new(create_state_manager(
        &config.state.state_dir,
        config.state.auto_backup,
    )?);
    let mut leftovers = store.load_positions(true)?;
    if !leftovers.is_empty() && !config.is_live() {
        // The simulated ledger starts empty, so its old orders no longer exist
        warn!(
            "Discarding {} paper positions left open by the last session",
            leftovers.len()
        );
        for mut position in leftovers.drain(..) {
            warn!("  {} {} {}", position.symbol, position.case, position.state);
            position.state = PositionState::Cancelled;
            position.closed_at = Some(Utc::now());
            store.save_position(&position)?;
        }
    }

    let client = Arc::new(BinanceClient::new(&config.exchange)?);
    let market: Arc<dyn MarketData> = Arc::new(BinanceMarketData::new(client.clone()));
    let (fill_tx, fill_rx) = fill_channel();

    let backend: Arc<dyn TradingBackend> = if config.is_live() {
        if !client.has_credentials() {
            bail!("Live trading requires BINANCE_API_KEY and BINANCE_API_SECRET");
        }
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 5 seconds to abort...");
        tokio::time::sleep(Duration::from_secs(5)).await;

        let backend = LiveBackend::new(client.clone(), config.trading.leverage, fill_tx);
        backend
            .load_rules()
            .await
            .context("Failed to load contract trading rules")?;
        Arc::new(backend)
    } else {
        let mut backend = PaperBackend::new(&config.trading, fill_tx);
        match store.load_checkpoint()? {
            Some(checkpoint) if checkpoint.paper_mode => {
                info!(
                    "Resuming paper balance {:.4} from checkpoint of {}",
                    checkpoint.balance, checkpoint.timestamp
                );
                backend = backend.with_balance(checkpoint.balance);
            }
            _ => info!("Paper trading with {:.4} USDT", config.trading.initial_balance),
        }
        Arc::new(backend)
    };

    let (bus, _dispatcher) = EventBus::spawn(build_sinks(&config.notifications)?);
    let engine = Arc::new(Engine::new(config, backend, market, fill_rx, bus).with_store(store.clone()));
    if !leftovers.is_empty() {
        let resumed = engine.restore(leftovers).await;
        info!("Resumed {} positions from the last session", resumed);
    }

    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    store.export_json()?;
    info!("State saved, exiting");
    Ok(())
}
