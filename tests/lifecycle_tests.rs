//! Position lifecycle tests
//!
//! These drive the engine with the paper backend and a scripted market, the
//! same way the monitor loop does: price ticks go to the backend first, fills
//! are pumped into the symbol workers, and the engine settles before checks.

use anyhow::{anyhow, Result};
use approx::assert_relative_eq;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

use fib_short::backend::{fill_channel, PaperBackend, TradingBackend};
use fib_short::engine::Engine;
use fib_short::error::{AdmissionError, BackendError};
use fib_short::market::MarketData;
use fib_short::notify::{EventBus, LifecycleEvent};
use fib_short::oms::{
    CancelOutcome, ExitReason, OrderId, OrderRequest, OrderStatus, PlacedOrder, Position,
    PositionState,
};
use fib_short::state_manager::create_state_manager;
use fib_short::strategy::{Case, EntryProposal, FibShortStrategy};
use fib_short::{Candle, Config, Symbol, Timeframe};

// =============================================================================
// Test Utilities
// =============================================================================

fn sol() -> Symbol {
    Symbol::new("SOLUSDT")
}

fn bars(closes: &[f64]) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| Candle::new_unchecked(start + Duration::hours(i as i64), c, c, c, c, 10.0))
        .collect()
}

/// 100 → 200 → 100 swing followed by a flat tail at 150
fn swing_window() -> Vec<Candle> {
    let mut closes: Vec<f64> = (0..=20).map(|i| 100.0 + 5.0 * i as f64).collect();
    closes.extend((21..=40).map(|i| 200.0 - 5.0 * (i - 20) as f64));
    closes.extend(std::iter::repeat(150.0).take(10));
    bars(&closes)
}

fn config() -> Config {
    let mut config = Config::default();
    config.trading.pairs = vec!["SOLUSDT".to_string()];
    config.swing.min_bars = 40;
    config.swing.deviation_pct = Some(3.0);
    config.swing.depth = Some(5);
    config.scanner.rsi_threshold = 0.0;
    config.scanner.first_scan_delay_secs = 0;
    config.execution.retry_attempts = 3;
    config.execution.retry_initial_backoff_ms = 1;
    config
}

/// Market whose bars and prices are set by the test
#[derive(Default)]
struct ScriptedMarket {
    symbols: Mutex<HashMap<Symbol, (Vec<Candle>, f64)>>,
}

impl ScriptedMarket {
    fn with(symbol: Symbol, bars: Vec<Candle>, price: f64) -> Self {
        let market = Self::default();
        market.symbols.lock().unwrap().insert(symbol, (bars, price));
        market
    }
}

#[async_trait]
impl MarketData for ScriptedMarket {
    async fn bars(&self, symbol: &Symbol, _tf: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let symbols = self.symbols.lock().unwrap();
        let (bars, _) = symbols.get(symbol).ok_or_else(|| anyhow!("no data for {}", symbol))?;
        Ok(bars[bars.len().saturating_sub(limit)..].to_vec())
    }

    async fn current_price(&self, symbol: &Symbol) -> Result<f64> {
        let symbols = self.symbols.lock().unwrap();
        symbols
            .get(symbol)
            .map(|(_, price)| *price)
            .ok_or_else(|| anyhow!("no price for {}", symbol))
    }

    async fn top_pairs(&self, limit: usize) -> Result<Vec<Symbol>> {
        let mut pairs: Vec<Symbol> = self.symbols.lock().unwrap().keys().cloned().collect();
        pairs.sort();
        pairs.truncate(limit);
        Ok(pairs)
    }
}

/// Paper account whose cancels always fail with a transient error
struct CancelsFail {
    inner: Arc<PaperBackend>,
    cancels: AtomicU32,
}

#[async_trait]
impl TradingBackend for CancelsFail {
    fn name(&self) -> &str {
        "cancels-fail"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, BackendError> {
        self.inner.place_order(request).await
    }

    async fn cancel_order(
        &self,
        _symbol: &Symbol,
        _order_id: &OrderId,
    ) -> Result<CancelOutcome, BackendError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Network("connection reset by peer".into()))
    }

    async fn available_margin(&self) -> Result<f64, BackendError> {
        self.inner.available_margin().await
    }

    async fn on_price(
        &self,
        symbol: &Symbol,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        self.inner.on_price(symbol, price, at).await
    }
}

struct Harness {
    engine: Arc<Engine>,
    paper: Arc<PaperBackend>,
    events: UnboundedReceiver<LifecycleEvent>,
    config: Config,
}

impl Harness {
    fn new(config: Config, price: f64) -> Self {
        Self::build(config, price, |paper| paper as Arc<dyn TradingBackend>)
    }

    fn build(
        config: Config,
        price: f64,
        wrap: impl FnOnce(Arc<PaperBackend>) -> Arc<dyn TradingBackend>,
    ) -> Self {
        let (tx, rx) = fill_channel();
        let paper = Arc::new(PaperBackend::new(&config.trading, tx));
        let market = Arc::new(ScriptedMarket::with(sol(), swing_window(), price));
        let (bus, events) = EventBus::channel();
        let engine = Engine::new(config.clone(), wrap(paper.clone()), market, rx, bus);
        Self {
            engine: Arc::new(engine),
            paper,
            events,
            config,
        }
    }

    fn proposal(&self, price: f64) -> EntryProposal {
        FibShortStrategy::from_config(&self.config)
            .evaluate(&sol(), &swing_window(), price, None)
            .unwrap()
    }

    async fn tick(&self, price: f64) {
        self.engine.on_price(&sol(), price).await;
        self.engine.settle().await;
    }

    async fn position(&self) -> Position {
        self.engine.position(&sol()).await.expect("position exists")
    }

    fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_scan_cycle_admits_case_1() {
    let h = Harness::new(config(), 155.0);

    let report = h.engine.scan_cycle().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.proposals, 1);
    assert_eq!(report.admitted, 1);

    let pos = h.position().await;
    assert_eq!(pos.case, Case::Case1);
    assert_eq!(pos.state, PositionState::EntryPending);
    let primary = pos.primary_order_id.clone().unwrap();
    let secondary = pos.secondary_order_id.clone().unwrap();
    assert_eq!(h.paper.order_status(&primary), Some(OrderStatus::Pending));
    assert_eq!(h.paper.order_status(&secondary), Some(OrderStatus::Pending));
}

#[tokio::test]
async fn test_no_second_position_per_symbol() {
    let h = Harness::new(config(), 155.0);
    h.engine.scan_cycle().await.unwrap();

    let report = h.engine.scan_cycle().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(report.admitted, 0);
    assert_eq!(report.skipped.get("position_open"), Some(&1));

    let direct = h.engine.propose(h.proposal(155.0)).await;
    assert!(matches!(
        direct,
        Err(AdmissionError::PositionOpen(PositionState::EntryPending))
    ));
    assert_eq!(h.engine.positions().await.len(), 1);
}

#[tokio::test]
async fn test_insufficient_margin_places_nothing() {
    let mut config = config();
    config.trading.initial_balance = 5.0;
    let h = Harness::new(config, 155.0);

    // CASE_1 needs two orders of 3.0 margin each
    let result = h.engine.propose(h.proposal(155.0)).await;
    match result {
        Err(AdmissionError::Capacity(e)) => {
            assert_relative_eq!(e.available, 5.0);
            assert_relative_eq!(e.required, 6.0);
        }
        other => panic!("expected capacity error, got {:?}", other),
    }
    assert!(h.engine.positions().await.is_empty());
    assert_relative_eq!(h.paper.available_margin().await.unwrap(), 5.0);
}

// =============================================================================
// Lifecycle scenarios
// =============================================================================

#[tokio::test]
async fn test_take_profit_before_secondary_cancels_secondary() {
    let mut h = Harness::new(config(), 155.0);
    let proposal = h.proposal(155.0);
    let primary_price = proposal.plan.primary_price.unwrap();
    let secondary_price = proposal.plan.secondary_price.unwrap();
    h.engine.propose(proposal).await.unwrap();

    h.tick(primary_price).await;
    let pos = h.position().await;
    assert_eq!(pos.state, PositionState::OpenSingle);
    assert_relative_eq!(pos.take_profit_price, 145.0, epsilon = 1e-9);

    h.tick(144.0).await;
    let pos = h.position().await;
    assert_eq!(pos.state, PositionState::ClosedTp);
    assert_eq!(pos.exit_reason, Some(ExitReason::TakeProfit));
    let secondary = pos.secondary_order_id.clone().unwrap();
    assert_eq!(h.paper.order_status(&secondary), Some(OrderStatus::Cancelled));
    let stop = pos.stop_loss_order_id.clone().unwrap();
    assert_eq!(h.paper.order_status(&stop), Some(OrderStatus::Cancelled));

    // The secondary level is reached afterwards: nothing may fill
    h.tick(secondary_price + 1.0).await;
    assert_eq!(h.paper.order_status(&secondary), Some(OrderStatus::Cancelled));
    assert_eq!(h.position().await.state, PositionState::ClosedTp);
    assert_eq!(h.paper.position_quantity(&sol()), 0.0);

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::PositionClosed { exit_reason: ExitReason::TakeProfit, .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::PositionAveraged { .. })));
}

#[tokio::test]
async fn test_secondary_fill_activates_dynamic_take_profit() {
    let mut h = Harness::new(config(), 155.0);
    let proposal = h.proposal(155.0);
    let (p1, q1) = (proposal.plan.primary_price.unwrap(), proposal.primary_quantity);
    let (p2, q2) = (
        proposal.plan.secondary_price.unwrap(),
        proposal.secondary_quantity.unwrap(),
    );
    h.engine.propose(proposal).await.unwrap();

    h.tick(p1).await;
    let first_tp = h.position().await.take_profit_order_id.unwrap();
    h.tick(p2).await;

    let pos = h.position().await;
    assert_eq!(pos.state, PositionState::OpenAveraged);
    assert_eq!(pos.entries.len(), 2);
    assert_relative_eq!(pos.total_quantity, q1 + q2, epsilon = 1e-12);
    assert_relative_eq!(
        pos.average_entry_price,
        (p1 * q1 + p2 * q2) / (q1 + q2),
        epsilon = 1e-9
    );
    assert_relative_eq!(pos.take_profit_price, 150.0, epsilon = 1e-9);

    let new_tp = pos.take_profit_order_id.clone().unwrap();
    assert_ne!(new_tp, first_tp);
    assert_eq!(h.paper.order_status(&first_tp), Some(OrderStatus::Cancelled));
    assert_eq!(h.paper.order_status(&new_tp), Some(OrderStatus::Pending));
    assert_relative_eq!(h.paper.position_quantity(&sol()), q1 + q2, epsilon = 1e-12);

    // Above the original 145 target, below the dynamic 150 one
    h.tick(149.0).await;
    let pos = h.position().await;
    assert_eq!(pos.state, PositionState::ClosedTp);
    assert!(pos.net_pnl() > 0.0);
    assert_eq!(h.paper.position_quantity(&sol()), 0.0);

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::DynamicTpActivated { .. })));
}

#[tokio::test]
async fn test_case_4_stop_loss_cancels_take_profit() {
    let mut config = config();
    config.cases.case_4.stop_loss = 1.10;
    let mut h = Harness::new(config, 205.0);
    let proposal = h.proposal(205.0);
    assert_eq!(proposal.case, Case::Case4);
    let quantity = proposal.primary_quantity;

    h.engine.propose(proposal).await.unwrap();
    h.engine.settle().await;

    let pos = h.position().await;
    assert_eq!(pos.state, PositionState::OpenSingle);
    assert_relative_eq!(pos.average_entry_price, 205.0, epsilon = 1e-9);
    assert_relative_eq!(pos.take_profit_price, 160.0, epsilon = 1e-9);
    assert_relative_eq!(pos.plan.stop_loss, 210.0, epsilon = 1e-9);

    h.tick(210.0).await;
    let pos = h.position().await;
    assert_eq!(pos.state, PositionState::ClosedSl);
    assert_eq!(pos.exit_reason, Some(ExitReason::StopLoss));
    let tp = pos.take_profit_order_id.clone().unwrap();
    assert_eq!(h.paper.order_status(&tp), Some(OrderStatus::Cancelled));

    let record = pos.to_record().unwrap();
    assert_relative_eq!(record.pnl, (205.0 - 210.0) * quantity, epsilon = 1e-9);
    assert!(record.net_pnl < record.pnl);

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::PositionClosed { exit_reason: ExitReason::StopLoss, .. })));
}

#[tokio::test]
async fn test_pending_entry_cancelled_below_zone() {
    let mut h = Harness::new(config(), 155.0);
    h.engine.propose(h.proposal(155.0)).await.unwrap();

    // CASE_1 abandons its entries once price reaches the 0.20 level
    h.tick(125.0).await;
    assert_eq!(h.position().await.state, PositionState::EntryPending);
    h.tick(119.0).await;

    let pos = h.position().await;
    assert_eq!(pos.state, PositionState::Cancelled);
    for id in [pos.primary_order_id.unwrap(), pos.secondary_order_id.unwrap()] {
        assert_eq!(h.paper.order_status(&id), Some(OrderStatus::Cancelled));
    }
    assert!(h.engine.active_symbols().is_empty());
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, LifecycleEvent::EntryCancelled { .. })));

    // A new setup may be admitted once the old one is terminal
    h.engine.propose(h.proposal(155.0)).await.unwrap();
    assert_eq!(h.position().await.state, PositionState::EntryPending);
}

#[tokio::test]
async fn test_gap_through_secondary_and_stop_is_not_an_inconsistency() {
    let mut h = Harness::new(config(), 155.0);
    let proposal = h.proposal(155.0);
    let primary_price = proposal.plan.primary_price.unwrap();
    h.engine.propose(proposal).await.unwrap();

    h.tick(primary_price).await;
    assert_eq!(h.position().await.state, PositionState::OpenSingle);

    // One tick gaps through the secondary at 178.6 and the stop at 200
    h.tick(201.0).await;
    let pos = h.position().await;
    assert_eq!(pos.state, PositionState::ClosedSl);
    assert_eq!(pos.entries.len(), 2);
    assert!(!pos.inconsistent);
    assert_eq!(h.paper.position_quantity(&sol()), 0.0);

    // Later syncs find nothing left to explain
    h.engine.monitor_tick().await;
    h.engine.monitor_tick().await;
    assert!(!h.engine.is_busy(&sol()));
    assert!(!h
        .drain_events()
        .iter()
        .any(|e| matches!(e, LifecycleEvent::InconsistentState { .. })));

    h.engine.propose(h.proposal(155.0)).await.unwrap();
    assert_eq!(h.position().await.state, PositionState::EntryPending);
}

#[tokio::test]
async fn test_failed_cancels_flag_symbol_inconsistent() {
    let backend = Arc::new(Mutex::new(None::<Arc<CancelsFail>>));
    let slot = backend.clone();
    let mut h = Harness::build(config(), 155.0, move |paper| {
        let wrapped = Arc::new(CancelsFail {
            inner: paper,
            cancels: AtomicU32::new(0),
        });
        *slot.lock().unwrap() = Some(wrapped.clone());
        wrapped as Arc<dyn TradingBackend>
    });
    let proposal = h.proposal(155.0);
    let primary_price = proposal.plan.primary_price.unwrap();
    h.engine.propose(proposal).await.unwrap();

    h.tick(primary_price).await;
    h.tick(144.0).await;

    let pos = h.position().await;
    assert_eq!(pos.state, PositionState::ClosedTp);
    assert!(pos.inconsistent);
    assert!(h.engine.is_busy(&sol()));

    // Secondary and stop loss, three attempts each
    let failing = backend.lock().unwrap().clone().unwrap();
    assert_eq!(failing.cancels.load(Ordering::SeqCst), 6);

    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, LifecycleEvent::InconsistentState { .. })));
    let blocked = h.engine.propose(h.proposal(155.0)).await;
    assert!(matches!(blocked, Err(AdmissionError::Inconsistent)));

    let report = h.engine.scan_cycle().await.unwrap();
    assert_eq!(report.skipped.get("position_open"), Some(&1));
}

// =============================================================================
// Persistence and the run loop
// =============================================================================

#[tokio::test]
async fn test_closed_trade_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(create_state_manager(dir.path(), false).unwrap());

    let (tx, rx) = fill_channel();
    let config = config();
    let paper = Arc::new(PaperBackend::new(&config.trading, tx));
    let market = Arc::new(ScriptedMarket::with(sol(), swing_window(), 155.0));
    let engine = Engine::new(config.clone(), paper.clone(), market, rx, EventBus::channel().0)
        .with_store(store.clone());

    let proposal = FibShortStrategy::from_config(&config)
        .evaluate(&sol(), &swing_window(), 155.0, None)
        .unwrap();
    let primary_price = proposal.plan.primary_price.unwrap();
    engine.propose(proposal).await.unwrap();
    for price in [primary_price, 144.0] {
        engine.on_price(&sol(), price).await;
        engine.settle().await;
    }
    engine.save_checkpoint().await;

    let trades = store.load_trades(Some("SOLUSDT")).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].case, Case::Case1);
    assert_eq!(trades[0].exit_reason, ExitReason::TakeProfit);
    assert_relative_eq!(trades[0].exit_price, 144.0, epsilon = 1e-9);

    let positions = store.load_positions(false).unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].state, PositionState::ClosedTp);
    assert!(store.load_positions(true).unwrap().is_empty());

    let checkpoint = store.load_checkpoint().unwrap().unwrap();
    assert!(checkpoint.paper_mode);
    assert_eq!(checkpoint.open_positions, 0);
    assert_relative_eq!(
        checkpoint.balance,
        paper.wallet_balance().to_f64(),
        epsilon = 1e-9
    );
    assert!(checkpoint.balance > config.trading.initial_balance);
}

#[tokio::test]
async fn test_restart_resumes_open_position() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(create_state_manager(dir.path(), false).unwrap());
    let config = config();
    let strategy = FibShortStrategy::from_config(&config);
    let proposal = || strategy.evaluate(&sol(), &swing_window(), 155.0, None).unwrap();

    let session = |store: Arc<fib_short::state_manager::SqliteStateManager>| {
        let (tx, rx) = fill_channel();
        let paper = Arc::new(PaperBackend::new(&config.trading, tx));
        let market = Arc::new(ScriptedMarket::with(sol(), swing_window(), 155.0));
        Engine::new(config.clone(), paper, market, rx, EventBus::channel().0).with_store(store)
    };

    let first = session(store.clone());
    let primary_price = proposal().plan.primary_price.unwrap();
    first.propose(proposal()).await.unwrap();
    first.on_price(&sol(), primary_price).await;
    first.settle().await;
    let before = first.position(&sol()).await.unwrap();
    assert_eq!(before.state, PositionState::OpenSingle);
    drop(first);

    let leftovers = store.load_positions(true).unwrap();
    assert_eq!(leftovers.len(), 1);

    let second = session(store.clone());
    assert_eq!(second.restore(leftovers).await, 1);
    assert!(second.is_busy(&sol()));
    assert_eq!(second.active_symbols(), vec![sol()]);

    let refused = second.propose(proposal()).await;
    assert!(matches!(
        refused,
        Err(AdmissionError::PositionOpen(PositionState::OpenSingle))
    ));
    let report = second.scan_cycle().await.unwrap();
    assert_eq!(report.admitted, 0);
    assert_eq!(report.skipped.get("position_open"), Some(&1));

    let resumed = second.position(&sol()).await.unwrap();
    assert_eq!(resumed.take_profit_order_id, before.take_profit_order_id);
    assert_relative_eq!(resumed.average_entry_price, before.average_entry_price);
}

#[tokio::test]
async fn test_run_scans_until_shutdown() {
    let h = Harness::new(config(), 155.0);
    let engine = h.engine.clone();

    let watcher = engine.clone();
    engine
        .run(async move {
            while watcher.cycles() == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

    assert!(h.engine.cycles() >= 1);
    assert_eq!(h.engine.active_symbols(), vec![sol()]);
    assert_eq!(h.position().await.state, PositionState::EntryPending);
}
