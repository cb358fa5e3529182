//! Scan and monitor coordinator
//!
//! The scan loop evaluates the universe and *proposes* entries; it never
//! touches a position. The monitor loop feeds prices to the backend and the
//! symbol workers and drains fill notifications into them. Both loops run as
//! separate tasks so a slow scan cannot delay position monitoring.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::{FillReceiver, TradingBackend};
use crate::config::{Config, ScannerConfig};
use crate::error::{AdmissionError, CapacityError, DataError, SkipReason};
use crate::market::MarketData;
use crate::notify::EventBus;
use crate::oms::{spawn_worker, BookSnapshot, Position, SymbolEvent, SymbolHandle, WorkerContext};
use crate::state_manager::{Checkpoint, StateStore};
use crate::strategy::{EntryProposal, FibShortStrategy};
use crate::Symbol;

/// Upper bound on pump/barrier rounds in [`Engine::settle`]
const MAX_SETTLE_ROUNDS: usize = 64;

/// Summary of one scan cycle
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub scanned: usize,
    pub proposals: usize,
    pub admitted: usize,
    pub rejected: usize,
    /// Skip counts keyed by [`SkipReason::label`]
    pub skipped: BTreeMap<&'static str, usize>,
}

impl ScanReport {
    fn skip(&mut self, label: &'static str) {
        *self.skipped.entry(label).or_default() += 1;
    }
}

/// Symbols to scan this cycle: configured pairs, or the most liquid
/// perpetuals when none are configured. Excluded pairs are removed.
pub async fn select_universe(market: &dyn MarketData, config: &Config) -> Result<Vec<Symbol>> {
    let pairs = if config.trading.pairs.is_empty() {
        market
            .top_pairs(config.scanner.top_pairs_limit)
            .await
            .context("Failed to select top pairs")?
    } else {
        config.trading.pairs()
    };
    Ok(pairs
        .into_iter()
        .filter(|s| !config.scanner.is_excluded(s))
        .collect())
}

/// Fetch data for one symbol and run the strategy on it
pub async fn evaluate_symbol(
    market: &dyn MarketData,
    strategy: &FibShortStrategy,
    scanner: &ScannerConfig,
    symbol: &Symbol,
) -> Result<EntryProposal, SkipReason> {
    let unavailable = |e: anyhow::Error| SkipReason::Data(DataError::Unavailable(format!("{:#}", e)));

    let rsi = if strategy.rsi_enabled() {
        // Enough history for Wilder smoothing to settle
        let limit = scanner.rsi_period * 4 + 1;
        let bars = market
            .bars(symbol, scanner.rsi_timeframe, limit)
            .await
            .map_err(unavailable)?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        strategy.check_rsi(&closes)?
    } else {
        None
    };

    let bars = market
        .bars(symbol, scanner.timeframe, scanner.candle_limit as usize)
        .await
        .map_err(unavailable)?;
    let price = market.current_price(symbol).await.map_err(unavailable)?;
    strategy.evaluate(symbol, &bars, price, rsi)
}

pub struct Engine {
    config: Config,
    strategy: Arc<FibShortStrategy>,
    backend: Arc<dyn TradingBackend>,
    market: Arc<dyn MarketData>,
    ctx: WorkerContext,
    workers: Mutex<HashMap<Symbol, SymbolHandle>>,
    fills: tokio::sync::Mutex<FillReceiver>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cycles: AtomicU64,
}

impl Engine {
    pub fn new(
        config: Config,
        backend: Arc<dyn TradingBackend>,
        market: Arc<dyn MarketData>,
        fills: FillReceiver,
        bus: EventBus,
    ) -> Self {
        let ctx = WorkerContext {
            backend: backend.clone(),
            bus,
            store: None,
            retry: config.execution.retry_policy(),
        };
        Self {
            strategy: Arc::new(FibShortStrategy::from_config(&config)),
            config,
            backend,
            market,
            ctx,
            workers: Mutex::new(HashMap::new()),
            fills: tokio::sync::Mutex::new(fills),
            tasks: Mutex::new(Vec::new()),
            cycles: AtomicU64::new(0),
        }
    }

    /// Persist trades, position snapshots and checkpoints
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.ctx.store = Some(store);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<Symbol, SymbolHandle>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Handle of the symbol's worker, spawning it on first use
    fn handle(&self, symbol: &Symbol) -> SymbolHandle {
        let mut workers = self.registry();
        if let Some(handle) = workers.get(symbol).filter(|h| !h.is_closed()) {
            return handle.clone();
        }
        let (handle, task) = spawn_worker(
            symbol.clone(),
            self.ctx.clone(),
            self.config.execution.worker_queue,
        );
        workers.insert(symbol.clone(), handle.clone());
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).push(task);
        handle
    }

    fn existing(&self, symbol: &Symbol) -> Option<SymbolHandle> {
        self.registry().get(symbol).cloned()
    }

    fn handles(&self) -> Vec<SymbolHandle> {
        self.registry().values().cloned().collect()
    }

    /// Symbols with a non-terminal position
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .registry()
            .values()
            .filter(|h| h.is_active())
            .map(|h| h.symbol().clone())
            .collect();
        symbols.sort();
        symbols
    }

    /// Symbol has a live position or is blocked after an inconsistency
    pub fn is_busy(&self, symbol: &Symbol) -> bool {
        self.existing(symbol)
            .is_some_and(|h| h.is_active() || h.is_inconsistent())
    }

    /// Hand positions an earlier session left open back to their workers.
    /// Those symbols stay busy until the positions finish.
    pub async fn restore(&self, positions: Vec<Position>) -> usize {
        let mut restored = 0;
        for position in positions.into_iter().filter(|p| !p.state.is_terminal()) {
            let symbol = position.symbol.clone();
            info!(
                "[{}] resuming {} position ({})",
                symbol, position.case, position.state
            );
            if self
                .handle(&symbol)
                .send(SymbolEvent::Restore(Box::new(position)))
                .await
            {
                restored += 1;
            } else {
                warn!("[{}] worker gone, position not resumed", symbol);
            }
        }
        // Barrier: every worker has taken its position over
        self.snapshots().await;
        restored
    }

    /// Submit a proposal to the symbol's worker after the capacity check
    pub async fn propose(&self, proposal: EntryProposal) -> Result<(), AdmissionError> {
        let handle = self.handle(&proposal.symbol);
        // The worker gives the precise rejection for busy symbols
        if !handle.is_active() && !handle.is_inconsistent() {
            let available = self.backend.available_margin().await?;
            let required = proposal.required_margin();
            if available < required.max(self.config.trading.min_available_margin) {
                return Err(CapacityError {
                    available,
                    required,
                }
                .into());
            }
        }
        handle.propose(proposal).await
    }

    /// Route a price tick: backend matching first, then fills, then the worker
    pub async fn on_price(&self, symbol: &Symbol, price: f64) {
        let at = Utc::now();
        if let Err(e) = self.backend.on_price(symbol, price, at).await {
            warn!("[{}] backend rejected price update: {}", symbol, e);
        }
        self.pump_fills().await;
        if let Some(handle) = self.existing(symbol) {
            if !handle.send(SymbolEvent::Price { price, at }).await {
                warn!("[{}] worker gone, price dropped", symbol);
            }
        }
    }

    /// Move queued fill notifications into their symbol workers
    pub async fn pump_fills(&self) -> usize {
        let mut fills = self.fills.lock().await;
        let mut routed = 0;
        while let Ok(fill) = fills.try_recv() {
            let Some(handle) = self.existing(&fill.symbol) else {
                warn!(
                    "[{}] fill for order {} with no worker, ignored",
                    fill.symbol, fill.order_id
                );
                continue;
            };
            let symbol = fill.symbol.clone();
            if !handle.send(SymbolEvent::Fill(fill)).await {
                warn!("[{}] worker gone, fill dropped", symbol);
                continue;
            }
            routed += 1;
        }
        routed
    }

    /// Snapshot of every worker; returns once each has drained its queue
    pub async fn snapshots(&self) -> Vec<BookSnapshot> {
        let mut snapshots = Vec::new();
        for handle in self.handles() {
            if let Some(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        snapshots
    }

    /// Drain fills until no worker produces new ones
    pub async fn settle(&self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            self.snapshots().await;
            if self.pump_fills().await == 0 {
                return;
            }
        }
        warn!("Fills still arriving after {} rounds", MAX_SETTLE_ROUNDS);
    }

    /// Current position of every symbol that ever had one
    pub async fn positions(&self) -> Vec<Position> {
        self.snapshots()
            .await
            .into_iter()
            .filter_map(|s| s.position)
            .collect()
    }

    pub async fn position(&self, symbol: &Symbol) -> Option<Position> {
        self.existing(symbol)?.snapshot().await?.position
    }

    /// Evaluate the universe and propose every setup found
    pub async fn scan_cycle(&self) -> Result<ScanReport> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let universe = select_universe(self.market.as_ref(), &self.config).await?;
        let mut report = ScanReport::default();

        let mut candidates = Vec::with_capacity(universe.len());
        for symbol in universe {
            if self.is_busy(&symbol) {
                report.skip(SkipReason::PositionOpen.label());
            } else {
                candidates.push(symbol);
            }
        }
        report.scanned = candidates.len();
        debug!("Cycle {}: evaluating {} symbols", cycle, candidates.len());

        let limit = Arc::new(Semaphore::new(
            self.config.scanner.max_concurrent_evaluations.max(1),
        ));
        let mut tasks = JoinSet::new();
        for symbol in candidates {
            let market = self.market.clone();
            let strategy = self.strategy.clone();
            let scanner = self.config.scanner.clone();
            let permit = limit.clone().acquire_owned().await?;
            tasks.spawn(async move {
                let _permit = permit;
                let result = evaluate_symbol(market.as_ref(), &strategy, &scanner, &symbol).await;
                (symbol, result)
            });
        }

        let mut proposals = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(proposal))) => proposals.push(proposal),
                Ok((symbol, Err(reason))) => {
                    debug!("[{}] skipped: {}", symbol, reason);
                    report.skip(reason.label());
                }
                Err(e) => error!("Evaluation task failed: {}", e),
            }
        }
        proposals.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        report.proposals = proposals.len();

        for proposal in proposals {
            let symbol = proposal.symbol.clone();
            let case = proposal.case;
            info!(
                "[{}] {} setup at ratio {:.3} (price {:.6})",
                symbol, case, proposal.ratio, proposal.reference_price
            );
            match self.propose(proposal).await {
                Ok(()) => report.admitted += 1,
                Err(e) => {
                    warn!("[{}] {} proposal rejected: {}", symbol, case, e);
                    report.rejected += 1;
                }
            }
        }
        self.settle().await;

        info!(
            "Cycle {}: scanned {}, proposals {}, admitted {}, rejected {}",
            cycle, report.scanned, report.proposals, report.admitted, report.rejected
        );
        Ok(report)
    }

    /// Poll venue state and prices of symbols with live positions
    pub async fn monitor_tick(&self) {
        match self.backend.sync().await {
            Ok(()) => {
                self.pump_fills().await;
                // Queued behind the fills this sync produced
                for handle in self.handles() {
                    handle.send(SymbolEvent::Synced).await;
                }
            }
            Err(e) => {
                warn!("Backend sync failed: {}", e);
                self.pump_fills().await;
            }
        }

        for symbol in self.active_symbols() {
            match self.market.current_price(&symbol).await {
                Ok(price) => self.on_price(&symbol, price).await,
                Err(e) => warn!("[{}] price unavailable: {:#}", symbol, e),
            }
        }
        self.settle().await;
    }

    /// Persist an account checkpoint, if a store is configured
    pub async fn save_checkpoint(&self) {
        let Some(store) = &self.ctx.store else {
            return;
        };
        let (balance, available) = match (
            self.backend.balance().await,
            self.backend.available_margin().await,
        ) {
            (Ok(balance), Ok(available)) => (balance, available),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Checkpoint skipped, balance unavailable: {}", e);
                return;
            }
        };
        let checkpoint = Checkpoint {
            timestamp: Utc::now(),
            cycle_count: self.cycles(),
            balance,
            available_margin: available,
            open_positions: self.active_symbols().len(),
            paper_mode: !self.config.is_live(),
        };
        if let Err(e) = store.save_checkpoint(&checkpoint) {
            error!("Failed to save checkpoint: {:#}", e);
        }
    }

    /// Run both loops until `shutdown` resolves
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            "Engine started on {} backend: scan every {:?}, monitor every {:?}",
            self.backend.name(),
            self.config.scanner.scan_interval(),
            self.config.scanner.monitor_interval()
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let scanner = tokio::spawn(self.clone().scan_loop(stop_rx.clone()));
        let monitor = tokio::spawn(self.clone().monitor_loop(stop_rx));

        shutdown.await;
        info!("Shutdown requested, stopping loops");
        let _ = stop_tx.send(true);
        for (name, task) in [("scan", scanner), ("monitor", monitor)] {
            if let Err(e) = task.await {
                error!("{} loop ended abnormally: {}", name, e);
            }
        }

        self.settle().await;
        self.save_checkpoint().await;
        let open = self.active_symbols();
        if !open.is_empty() {
            warn!("Stopped with {} positions still open: {:?}", open.len(), open);
        }
        Ok(())
    }

    async fn scan_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let scanner = &self.config.scanner;
        let start = Instant::now() + std::time::Duration::from_secs(scanner.first_scan_delay_secs);
        let mut ticker = interval_at(start, scanner.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            if let Err(e) = self.scan_cycle().await {
                error!("Scan cycle failed: {:#}", e);
            }
            self.save_checkpoint().await;
        }
        debug!("Scan loop stopped");
    }

    async fn monitor_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.scanner.monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            self.monitor_tick().await;
        }
        debug!("Monitor loop stopped");
    }
}
