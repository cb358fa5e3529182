//! Simulated futures account
//!
//! Orders rest in memory and are matched against the prices fed through
//! [`TradingBackend::on_price`]. Entry orders reserve isolated margin
//! (`notional / leverage`) while working and hold it while the position is
//! open. Realized PnL and commission settle into the wallet balance.
//!
//! Matching rules:
//! - market: fills on placement at the reference price, adjusted by slippage
//! - sell limit: fills once price ≥ limit
//! - buy limit (take profit): fills once price ≤ limit
//! - buy stop (stop loss): fills once price ≥ trigger and closes the position
//!
//! A limit that is already marketable on placement fills at the last price.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{FillSender, TradingBackend};
use crate::config::TradingConfig;
use crate::error::BackendError;
use crate::oms::{
    CancelOutcome, FillEvent, OrderId, OrderKind, OrderRequest, OrderStatus, PlacedOrder,
};
use crate::{Money, Side, Symbol};

#[derive(Debug, Clone)]
struct PaperOrder {
    id: OrderId,
    request: OrderRequest,
    status: OrderStatus,
    /// Margin held while an entry order is working
    reserved: Money,
}

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    /// Short size, always ≥ 0
    quantity: f64,
    average_price: f64,
    margin: Money,
}

#[derive(Debug, Default)]
struct Ledger {
    balance: Money,
    orders: HashMap<OrderId, PaperOrder>,
    positions: HashMap<Symbol, PaperPosition>,
    last_price: HashMap<Symbol, f64>,
}

impl Ledger {
    fn committed(&self) -> Money {
        let reserved: Money = self
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .map(|o| o.reserved)
            .sum();
        let held: Money = self.positions.values().map(|p| p.margin).sum();
        reserved + held
    }

    fn available(&self) -> Money {
        (self.balance - self.committed()).max(Money::ZERO)
    }
}

pub struct PaperBackend {
    ledger: Mutex<Ledger>,
    fills: FillSender,
    leverage: f64,
    commission_rate: f64,
    slippage: f64,
    next_id: AtomicU64,
}

impl PaperBackend {
    pub fn new(config: &TradingConfig, fills: FillSender) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                balance: Money::from_f64(config.initial_balance),
                ..Ledger::default()
            }),
            fills,
            leverage: config.leverage.max(1.0),
            commission_rate: config.commission,
            slippage: config.slippage,
            next_id: AtomicU64::new(1),
        }
    }

    /// Resume from a persisted wallet balance
    pub fn with_balance(self, balance: f64) -> Self {
        self.lock().balance = Money::from_f64(balance);
        self
    }

    /// Wallet balance: initial funds plus realized PnL minus commission
    pub fn wallet_balance(&self) -> Money {
        self.lock().balance
    }

    /// Open short size for `symbol`
    pub fn position_quantity(&self, symbol: &Symbol) -> f64 {
        self.lock()
            .positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(0.0)
    }

    pub fn order_status(&self, id: &OrderId) -> Option<OrderStatus> {
        self.lock().orders.get(id).map(|o| o.status)
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_order_id(&self) -> OrderId {
        OrderId::new(format!("PAPER-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn margin_for(&self, price: f64, quantity: f64) -> Money {
        Money::from_f64(price * quantity / self.leverage).round_dp(8)
    }

    fn with_slippage(&self, side: Side, price: f64) -> f64 {
        match side {
            Side::Sell => price * (1.0 - self.slippage),
            Side::Buy => price * (1.0 + self.slippage),
        }
    }

    /// Price at which a working order executes given the last price, if any
    fn trigger_price(request: &OrderRequest, last: f64) -> Option<f64> {
        let level = request.price?;
        let crossed = match (request.kind, request.side) {
            (OrderKind::Limit, Side::Sell) => last >= level,
            (OrderKind::Limit, Side::Buy) => last <= level,
            (OrderKind::Stop, Side::Buy) => last >= level,
            (OrderKind::Stop, Side::Sell) => last <= level,
            (OrderKind::Market, _) => true,
        };
        crossed.then_some(last)
    }

    /// Execute `id` at `price`, update the ledger and emit the fill
    fn execute(&self, ledger: &mut Ledger, id: &OrderId, price: f64, at: DateTime<Utc>) {
        let Some(order) = ledger.orders.get_mut(id) else {
            return;
        };
        let request = order.request.clone();
        order.status = OrderStatus::Filled;
        order.reserved = Money::ZERO;

        let position = ledger.positions.entry(request.symbol.clone()).or_default();
        let quantity = match request.side {
            Side::Sell => {
                let total = position.quantity + request.quantity;
                position.average_price =
                    (position.average_price * position.quantity + price * request.quantity) / total;
                position.quantity = total;
                position.margin += self.margin_for(price, request.quantity);
                request.quantity
            }
            Side::Buy => {
                let quantity = if request.close_position {
                    position.quantity
                } else {
                    request.quantity.min(position.quantity)
                };
                if quantity <= 0.0 {
                    // Reduce-only with nothing left to reduce
                    order.status = OrderStatus::Cancelled;
                    debug!("[paper] {} expired, no position to reduce", id);
                    return;
                }
                let pnl = Money::from_f64((position.average_price - price) * quantity);
                let released = position.margin * Money::from_f64(quantity / position.quantity);
                position.margin -= released;
                position.quantity -= quantity;
                ledger.balance += pnl;
                quantity
            }
        };

        let commission = price * quantity * self.commission_rate;
        ledger.balance -= Money::from_f64(commission);

        if ledger
            .positions
            .get(&request.symbol)
            .is_some_and(|p| p.quantity <= f64::EPSILON)
        {
            ledger.positions.remove(&request.symbol);
        }

        info!(
            "[paper] {} {} {} {:.6} @ {:.6} (fee {:.6})",
            request.symbol,
            request.role,
            request.side.as_str(),
            quantity,
            price,
            commission
        );

        let fill = FillEvent {
            symbol: request.symbol,
            order_id: id.clone(),
            price,
            quantity,
            commission,
            timestamp: at,
        };
        if self.fills.send(fill).is_err() {
            warn!("[paper] fill receiver dropped, fill for {} lost", id);
        }
    }
}

#[async_trait]
impl TradingBackend for PaperBackend {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, BackendError> {
        if !(request.quantity > 0.0) || request.price.is_some_and(|p| !(p > 0.0)) {
            return Err(BackendError::Rejected(format!(
                "invalid order: qty {} price {:?}",
                request.quantity, request.price
            )));
        }

        let mut ledger = self.lock();
        let has_position = ledger
            .positions
            .get(&request.symbol)
            .is_some_and(|p| p.quantity > 0.0);
        if request.reduce_only && !has_position {
            return Err(BackendError::Rejected(format!(
                "reduce-only {} without open position on {}",
                request.role, request.symbol
            )));
        }

        let reserved = if request.side == Side::Sell && !request.reduce_only {
            let price = request.price.unwrap_or(request.reference_price);
            let required = self.margin_for(price, request.quantity);
            let available = ledger.available();
            if required > available {
                return Err(BackendError::InsufficientMargin {
                    available: available.to_f64(),
                    required: required.to_f64(),
                });
            }
            required
        } else {
            Money::ZERO
        };

        let id = self.next_order_id();
        ledger.orders.insert(
            id.clone(),
            PaperOrder {
                id: id.clone(),
                request: request.clone(),
                status: OrderStatus::Pending,
                reserved,
            },
        );
        debug!(
            "[paper] placed {} {} {:?} {:.6} @ {:?}",
            id, request.role, request.kind, request.quantity, request.price
        );

        let now = Utc::now();
        if request.kind == OrderKind::Market {
            let reference = ledger
                .last_price
                .get(&request.symbol)
                .copied()
                .unwrap_or(request.reference_price);
            let price = self.with_slippage(request.side, reference);
            self.execute(&mut ledger, &id, price, now);
        } else if let Some(last) = ledger.last_price.get(&request.symbol).copied() {
            if let Some(price) = Self::trigger_price(request, last) {
                self.execute(&mut ledger, &id, price, now);
            }
        }

        Ok(PlacedOrder {
            id,
            status: OrderStatus::Pending,
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &Symbol,
        order_id: &OrderId,
    ) -> Result<CancelOutcome, BackendError> {
        let mut ledger = self.lock();
        let Some(order) = ledger.orders.get_mut(order_id) else {
            return Ok(CancelOutcome::NotFound);
        };
        if order.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        order.status = OrderStatus::Cancelled;
        order.reserved = Money::ZERO;
        debug!("[paper] cancelled {}", order_id);
        Ok(CancelOutcome::Cancelled)
    }

    async fn available_margin(&self) -> Result<f64, BackendError> {
        Ok(self.lock().available().to_f64())
    }

    async fn balance(&self) -> Result<f64, BackendError> {
        Ok(self.wallet_balance().to_f64())
    }

    async fn on_price(
        &self,
        symbol: &Symbol,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut ledger = self.lock();
        ledger.last_price.insert(symbol.clone(), price);

        let mut triggered: Vec<(OrderId, f64)> = ledger
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && &o.request.symbol == symbol)
            .filter_map(|o| Self::trigger_price(&o.request, price).map(|p| (o.id.clone(), p)))
            .collect();
        // Ids are sequential, so this is placement order
        triggered.sort_by_key(|(id, _)| {
            id.as_str()
                .trim_start_matches("PAPER-")
                .parse::<u64>()
                .unwrap_or(u64::MAX)
        });

        for (id, fill_price) in triggered {
            // An earlier fill in this batch may have expired a reduce-only order
            if ledger.orders.get(&id).is_some_and(|o| o.status == OrderStatus::Pending) {
                self.execute(&mut ledger, &id, fill_price, at);
            }
        }
        Ok(())
    }
}
