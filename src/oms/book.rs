//! Per-symbol order/position state machine
//!
//! `SymbolBook` never talks to a backend. Every input (proposal, placement
//! acknowledgement, fill, price, cancel result) returns an [`Outcome`] listing
//! the order commands to execute next, the lifecycle events to publish and,
//! on closure, the trade record to persist. The symbol worker executes the
//! commands and feeds the results back in, so all state lives in one place
//! and is only ever touched by one task.
//!
//! Positions move `EntryPending → OpenSingle → OpenAveraged → ClosedTp |
//! ClosedSl | Cancelled`. Entry fills are symmetric: whichever entry fills
//! first opens the position, the other one averages it.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::position::{Entry, ExitReason, Position, PositionState, TradeRecord};
use super::types::{
    CancelOutcome, FillEvent, Order, OrderId, OrderRequest, OrderRole, OrderStatus, PlacedOrder,
};
use crate::error::{AdmissionError, BackendError};
use crate::notify::LifecycleEvent;
use crate::strategy::EntryProposal;
use crate::Symbol;

/// Order command produced by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Place(OrderRequest),
    Cancel { order_id: OrderId, role: OrderRole },
}

/// Everything a state transition asks the outside world to do
#[derive(Debug, Default)]
pub struct Outcome {
    pub commands: Vec<Command>,
    pub events: Vec<LifecycleEvent>,
    pub closed: Option<TradeRecord>,
    /// Position changed and its snapshot should be persisted
    pub changed: bool,
}

impl Outcome {
    fn changed() -> Self {
        Self {
            changed: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.events.is_empty() && self.closed.is_none()
    }
}

#[derive(Debug, Clone)]
struct TrackedOrder {
    /// Sequence number of the position the order belongs to
    seq: u64,
    order: Order,
}

/// Protective placement refused by the venue while the position looked open.
/// Usually an exit already flattened it and that fill is still in flight.
#[derive(Debug, Clone)]
struct HeldRejection {
    detail: String,
    /// Sync boundaries passed since the rejection
    syncs: u32,
}

/// Sync boundaries a held rejection survives before it is escalated
const REJECTION_GRACE_SYNCS: u32 = 2;

#[derive(Debug)]
pub struct SymbolBook {
    symbol: Symbol,
    position: Option<Position>,
    seq: u64,
    /// Secondary entry waiting for the primary acknowledgement
    pending_secondary: Option<(f64, f64)>,
    orders: HashMap<OrderId, TrackedOrder>,
    seen_fills: HashSet<(OrderId, i64)>,
    inconsistent: bool,
    held_rejection: Option<HeldRejection>,
    last_price: Option<f64>,
}

impl SymbolBook {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            position: None,
            seq: 0,
            pending_secondary: None,
            orders: HashMap::new(),
            seen_fills: HashSet::new(),
            inconsistent: false,
            held_rejection: None,
            last_price: None,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn order(&self, id: &OrderId) -> Option<&Order> {
        self.orders.get(id).map(|t| &t.order)
    }

    /// A non-terminal position exists
    pub fn is_active(&self) -> bool {
        self.position
            .as_ref()
            .is_some_and(|p| !p.state.is_terminal())
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    /// Admit a proposal as a new position and emit the primary entry
    pub fn admit(
        &mut self,
        proposal: &EntryProposal,
        at: DateTime<Utc>,
    ) -> Result<Outcome, AdmissionError> {
        if self.inconsistent {
            return Err(AdmissionError::Inconsistent);
        }
        if let Some(pos) = self.position.as_ref().filter(|p| !p.state.is_terminal()) {
            return Err(AdmissionError::PositionOpen(pos.state));
        }

        self.prune_finished();
        self.seq += 1;
        self.position = Some(Position::from_proposal(proposal, at));
        self.pending_secondary = proposal
            .plan
            .secondary_price
            .zip(proposal.secondary_quantity);

        let primary = match proposal.plan.primary_price {
            Some(price) => OrderRequest::sell_limit(
                &self.symbol,
                OrderRole::Primary,
                price,
                proposal.primary_quantity,
            ),
            None => OrderRequest::sell_market(
                &self.symbol,
                OrderRole::Primary,
                proposal.reference_price,
                proposal.primary_quantity,
            ),
        };

        info!(
            "[{}] {} admitted at r={:.3}: swing {:.6} -> {:.6}",
            self.symbol,
            proposal.case,
            proposal.ratio,
            proposal.swing.high.price,
            proposal.swing.low.price
        );

        let mut out = Outcome::changed();
        out.commands.push(Command::Place(primary));
        Ok(out)
    }

    /// Take over a position an earlier session left open. Its working
    /// orders are tracked again; returns their ids so the backend can watch
    /// them for fills.
    pub fn restore(&mut self, position: Position, at: DateTime<Utc>) -> Vec<OrderId> {
        self.prune_finished();
        self.seq += 1;
        self.pending_secondary = None;
        if position.inconsistent {
            self.inconsistent = true;
        }

        let working = {
            let mut working = Vec::new();
            let filled: HashSet<&OrderId> = position.entries.iter().map(|e| &e.order_id).collect();
            let plan = &position.plan;
            let candidates = [
                (&position.primary_order_id, OrderRole::Primary, plan.primary_price),
                (&position.secondary_order_id, OrderRole::Secondary, plan.secondary_price),
                (&position.take_profit_order_id, OrderRole::TakeProfit, Some(position.take_profit_price)),
                (&position.stop_loss_order_id, OrderRole::StopLoss, Some(plan.stop_loss)),
            ];

            for (id, role, price) in candidates {
                let Some(id) = id.as_ref().filter(|id| !filled.contains(id)) else {
                    continue;
                };
                // Entry sizes are not persisted; fills carry their own quantity
                let quantity = if role.is_exit() { position.total_quantity } else { 0.0 };
                let request = match (role, price) {
                    (OrderRole::TakeProfit, Some(p)) => OrderRequest::take_profit(&self.symbol, p, quantity),
                    (OrderRole::StopLoss, Some(p)) => OrderRequest::stop_loss(&self.symbol, p, quantity),
                    (_, Some(p)) => OrderRequest::sell_limit(&self.symbol, role, p, quantity),
                    (_, None) => OrderRequest::sell_market(
                        &self.symbol,
                        role,
                        position.average_entry_price,
                        quantity,
                    ),
                };
                self.orders.insert(
                    id.clone(),
                    TrackedOrder {
                        seq: self.seq,
                        order: Order::from_request(id.clone(), &request, at),
                    },
                );
                working.push(id.clone());
            }
            working
        };

        info!(
            "[{}] resumed {} position in {} with {} working orders",
            self.symbol,
            position.case,
            position.state,
            working.len()
        );
        self.position = Some(position);
        working
    }

    /// Backend acknowledged a placement
    pub fn on_placed(
        &mut self,
        request: &OrderRequest,
        placed: PlacedOrder,
        at: DateTime<Utc>,
    ) -> Outcome {
        if placed.status == OrderStatus::Rejected {
            return self.on_place_failed(
                request,
                &BackendError::Rejected(format!("order {} rejected on placement", placed.id)),
            );
        }

        let id = placed.id;
        self.orders.insert(
            id.clone(),
            TrackedOrder {
                seq: self.seq,
                order: Order::from_request(id.clone(), request, at),
            },
        );

        let mut out = Outcome::changed();
        if request.role == OrderRole::Flatten {
            return out;
        }

        let Some(pos) = self.position.as_mut().filter(|p| !p.state.is_terminal()) else {
            // Position ended while the placement was in flight
            warn!(
                "[{}] {} order {} acknowledged after position ended, cancelling",
                self.symbol, request.role, id
            );
            out.commands.push(Command::Cancel {
                order_id: id,
                role: request.role,
            });
            return out;
        };

        match request.role {
            OrderRole::Primary => {
                pos.primary_order_id = Some(id.clone());
                out.events.push(LifecycleEvent::EntryPlaced {
                    symbol: self.symbol.clone(),
                    case: pos.case,
                    role: OrderRole::Primary,
                    price: request.price,
                    quantity: request.quantity,
                });
                if let Some((price, quantity)) = self.pending_secondary.take() {
                    let secondary =
                        OrderRequest::sell_limit(&self.symbol, OrderRole::Secondary, price, quantity)
                            .linked_to(&id);
                    out.commands.push(Command::Place(secondary));
                }
            }
            OrderRole::Secondary => {
                pos.secondary_order_id = Some(id);
                out.events.push(LifecycleEvent::EntryPlaced {
                    symbol: self.symbol.clone(),
                    case: pos.case,
                    role: OrderRole::Secondary,
                    price: request.price,
                    quantity: request.quantity,
                });
            }
            OrderRole::TakeProfit => pos.take_profit_order_id = Some(id),
            OrderRole::StopLoss => pos.stop_loss_order_id = Some(id),
            OrderRole::Flatten => {}
        }
        out
    }

    /// Placement failed for good (entries are not retried)
    pub fn on_place_failed(&mut self, request: &OrderRequest, error: &BackendError) -> Outcome {
        let mut out = Outcome::changed();
        match request.role {
            OrderRole::Primary => {
                let Some(pos) = self.position.take() else {
                    return Outcome::default();
                };
                self.pending_secondary = None;
                warn!("[{}] primary entry failed, discarding position: {}", self.symbol, error);
                out.events.push(LifecycleEvent::EntryFailed {
                    symbol: self.symbol.clone(),
                    case: pos.case,
                    reason: error.to_string(),
                });
            }
            OrderRole::Secondary => {
                if let Some(pos) = self.position.as_mut() {
                    pos.secondary_failed = true;
                }
                warn!(
                    "[{}] secondary entry failed, continuing without averaging: {}",
                    self.symbol, error
                );
                out.events.push(LifecycleEvent::SecondaryFailed {
                    symbol: self.symbol.clone(),
                    reason: error.to_string(),
                });
            }
            OrderRole::TakeProfit | OrderRole::StopLoss
                if matches!(error, BackendError::Rejected(_))
                    && self.position.as_ref().is_some_and(|p| p.state.is_open()) =>
            {
                let detail = format!("{} placement failed: {}", request.role, error);
                warn!(
                    "[{}] {}; waiting for an exit fill before flagging",
                    self.symbol, detail
                );
                if self.held_rejection.is_none() {
                    self.held_rejection = Some(HeldRejection {
                        detail,
                        syncs: 0,
                    });
                }
            }
            OrderRole::TakeProfit | OrderRole::StopLoss | OrderRole::Flatten => {
                out.events.push(self.flag_inconsistent(format!(
                    "{} placement failed: {}",
                    request.role, error
                )));
            }
        }
        out
    }

    /// Apply an execution report
    pub fn on_fill(&mut self, fill: &FillEvent) -> Outcome {
        if !self
            .seen_fills
            .insert((fill.order_id.clone(), fill.timestamp.timestamp_millis()))
        {
            debug!("[{}] duplicate fill for {} ignored", self.symbol, fill.order_id);
            return Outcome::default();
        }

        let Some(tracked) = self.orders.get_mut(&fill.order_id) else {
            warn!("[{}] fill for unknown order {} ignored", self.symbol, fill.order_id);
            return Outcome::default();
        };
        if tracked.order.status.is_terminal() {
            warn!(
                "[{}] fill for {:?} order {} ignored",
                self.symbol, tracked.order.status, fill.order_id
            );
            return Outcome::default();
        }

        tracked.order.status = OrderStatus::Filled;
        tracked.order.filled_quantity = fill.quantity;
        tracked.order.average_fill_price = fill.price;
        tracked.order.updated_at = fill.timestamp;
        let (role, seq) = (tracked.order.role, tracked.seq);

        let current = seq == self.seq && self.is_active();
        match role {
            OrderRole::Flatten => {
                info!(
                    "[{}] residual {:.6} flattened at {:.6}",
                    self.symbol, fill.quantity, fill.price
                );
                Outcome::default()
            }
            OrderRole::Primary | OrderRole::Secondary if current => self.on_entry_fill(fill, role),
            OrderRole::Primary | OrderRole::Secondary => self.flatten_orphan(fill),
            OrderRole::TakeProfit if current => self.on_exit_fill(fill, ExitReason::TakeProfit),
            OrderRole::StopLoss if current => self.on_exit_fill(fill, ExitReason::StopLoss),
            OrderRole::TakeProfit | OrderRole::StopLoss => {
                // Reduce-only, so nothing to undo once the position is gone
                warn!(
                    "[{}] {} fill {} for a finished position ignored",
                    self.symbol, role, fill.order_id
                );
                Outcome::default()
            }
        }
    }

    fn on_entry_fill(&mut self, fill: &FillEvent, role: OrderRole) -> Outcome {
        let symbol = self.symbol.clone();
        let Some(pos) = self.position.as_mut() else {
            return Outcome::default();
        };

        pos.add_entry(Entry {
            order_id: fill.order_id.clone(),
            role,
            price: fill.price,
            quantity: fill.quantity,
            commission: fill.commission,
            filled_at: fill.timestamp,
        });

        let mut out = Outcome::changed();
        match pos.state {
            PositionState::EntryPending => {
                pos.state = PositionState::OpenSingle;
                pos.take_profit_price = pos.plan.take_profit;
                out.commands.push(Command::Place(OrderRequest::take_profit(
                    &symbol,
                    pos.take_profit_price,
                    pos.total_quantity,
                )));
                out.commands.push(Command::Place(OrderRequest::stop_loss(
                    &symbol,
                    pos.plan.stop_loss,
                    pos.total_quantity,
                )));
                info!(
                    "[{}] {} opened: {} {:.6} @ {:.6}, TP {:.6}, SL {:.6}",
                    symbol,
                    pos.case,
                    role,
                    fill.quantity,
                    fill.price,
                    pos.take_profit_price,
                    pos.plan.stop_loss
                );
                out.events.push(LifecycleEvent::PositionOpened {
                    symbol,
                    case: pos.case,
                    entry_price: fill.price,
                    quantity: fill.quantity,
                    take_profit: pos.take_profit_price,
                    stop_loss: pos.plan.stop_loss,
                });
            }
            PositionState::OpenSingle => {
                pos.state = PositionState::OpenAveraged;
                pos.take_profit_price = pos.plan.dynamic_take_profit.unwrap_or(pos.plan.take_profit);
                if let Some(old) = pos.take_profit_order_id.take() {
                    out.commands.push(Command::Cancel {
                        order_id: old,
                        role: OrderRole::TakeProfit,
                    });
                }
                out.commands.push(Command::Place(OrderRequest::take_profit(
                    &symbol,
                    pos.take_profit_price,
                    pos.total_quantity,
                )));
                info!(
                    "[{}] averaged: avg {:.6} qty {:.6}, TP moved to {:.6}",
                    symbol, pos.average_entry_price, pos.total_quantity, pos.take_profit_price
                );
                out.events.push(LifecycleEvent::PositionAveraged {
                    symbol: symbol.clone(),
                    average_entry_price: pos.average_entry_price,
                    total_quantity: pos.total_quantity,
                });
                out.events.push(LifecycleEvent::DynamicTpActivated {
                    symbol,
                    take_profit: pos.take_profit_price,
                    quantity: pos.total_quantity,
                });
            }
            state => {
                warn!("[{}] unexpected entry fill in state {}", symbol, state);
            }
        }
        out
    }

    fn on_exit_fill(&mut self, fill: &FillEvent, reason: ExitReason) -> Outcome {
        let symbol = self.symbol.clone();
        let Some(pos) = self.position.as_mut() else {
            return Outcome::default();
        };
        if !pos.state.is_open() {
            warn!("[{}] {} fill while {}, ignored", symbol, reason.as_str(), pos.state);
            return Outcome::default();
        }

        pos.close(reason, fill.price, fill.quantity, fill.commission, fill.timestamp);
        if let Some(held) = self.held_rejection.take() {
            info!(
                "[{}] {} exit explains the earlier rejection ({})",
                symbol,
                reason.as_str(),
                held.detail
            );
        }
        let residual = pos.total_quantity - fill.quantity;
        let (case, net_pnl) = (pos.case, pos.net_pnl());
        let closed = pos.to_record();

        let mut out = Outcome::changed();
        out.commands = self.cancel_pending(Some(&fill.order_id));

        if reason == ExitReason::TakeProfit && residual > self.quantity_tolerance() {
            warn!("[{}] take profit left {:.6} open, flattening", symbol, residual);
            out.commands.push(Command::Place(OrderRequest::flatten(&symbol, fill.price, residual)));
            out.events.push(LifecycleEvent::ResidualExposure {
                symbol: symbol.clone(),
                quantity: residual,
            });
        }

        info!(
            "[{}] {} closed by {} @ {:.6}, net pnl {:.4}",
            symbol,
            case,
            reason.as_str(),
            fill.price,
            net_pnl
        );
        out.events.push(LifecycleEvent::PositionClosed {
            symbol,
            case,
            exit_reason: reason,
            exit_price: fill.price,
            net_pnl,
        });
        out.closed = closed;
        out
    }

    /// An entry of a finished position filled after all: buy it back
    fn flatten_orphan(&mut self, fill: &FillEvent) -> Outcome {
        warn!(
            "[{}] entry {} filled after its position ended, flattening {:.6}",
            self.symbol, fill.order_id, fill.quantity
        );
        let mut out = Outcome::default();
        out.commands.push(Command::Place(OrderRequest::flatten(
            &self.symbol,
            fill.price,
            fill.quantity,
        )));
        out.events.push(LifecycleEvent::ResidualExposure {
            symbol: self.symbol.clone(),
            quantity: fill.quantity,
        });
        out
    }

    /// Track a price tick: cancel zone while pending, excursions while open
    pub fn on_price(&mut self, price: f64, at: DateTime<Utc>) -> Outcome {
        self.last_price = Some(price);
        let symbol = self.symbol.clone();
        let Some(pos) = self.position.as_mut().filter(|p| !p.state.is_terminal()) else {
            return Outcome::default();
        };

        let cancel_level = pos.plan.cancel_below.filter(|level| price <= *level);
        if pos.state == PositionState::EntryPending && pos.entries.is_empty() {
            if let Some(level) = cancel_level {
                pos.state = PositionState::Cancelled;
                pos.closed_at = Some(at);
                let case = pos.case;
                self.pending_secondary = None;
                info!(
                    "[{}] {} entry cancelled: price {:.6} at or below {:.6}",
                    symbol, case, price, level
                );
                let mut out = Outcome::changed();
                out.commands = self.cancel_pending(None);
                out.events.push(LifecycleEvent::EntryCancelled {
                    symbol,
                    case,
                    price,
                });
                return out;
            }
        }

        pos.track_price(price);
        Outcome::default()
    }

    /// The backend finished a sync and its fills are queued ahead of this call.
    /// A held rejection that no exit fill explained by now is escalated.
    pub fn on_synced(&mut self) -> Outcome {
        let Some(held) = self.held_rejection.as_mut() else {
            return Outcome::default();
        };
        held.syncs += 1;
        if held.syncs < REJECTION_GRACE_SYNCS {
            return Outcome::default();
        }
        let detail = format!("{}, and no exit fill followed", held.detail);
        self.held_rejection = None;
        let mut out = Outcome::changed();
        out.events.push(self.flag_inconsistent(detail));
        out
    }

    /// Apply the result of a cancel request. Only `Cancelled` changes state.
    pub fn on_cancel_result(&mut self, order_id: &OrderId, outcome: CancelOutcome) -> Outcome {
        match (outcome, self.orders.get_mut(order_id)) {
            (CancelOutcome::Cancelled, Some(tracked)) if tracked.order.is_pending() => {
                tracked.order.status = OrderStatus::Cancelled;
                tracked.order.updated_at = Utc::now();
                debug!("[{}] order {} cancelled", self.symbol, order_id);
                Outcome::changed()
            }
            (outcome, _) => {
                debug!(
                    "[{}] cancel of {} returned {:?}, nothing to change",
                    self.symbol, order_id, outcome
                );
                Outcome::default()
            }
        }
    }

    /// A cancel could not be completed after every retry
    pub fn on_cancel_failed(&mut self, order_id: &OrderId, error: &BackendError) -> Outcome {
        let mut out = Outcome::changed();
        out.events.push(
            self.flag_inconsistent(format!("cancel of order {} failed: {}", order_id, error)),
        );
        out
    }

    fn flag_inconsistent(&mut self, detail: String) -> LifecycleEvent {
        self.inconsistent = true;
        if let Some(pos) = self.position.as_mut() {
            pos.inconsistent = true;
        }
        tracing::error!("[{}] INCONSISTENT: {}", self.symbol, detail);
        LifecycleEvent::InconsistentState {
            symbol: self.symbol.clone(),
            detail,
        }
    }

    /// Forget orders of finished positions. Entries still working stay
    /// tracked so a late fill can be flattened.
    fn prune_finished(&mut self) {
        let before = self.orders.len();
        self.orders
            .retain(|_, t| t.order.is_pending() && t.order.role.is_entry());
        let orders = &self.orders;
        self.seen_fills.retain(|(id, _)| orders.contains_key(id));
        if before > self.orders.len() {
            debug!(
                "[{}] pruned {} finished orders",
                self.symbol,
                before - self.orders.len()
            );
        }
    }

    /// Cancel commands for every pending order of the current position
    fn cancel_pending(&self, except: Option<&OrderId>) -> Vec<Command> {
        let mut commands: Vec<Command> = self
            .orders
            .values()
            .filter(|t| t.seq == self.seq && t.order.is_pending())
            .filter(|t| Some(&t.order.id) != except)
            .map(|t| Command::Cancel {
                order_id: t.order.id.clone(),
                role: t.order.role,
            })
            .collect();
        // Deterministic order: protective orders first, then entries
        commands.sort_by_key(|c| match c {
            Command::Cancel { role, .. } if role.is_exit() => 0,
            _ => 1,
        });
        commands
    }

    fn quantity_tolerance(&self) -> f64 {
        self.position
            .as_ref()
            .map(|p| p.total_quantity * 1e-6)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{Case, CaseTable, LevelSet, Pivot, PivotKind, Swing};
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn proposal(case: Case, price: f64, table: &CaseTable) -> EntryProposal {
        let levels = LevelSet::from_range(200.0, 100.0, &[]);
        let plan = table.plan(case).resolve(&levels);
        let now = Utc::now();
        EntryProposal {
            symbol: Symbol::new("SOLUSDT"),
            case,
            swing: Swing {
                high: Pivot {
                    index: 10,
                    datetime: now,
                    price: 200.0,
                    kind: PivotKind::High,
                },
                low: Pivot {
                    index: 30,
                    datetime: now,
                    price: 100.0,
                    kind: PivotKind::Low,
                },
            },
            ratio: levels.ratio_of(price),
            reference_price: price,
            plan,
            primary_quantity: 10.0,
            secondary_quantity: plan.secondary_price.map(|_| 10.0),
            margin_per_order: 3.0,
            rsi: None,
            created_at: now,
        }
    }

    fn placed(id: &str) -> PlacedOrder {
        PlacedOrder {
            id: OrderId::new(id),
            status: OrderStatus::Pending,
        }
    }

    fn fill(id: &str, price: f64, quantity: f64, offset_ms: i64) -> FillEvent {
        FillEvent {
            symbol: Symbol::new("SOLUSDT"),
            order_id: OrderId::new(id),
            price,
            quantity,
            commission: 0.0,
            timestamp: Utc::now() + Duration::milliseconds(offset_ms),
        }
    }

    fn place_request(out: &Outcome, index: usize) -> OrderRequest {
        match &out.commands[index] {
            Command::Place(request) => request.clone(),
            other => panic!("expected place command, got {:?}", other),
        }
    }

    /// Admit a CASE_1 proposal and acknowledge both entries as P1/P2
    fn case_1_book() -> SymbolBook {
        let mut book = SymbolBook::new(Symbol::new("SOLUSDT"));
        let table = CaseTable::default();
        let out = book.admit(&proposal(Case::Case1, 155.0, &table), Utc::now()).unwrap();
        let primary = place_request(&out, 0);
        let out = book.on_placed(&primary, placed("P1"), Utc::now());
        let secondary = place_request(&out, 0);
        assert_eq!(secondary.linked_order_id, Some(OrderId::new("P1")));
        book.on_placed(&secondary, placed("P2"), Utc::now());
        book
    }

    /// Acknowledge TP/SL placements emitted by `out` as `tp`/`sl`
    fn ack_protection(book: &mut SymbolBook, out: &Outcome, tp: &str, sl: &str) {
        for command in &out.commands {
            if let Command::Place(request) = command {
                let id = match request.role {
                    OrderRole::TakeProfit => tp,
                    OrderRole::StopLoss => sl,
                    _ => continue,
                };
                book.on_placed(request, placed(id), Utc::now());
            }
        }
    }

    #[test]
    fn test_admission_places_primary_limit() {
        let mut book = SymbolBook::new(Symbol::new("SOLUSDT"));
        let out = book
            .admit(&proposal(Case::Case1, 155.0, &CaseTable::default()), Utc::now())
            .unwrap();
        let primary = place_request(&out, 0);
        assert_eq!(primary.role, OrderRole::Primary);
        assert_relative_eq!(primary.price.unwrap(), 161.8, epsilon = 1e-9);
        assert_eq!(book.position().unwrap().state, PositionState::EntryPending);
        assert!(book.is_active());
    }

    #[test]
    fn test_second_admission_rejected_while_open() {
        let mut book = case_1_book();
        let again = book.admit(&proposal(Case::Case1, 155.0, &CaseTable::default()), Utc::now());
        assert!(matches!(
            again,
            Err(AdmissionError::PositionOpen(PositionState::EntryPending))
        ));
    }

    #[test]
    fn test_linked_cancellation_on_take_profit() {
        let mut book = case_1_book();

        let out = book.on_fill(&fill("P1", 161.8, 10.0, 0));
        assert_eq!(book.position().unwrap().state, PositionState::OpenSingle);
        let tp = place_request(&out, 0);
        assert_relative_eq!(tp.price.unwrap(), 145.0, epsilon = 1e-9);
        ack_protection(&mut book, &out, "TP1", "SL1");

        let out = book.on_fill(&fill("TP1", 145.0, 10.0, 1));
        let pos = book.position().unwrap();
        assert_eq!(pos.state, PositionState::ClosedTp);
        assert!(out.closed.is_some());

        let cancels: Vec<&OrderId> = out
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::Cancel { order_id, .. } => Some(order_id),
                _ => None,
            })
            .collect();
        assert_eq!(cancels, vec![&OrderId::new("SL1"), &OrderId::new("P2")]);

        book.on_cancel_result(&OrderId::new("P2"), CancelOutcome::Cancelled);
        assert_eq!(book.order(&OrderId::new("P2")).unwrap().status, OrderStatus::Cancelled);

        // A late fill for the cancelled secondary never revives it
        let late = book.on_fill(&fill("P2", 178.6, 10.0, 2));
        assert!(late.is_empty());
        assert_eq!(book.order(&OrderId::new("P2")).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(book.position().unwrap().state, PositionState::ClosedTp);
    }

    #[test]
    fn test_dynamic_take_profit_after_averaging() {
        let mut table = CaseTable::default();
        table.case_1.take_profit = 0.45;
        let mut book = SymbolBook::new(Symbol::new("SOLUSDT"));
        let mut prop = proposal(Case::Case1, 155.0, &table);
        prop.plan.primary_price = Some(105.0);
        prop.plan.secondary_price = Some(110.0);

        let out = book.admit(&prop, Utc::now()).unwrap();
        let primary = place_request(&out, 0);
        let out = book.on_placed(&primary, placed("P1"), Utc::now());
        let secondary = place_request(&out, 0);
        assert_relative_eq!(secondary.price.unwrap(), 110.0);
        book.on_placed(&secondary, placed("P2"), Utc::now());

        let out = book.on_fill(&fill("P1", 105.0, 10.0, 0));
        ack_protection(&mut book, &out, "TP1", "SL1");

        let out = book.on_fill(&fill("P2", 110.0, 10.0, 1));
        let pos = book.position().unwrap();
        assert_eq!(pos.state, PositionState::OpenAveraged);
        assert_relative_eq!(pos.average_entry_price, 107.5);
        assert_relative_eq!(pos.total_quantity, 20.0);

        assert_eq!(
            out.commands[0],
            Command::Cancel {
                order_id: OrderId::new("TP1"),
                role: OrderRole::TakeProfit
            }
        );
        let new_tp = place_request(&out, 1);
        assert_relative_eq!(new_tp.price.unwrap(), 150.0, epsilon = 1e-9);
        assert_relative_eq!(new_tp.quantity, 20.0);
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, LifecycleEvent::DynamicTpActivated { .. })));
        // Stop loss is a close-position stop and stays untouched
        assert!(!out.commands.iter().any(|c| matches!(
            c,
            Command::Cancel {
                role: OrderRole::StopLoss,
                ..
            }
        )));
    }

    #[test]
    fn test_secondary_fill_first_opens_position() {
        let mut book = case_1_book();
        book.on_fill(&fill("P2", 178.6, 10.0, 0));
        let pos = book.position().unwrap();
        assert_eq!(pos.state, PositionState::OpenSingle);
        assert_relative_eq!(pos.average_entry_price, 178.6);
    }

    #[test]
    fn test_duplicate_fill_is_ignored() {
        let mut book = case_1_book();
        let f = fill("P1", 161.8, 10.0, 0);
        assert!(!book.on_fill(&f).is_empty());
        assert!(book.on_fill(&f).is_empty());
        assert_relative_eq!(book.position().unwrap().total_quantity, 10.0);
    }

    #[test]
    fn test_unknown_order_fill_is_ignored() {
        let mut book = case_1_book();
        assert!(book.on_fill(&fill("NOPE", 150.0, 1.0, 0)).is_empty());
        assert_eq!(book.position().unwrap().state, PositionState::EntryPending);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut book = case_1_book();
        let id = OrderId::new("P2");
        assert!(book.on_cancel_result(&id, CancelOutcome::Cancelled).changed);
        assert!(!book.on_cancel_result(&id, CancelOutcome::Cancelled).changed);
        assert!(!book.on_cancel_result(&id, CancelOutcome::AlreadyTerminal).changed);
        assert!(!book.on_cancel_result(&id, CancelOutcome::NotFound).changed);
        assert_eq!(book.order(&id).unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_case_4_stop_loss_cancels_take_profit() {
        let mut book = SymbolBook::new(Symbol::new("SOLUSDT"));
        let mut table = CaseTable::default();
        table.case_4.stop_loss = 1.10;
        let out = book.admit(&proposal(Case::Case4, 205.0, &table), Utc::now()).unwrap();
        let primary = place_request(&out, 0);
        assert_eq!(primary.kind, crate::oms::OrderKind::Market);
        let out = book.on_placed(&primary, placed("M1"), Utc::now());
        assert!(out.commands.is_empty());

        let out = book.on_fill(&fill("M1", 205.0, 10.0, 0));
        assert_relative_eq!(place_request(&out, 0).price.unwrap(), 160.0, epsilon = 1e-9);
        assert_relative_eq!(place_request(&out, 1).price.unwrap(), 210.0, epsilon = 1e-9);
        ack_protection(&mut book, &out, "TP1", "SL1");

        let out = book.on_fill(&fill("SL1", 210.0, 10.0, 1));
        assert_eq!(book.position().unwrap().state, PositionState::ClosedSl);
        assert_eq!(
            out.commands,
            vec![Command::Cancel {
                order_id: OrderId::new("TP1"),
                role: OrderRole::TakeProfit
            }]
        );
        let record = out.closed.unwrap();
        assert_relative_eq!(record.pnl, -50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_cancel_below_abandons_pending_entry() {
        let mut book = case_1_book();
        assert!(book.on_price(130.0, Utc::now()).is_empty());

        let out = book.on_price(119.0, Utc::now());
        assert_eq!(book.position().unwrap().state, PositionState::Cancelled);
        assert_eq!(out.commands.len(), 2);
        assert!(!book.is_active());

        // Next proposal can be admitted again
        assert!(book
            .admit(&proposal(Case::Case1, 155.0, &CaseTable::default()), Utc::now())
            .is_ok());
    }

    #[test]
    fn test_primary_failure_discards_position() {
        let mut book = SymbolBook::new(Symbol::new("SOLUSDT"));
        let out = book
            .admit(&proposal(Case::Case3, 180.0, &CaseTable::default()), Utc::now())
            .unwrap();
        let primary = place_request(&out, 0);
        let out = book.on_place_failed(&primary, &BackendError::Rejected("min notional".into()));
        assert!(book.position().is_none());
        assert!(matches!(out.events[0], LifecycleEvent::EntryFailed { .. }));
        assert!(!book.is_active());
    }

    #[test]
    fn test_secondary_failure_keeps_position() {
        let mut book = SymbolBook::new(Symbol::new("SOLUSDT"));
        let out = book
            .admit(&proposal(Case::Case1, 155.0, &CaseTable::default()), Utc::now())
            .unwrap();
        let primary = place_request(&out, 0);
        let out = book.on_placed(&primary, placed("P1"), Utc::now());
        let secondary = place_request(&out, 0);
        book.on_place_failed(&secondary, &BackendError::Network("timeout".into()));

        let pos = book.position().unwrap();
        assert!(pos.secondary_failed);
        assert_eq!(pos.state, PositionState::EntryPending);
        assert!(!book.is_inconsistent());
    }

    #[test]
    fn test_cancel_failure_blocks_new_entries() {
        let mut book = case_1_book();
        let out = book.on_cancel_failed(&OrderId::new("P2"), &BackendError::Network("down".into()));
        assert!(matches!(out.events[0], LifecycleEvent::InconsistentState { .. }));
        assert!(book.is_inconsistent());
        assert!(book.position().unwrap().inconsistent);

        book.on_price(110.0, Utc::now());
        let again = book.admit(&proposal(Case::Case1, 155.0, &CaseTable::default()), Utc::now());
        assert!(matches!(again, Err(AdmissionError::Inconsistent)));
    }

    #[test]
    fn test_late_ack_after_close_is_cancelled() {
        let mut book = case_1_book();
        book.on_price(100.0, Utc::now());
        let stray = OrderRequest::take_profit(&Symbol::new("SOLUSDT"), 145.0, 10.0);
        let out = book.on_placed(&stray, placed("TPX"), Utc::now());
        assert_eq!(
            out.commands,
            vec![Command::Cancel {
                order_id: OrderId::new("TPX"),
                role: OrderRole::TakeProfit
            }]
        );
    }

    #[test]
    fn test_entry_fill_after_close_is_flattened() {
        let mut book = case_1_book();
        let out = book.on_fill(&fill("P1", 161.8, 10.0, 0));
        ack_protection(&mut book, &out, "TP1", "SL1");
        book.on_fill(&fill("TP1", 145.0, 10.0, 1));
        // Secondary cancel raced with its fill
        book.on_cancel_result(&OrderId::new("P2"), CancelOutcome::AlreadyTerminal);

        let out = book.on_fill(&fill("P2", 178.6, 10.0, 2));
        let flatten = place_request(&out, 0);
        assert_eq!(flatten.role, OrderRole::Flatten);
        assert_relative_eq!(flatten.quantity, 10.0);
        assert_eq!(book.position().unwrap().state, PositionState::ClosedTp);
    }

    #[test]
    fn test_excursions_tracked_while_open() {
        let mut book = case_1_book();
        book.on_fill(&fill("P1", 160.0, 10.0, 0));
        book.on_price(170.0, Utc::now());
        book.on_price(150.0, Utc::now());
        let pos = book.position().unwrap();
        assert_relative_eq!(pos.max_adverse_pnl, -100.0, epsilon = 1e-9);
        assert_relative_eq!(pos.max_favorable_pnl, 100.0, epsilon = 1e-9);
    }

    /// CASE_1 opened by P1, then P2 fills: returns the replacement TP request
    fn averaged_book() -> (SymbolBook, OrderRequest) {
        let mut book = case_1_book();
        let out = book.on_fill(&fill("P1", 161.8, 10.0, 0));
        ack_protection(&mut book, &out, "TP1", "SL1");
        let out = book.on_fill(&fill("P2", 178.6, 10.0, 1));
        book.on_cancel_result(&OrderId::new("TP1"), CancelOutcome::Cancelled);
        let new_tp = place_request(&out, 1);
        assert_eq!(new_tp.role, OrderRole::TakeProfit);
        (book, new_tp)
    }

    fn reduce_only_rejection() -> BackendError {
        BackendError::Rejected("reduce-only take_profit without open position on SOLUSDT".into())
    }

    #[test]
    fn test_rejected_take_profit_resolved_by_stop_fill() {
        let (mut book, new_tp) = averaged_book();

        // Stop flattened the venue position in the same tick
        let out = book.on_place_failed(&new_tp, &reduce_only_rejection());
        assert!(out.events.is_empty());
        assert!(!book.is_inconsistent());

        let out = book.on_fill(&fill("SL1", 201.0, 20.0, 2));
        assert_eq!(book.position().unwrap().state, PositionState::ClosedSl);
        assert!(out.closed.is_some());

        assert!(book.on_synced().is_empty());
        assert!(book.on_synced().is_empty());
        assert!(!book.is_inconsistent());
        assert!(!book.position().unwrap().inconsistent);
        assert!(book
            .admit(&proposal(Case::Case1, 155.0, &CaseTable::default()), Utc::now())
            .is_ok());
    }

    #[test]
    fn test_unexplained_rejection_flags_after_next_sync() {
        let (mut book, new_tp) = averaged_book();
        book.on_place_failed(&new_tp, &reduce_only_rejection());

        // Fills revealed by this sync may still be on their way
        assert!(book.on_synced().is_empty());
        assert!(!book.is_inconsistent());

        let out = book.on_synced();
        assert!(matches!(
            out.events.as_slice(),
            [LifecycleEvent::InconsistentState { .. }]
        ));
        assert!(book.is_inconsistent());
        assert_eq!(book.position().unwrap().state, PositionState::OpenAveraged);
    }

    #[test]
    fn test_transient_protection_failure_flags_immediately() {
        let (mut book, new_tp) = averaged_book();
        let out = book.on_place_failed(&new_tp, &BackendError::Network("timeout".into()));
        assert!(matches!(out.events[0], LifecycleEvent::InconsistentState { .. }));
        assert!(book.is_inconsistent());
    }

    #[test]
    fn test_finished_orders_pruned_on_next_admission() {
        let mut book = case_1_book();
        let out = book.on_fill(&fill("P1", 161.8, 10.0, 0));
        ack_protection(&mut book, &out, "TP1", "SL1");
        book.on_fill(&fill("TP1", 145.0, 10.0, 1));
        book.on_cancel_result(&OrderId::new("SL1"), CancelOutcome::Cancelled);
        // Secondary may still fill at the venue
        book.on_cancel_result(&OrderId::new("P2"), CancelOutcome::AlreadyTerminal);

        book.admit(&proposal(Case::Case3, 180.0, &CaseTable::default()), Utc::now())
            .unwrap();
        for id in ["P1", "TP1", "SL1"] {
            assert!(book.order(&OrderId::new(id)).is_none(), "{} kept", id);
        }
        assert!(book.order(&OrderId::new("P2")).is_some());

        // Replayed fill of a forgotten order stays a no-op
        assert!(book.on_fill(&fill("TP1", 145.0, 10.0, 1)).is_empty());
        let out = book.on_fill(&fill("P2", 178.6, 10.0, 3));
        assert_eq!(place_request(&out, 0).role, OrderRole::Flatten);
        assert_eq!(book.position().unwrap().state, PositionState::EntryPending);
    }

    #[test]
    fn test_restored_position_keeps_its_orders() {
        let mut old = case_1_book();
        let out = old.on_fill(&fill("P1", 161.8, 10.0, 0));
        ack_protection(&mut old, &out, "TP1", "SL1");
        let saved = old.position().unwrap().clone();

        let mut book = SymbolBook::new(Symbol::new("SOLUSDT"));
        let working = book.restore(saved, Utc::now());
        let ids: Vec<&str> = working.iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["P2", "TP1", "SL1"]);
        assert!(book.is_active());
        assert!(matches!(
            book.admit(&proposal(Case::Case1, 155.0, &CaseTable::default()), Utc::now()),
            Err(AdmissionError::PositionOpen(PositionState::OpenSingle))
        ));

        let out = book.on_fill(&fill("SL1", 200.0, 10.0, 5));
        assert_eq!(book.position().unwrap().state, PositionState::ClosedSl);
        assert!(out.closed.is_some());
        assert_eq!(
            out.commands,
            vec![
                Command::Cancel {
                    order_id: OrderId::new("TP1"),
                    role: OrderRole::TakeProfit
                },
                Command::Cancel {
                    order_id: OrderId::new("P2"),
                    role: OrderRole::Secondary
                },
            ]
        );
    }
}
