//! Short position built from one or two entry fills

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{OrderId, OrderRole};
use crate::strategy::{Case, EntryProposal, ResolvedPlan};
use crate::Symbol;

/// Position lifecycle. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    EntryPending,
    OpenSingle,
    OpenAveraged,
    ClosedTp,
    ClosedSl,
    Cancelled,
}

impl PositionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionState::ClosedTp | PositionState::ClosedSl | PositionState::Cancelled
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self, PositionState::OpenSingle | PositionState::OpenAveraged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::EntryPending => "ENTRY_PENDING",
            PositionState::OpenSingle => "OPEN_SINGLE",
            PositionState::OpenAveraged => "OPEN_AVERAGED",
            PositionState::ClosedTp => "CLOSED_TP",
            PositionState::ClosedSl => "CLOSED_SL",
            PositionState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
        }
    }
}

/// One filled entry order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub order_id: OrderId,
    pub role: OrderRole,
    pub price: f64,
    pub quantity: f64,
    pub commission: f64,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub case: Case,
    pub plan: ResolvedPlan,
    pub swing_high: f64,
    pub swing_low: f64,
    pub state: PositionState,
    /// An order command could not be completed; exchange state is unknown
    pub inconsistent: bool,

    pub entries: Vec<Entry>,
    pub average_entry_price: f64,
    pub total_quantity: f64,

    pub primary_order_id: Option<OrderId>,
    pub secondary_order_id: Option<OrderId>,
    pub take_profit_order_id: Option<OrderId>,
    pub stop_loss_order_id: Option<OrderId>,
    /// Price of the take profit currently working
    pub take_profit_price: f64,
    /// Averaging is off once the secondary could not be placed
    pub secondary_failed: bool,

    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: f64,
    pub commission: f64,
    /// Worst and best mark-to-market seen while open
    pub max_adverse_pnl: f64,
    pub max_favorable_pnl: f64,

    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn from_proposal(proposal: &EntryProposal, at: DateTime<Utc>) -> Self {
        Self {
            symbol: proposal.symbol.clone(),
            case: proposal.case,
            plan: proposal.plan,
            swing_high: proposal.swing.high.price,
            swing_low: proposal.swing.low.price,
            state: PositionState::EntryPending,
            inconsistent: false,
            entries: Vec::new(),
            average_entry_price: 0.0,
            total_quantity: 0.0,
            primary_order_id: None,
            secondary_order_id: None,
            take_profit_order_id: None,
            stop_loss_order_id: None,
            take_profit_price: proposal.plan.take_profit,
            secondary_failed: false,
            exit_price: None,
            exit_reason: None,
            realized_pnl: 0.0,
            commission: 0.0,
            max_adverse_pnl: 0.0,
            max_favorable_pnl: 0.0,
            created_at: at,
            opened_at: None,
            closed_at: None,
        }
    }

    /// Record an entry fill and recompute the average from every entry
    pub fn add_entry(&mut self, entry: Entry) {
        self.commission += entry.commission;
        if self.opened_at.is_none() {
            self.opened_at = Some(entry.filled_at);
        }
        self.entries.push(entry);

        self.total_quantity = self.entries.iter().map(|e| e.quantity).sum();
        self.average_entry_price = if self.total_quantity > 0.0 {
            self.entries.iter().map(|e| e.price * e.quantity).sum::<f64>() / self.total_quantity
        } else {
            0.0
        };
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (self.average_entry_price - price) * self.total_quantity
    }

    pub fn track_price(&mut self, price: f64) {
        if !self.state.is_open() {
            return;
        }
        let pnl = self.unrealized_pnl(price);
        self.max_adverse_pnl = self.max_adverse_pnl.min(pnl);
        self.max_favorable_pnl = self.max_favorable_pnl.max(pnl);
    }

    /// Close on an exit fill of `quantity` at `price`
    pub fn close(
        &mut self,
        reason: ExitReason,
        price: f64,
        quantity: f64,
        commission: f64,
        at: DateTime<Utc>,
    ) {
        self.state = match reason {
            ExitReason::TakeProfit => PositionState::ClosedTp,
            ExitReason::StopLoss => PositionState::ClosedSl,
        };
        self.exit_price = Some(price);
        self.exit_reason = Some(reason);
        self.commission += commission;
        self.realized_pnl = (self.average_entry_price - price) * quantity.min(self.total_quantity);
        self.closed_at = Some(at);
    }

    pub fn net_pnl(&self) -> f64 {
        self.realized_pnl - self.commission
    }

    /// Ids of orders this position still references, any role
    pub fn order_ids(&self) -> impl Iterator<Item = &OrderId> {
        [
            &self.primary_order_id,
            &self.secondary_order_id,
            &self.take_profit_order_id,
            &self.stop_loss_order_id,
        ]
        .into_iter()
        .flatten()
    }

    /// Immutable record of a closed position
    pub fn to_record(&self) -> Option<TradeRecord> {
        let (exit_price, exit_reason, closed_at) =
            (self.exit_price?, self.exit_reason?, self.closed_at?);
        Some(TradeRecord {
            symbol: self.symbol.clone(),
            case: self.case,
            entries: self.entries.clone(),
            average_entry_price: self.average_entry_price,
            quantity: self.total_quantity,
            exit_price,
            exit_reason,
            pnl: self.realized_pnl,
            commission: self.commission,
            net_pnl: self.net_pnl(),
            max_adverse_pnl: self.max_adverse_pnl,
            max_favorable_pnl: self.max_favorable_pnl,
            swing_high: self.swing_high,
            swing_low: self.swing_low,
            take_profit: self.take_profit_price,
            stop_loss: self.plan.stop_loss,
            opened_at: self.opened_at.unwrap_or(self.created_at),
            closed_at,
        })
    }
}

/// Closed trade as handed to persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: Symbol,
    pub case: Case,
    pub entries: Vec<Entry>,
    pub average_entry_price: f64,
    pub quantity: f64,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub pnl: f64,
    pub commission: f64,
    pub net_pnl: f64,
    pub max_adverse_pnl: f64,
    pub max_favorable_pnl: f64,
    pub swing_high: f64,
    pub swing_low: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn is_win(&self) -> bool {
        self.net_pnl > 0.0
    }

    pub fn return_pct(&self) -> f64 {
        let notional = self.average_entry_price * self.quantity;
        if notional <= 0.0 {
            return 0.0;
        }
        self.net_pnl / notional * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn entry(id: &str, price: f64, quantity: f64) -> Entry {
        Entry {
            order_id: OrderId::new(id),
            role: OrderRole::Primary,
            price,
            quantity,
            commission: 0.0,
            filled_at: Utc::now(),
        }
    }

    fn position() -> Position {
        let plan = ResolvedPlan {
            primary_price: Some(105.0),
            secondary_price: Some(110.0),
            take_profit: 95.0,
            dynamic_take_profit: Some(100.0),
            stop_loss: 120.0,
            cancel_below: None,
        };
        Position {
            symbol: Symbol::new("ETHUSDT"),
            case: Case::Case1,
            plan,
            swing_high: 120.0,
            swing_low: 80.0,
            state: PositionState::EntryPending,
            inconsistent: false,
            entries: vec![],
            average_entry_price: 0.0,
            total_quantity: 0.0,
            primary_order_id: None,
            secondary_order_id: None,
            take_profit_order_id: None,
            stop_loss_order_id: None,
            take_profit_price: plan.take_profit,
            secondary_failed: false,
            exit_price: None,
            exit_reason: None,
            realized_pnl: 0.0,
            commission: 0.0,
            max_adverse_pnl: 0.0,
            max_favorable_pnl: 0.0,
            created_at: Utc::now(),
            opened_at: None,
            closed_at: None,
        }
    }

    #[test]
    fn test_average_recomputed_from_entries() {
        let mut pos = position();
        pos.add_entry(entry("1", 105.0, 10.0));
        assert_relative_eq!(pos.average_entry_price, 105.0);

        pos.add_entry(entry("2", 110.0, 10.0));
        assert_relative_eq!(pos.average_entry_price, 107.5);
        assert_relative_eq!(pos.total_quantity, 20.0);

        let mut uneven = position();
        uneven.add_entry(entry("1", 100.0, 3.0));
        uneven.add_entry(entry("2", 120.0, 1.0));
        assert_relative_eq!(uneven.average_entry_price, 105.0);
    }

    #[test]
    fn test_short_pnl_and_record() {
        let mut pos = position();
        pos.add_entry(entry("1", 105.0, 10.0));
        pos.state = PositionState::OpenSingle;
        pos.track_price(108.0);
        pos.track_price(97.0);
        assert_relative_eq!(pos.max_adverse_pnl, -30.0);
        assert_relative_eq!(pos.max_favorable_pnl, 80.0);

        pos.close(ExitReason::TakeProfit, 95.0, 10.0, 0.5, Utc::now());
        assert_eq!(pos.state, PositionState::ClosedTp);
        assert_relative_eq!(pos.realized_pnl, 100.0);
        assert_relative_eq!(pos.net_pnl(), 99.5);

        let record = pos.to_record().unwrap();
        assert!(record.is_win());
        assert_eq!(record.exit_reason, ExitReason::TakeProfit);
        assert_relative_eq!(record.return_pct(), 99.5 / 1050.0 * 100.0);
    }

    #[test]
    fn test_open_position_has_no_record() {
        let mut pos = position();
        pos.add_entry(entry("1", 105.0, 1.0));
        assert!(pos.to_record().is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(PositionState::ClosedTp.is_terminal());
        assert!(PositionState::Cancelled.is_terminal());
        assert!(!PositionState::OpenAveraged.is_terminal());
        assert!(!PositionState::EntryPending.is_open());
    }
}
