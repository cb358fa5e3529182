//! Core OMS types
//!
//! Orders, fills and the requests exchanged with a trading backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Side, Symbol};

/// Backend-assigned order identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        OrderId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order type - determines execution logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    /// Execute immediately at the prevailing price
    Market,

    /// Sell limit: executes when price ≥ limit.
    /// Buy limit: executes when price ≤ limit.
    Limit,

    /// Buy stop: triggers when price ≥ stop and closes the whole position
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

/// Part an order plays in a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    Primary,
    Secondary,
    TakeProfit,
    StopLoss,
    /// Market buy closing exposure left behind by a race
    Flatten,
}

impl OrderRole {
    pub fn is_entry(&self) -> bool {
        matches!(self, OrderRole::Primary | OrderRole::Secondary)
    }

    pub fn is_exit(&self) -> bool {
        !self.is_entry()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderRole::Primary => "primary",
            OrderRole::Secondary => "secondary",
            OrderRole::TakeProfit => "take_profit",
            OrderRole::StopLoss => "stop_loss",
            OrderRole::Flatten => "flatten",
        }
    }
}

impl fmt::Display for OrderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the order manager asks a backend to place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub role: OrderRole,
    pub side: Side,
    pub kind: OrderKind,
    /// Limit price or stop trigger; `None` for market orders
    pub price: Option<f64>,
    pub quantity: f64,
    pub reduce_only: bool,
    /// Stop that closes whatever position is open instead of a fixed size
    pub close_position: bool,
    pub linked_order_id: Option<OrderId>,
    /// Last known price, used to simulate market fills
    pub reference_price: f64,
}

impl OrderRequest {
    pub fn sell_limit(symbol: &Symbol, role: OrderRole, price: f64, quantity: f64) -> Self {
        Self {
            symbol: symbol.clone(),
            role,
            side: Side::Sell,
            kind: OrderKind::Limit,
            price: Some(price),
            quantity,
            reduce_only: false,
            close_position: false,
            linked_order_id: None,
            reference_price: price,
        }
    }

    pub fn sell_market(symbol: &Symbol, role: OrderRole, reference: f64, quantity: f64) -> Self {
        Self {
            symbol: symbol.clone(),
            role,
            side: Side::Sell,
            kind: OrderKind::Market,
            price: None,
            quantity,
            reduce_only: false,
            close_position: false,
            linked_order_id: None,
            reference_price: reference,
        }
    }

    pub fn take_profit(symbol: &Symbol, price: f64, quantity: f64) -> Self {
        Self {
            symbol: symbol.clone(),
            role: OrderRole::TakeProfit,
            side: Side::Buy,
            kind: OrderKind::Limit,
            price: Some(price),
            quantity,
            reduce_only: true,
            close_position: false,
            linked_order_id: None,
            reference_price: price,
        }
    }

    pub fn stop_loss(symbol: &Symbol, trigger: f64, quantity: f64) -> Self {
        Self {
            symbol: symbol.clone(),
            role: OrderRole::StopLoss,
            side: Side::Buy,
            kind: OrderKind::Stop,
            price: Some(trigger),
            quantity,
            reduce_only: true,
            close_position: true,
            linked_order_id: None,
            reference_price: trigger,
        }
    }

    pub fn flatten(symbol: &Symbol, reference: f64, quantity: f64) -> Self {
        Self {
            symbol: symbol.clone(),
            role: OrderRole::Flatten,
            side: Side::Buy,
            kind: OrderKind::Market,
            price: None,
            quantity,
            reduce_only: true,
            close_position: false,
            linked_order_id: None,
            reference_price: reference,
        }
    }

    pub fn linked_to(mut self, id: &OrderId) -> Self {
        self.linked_order_id = Some(id.clone());
        self
    }
}

/// Order as tracked by the order manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: Symbol,
    pub role: OrderRole,
    pub side: Side,
    pub kind: OrderKind,
    pub price: Option<f64>,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub average_fill_price: f64,
    pub status: OrderStatus,
    pub reduce_only: bool,
    pub linked_order_id: Option<OrderId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn from_request(id: OrderId, request: &OrderRequest, at: DateTime<Utc>) -> Self {
        Self {
            id,
            symbol: request.symbol.clone(),
            role: request.role,
            side: request.side,
            kind: request.kind,
            price: request.price,
            quantity: request.quantity,
            filled_quantity: 0.0,
            average_fill_price: 0.0,
            status: OrderStatus::Pending,
            reduce_only: request.reduce_only,
            linked_order_id: request.linked_order_id.clone(),
            created_at: at,
            updated_at: at,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

/// Acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub id: OrderId,
    pub status: OrderStatus,
}

/// Result of a cancel request. Every variant means "no longer working".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    Cancelled,
    /// Already filled or cancelled
    AlreadyTerminal,
    NotFound,
}

/// Execution report. One report per completed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub symbol: Symbol,
    pub order_id: OrderId,
    pub price: f64,
    pub quantity: f64,
    pub commission: f64,
    pub timestamp: DateTime<Utc>,
}
