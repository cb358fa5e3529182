//! Order Management System (OMS)
//!
//! - Order and position types shared with the backends
//! - Per-symbol state machine ([`SymbolBook`]) with linked cancellation,
//!   dynamic take profit and stale-fill handling
//! - Single-owner symbol workers executing the state machine's commands

pub mod book;
pub mod position;
pub mod types;
pub mod worker;

// Re-export core types
pub use book::{Command, Outcome, SymbolBook};
pub use position::{Entry, ExitReason, Position, PositionState, TradeRecord};
pub use types::{
    CancelOutcome, FillEvent, Order, OrderId, OrderKind, OrderRequest, OrderRole, OrderStatus,
    PlacedOrder,
};
pub use worker::{spawn_worker, BookSnapshot, SymbolEvent, SymbolHandle, WorkerContext};
