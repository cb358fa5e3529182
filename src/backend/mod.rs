//! Trading backends
//!
//! The order manager only sees [`TradingBackend`]. Paper and live backends
//! place and cancel orders and report completed orders as [`FillEvent`]s on
//! the channel they were constructed with.

pub mod live;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::oms::{CancelOutcome, FillEvent, OrderId, OrderRequest, PlacedOrder};
use crate::Symbol;

pub use live::LiveBackend;
pub use paper::PaperBackend;

pub type FillSender = mpsc::UnboundedSender<FillEvent>;
pub type FillReceiver = mpsc::UnboundedReceiver<FillEvent>;

pub fn fill_channel() -> (FillSender, FillReceiver) {
    mpsc::unbounded_channel()
}

#[async_trait]
pub trait TradingBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, BackendError>;

    /// Cancel a working order. Cancelling something already finished or
    /// unknown is not an error.
    async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &OrderId,
    ) -> Result<CancelOutcome, BackendError>;

    /// Margin free for new entries
    async fn available_margin(&self) -> Result<f64, BackendError>;

    /// Wallet balance including margin held by open orders and positions
    async fn balance(&self) -> Result<f64, BackendError> {
        self.available_margin().await
    }

    /// Latest observed price. Simulated backends match resting orders here.
    async fn on_price(
        &self,
        _symbol: &Symbol,
        _price: f64,
        _at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Follow an order placed by an earlier session so its fill is reported
    async fn watch_order(&self, _symbol: &Symbol, _order_id: &OrderId) {}

    /// Reconcile with the venue and emit fills for orders that completed
    async fn sync(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
