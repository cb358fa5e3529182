//! Live Binance futures backend
//!
//! Orders are sent to the venue after rounding to the contract's tick and
//! step sizes. Working orders are polled by [`TradingBackend::sync`] and a
//! [`FillEvent`] is emitted once an order reports `FILLED`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{FillSender, TradingBackend};
use crate::binance::{BinanceClient, FuturesOrder, SymbolRules};
use crate::error::BackendError;
use crate::oms::{
    CancelOutcome, FillEvent, OrderId, OrderKind, OrderRequest, OrderStatus, PlacedOrder,
};
use crate::{Side, Symbol};

/// Unknown order sent: already filled, cancelled or expired
const ERR_UNKNOWN_ORDER: i64 = -2011;
/// Order does not exist
const ERR_NO_SUCH_ORDER: i64 = -2013;
/// ReduceOnly order is rejected: nothing left to reduce
const ERR_REDUCE_ONLY_REJECTED: i64 = -2022;

pub struct LiveBackend {
    client: Arc<BinanceClient>,
    fills: FillSender,
    leverage: u32,
    rules: RwLock<HashMap<String, SymbolRules>>,
    /// Orders still working on the venue, polled for completion
    working: Mutex<HashMap<OrderId, Symbol>>,
    leverage_set: Mutex<HashSet<Symbol>>,
}

impl LiveBackend {
    pub fn new(client: Arc<BinanceClient>, leverage: f64, fills: FillSender) -> Self {
        Self {
            client,
            fills,
            leverage: leverage.round().max(1.0) as u32,
            rules: RwLock::new(HashMap::new()),
            working: Mutex::new(HashMap::new()),
            leverage_set: Mutex::new(HashSet::new()),
        }
    }

    /// Load tick/step sizes of every trading contract
    pub async fn load_rules(&self) -> Result<usize, BackendError> {
        let info = self.client.exchange_info().await?;
        let rules: HashMap<String, SymbolRules> = info
            .symbols
            .iter()
            .filter(|s| s.status == "TRADING")
            .map(|s| (s.symbol.clone(), SymbolRules::from_info(s)))
            .collect();
        let count = rules.len();
        *self.rules.write().await = rules;
        info!("Loaded trading rules for {} contracts", count);
        Ok(count)
    }

    async fn rules_for(&self, symbol: &Symbol) -> Result<SymbolRules, BackendError> {
        if self.rules.read().await.is_empty() {
            self.load_rules().await?;
        }
        self.rules
            .read()
            .await
            .get(symbol.as_str())
            .copied()
            .ok_or_else(|| BackendError::Rejected(format!("{} is not a trading contract", symbol)))
    }

    async fn ensure_leverage(&self, symbol: &Symbol) -> Result<(), BackendError> {
        let mut done = self.leverage_set.lock().await;
        if done.contains(symbol) {
            return Ok(());
        }
        self.client.set_leverage(symbol.as_str(), self.leverage).await?;
        done.insert(symbol.clone());
        debug!("[{}] leverage set to {}x", symbol, self.leverage);
        Ok(())
    }

    fn order_params(
        request: &OrderRequest,
        rules: &SymbolRules,
    ) -> Result<Vec<(&'static str, String)>, BackendError> {
        let quantity = rules.round_quantity(request.quantity);
        if !request.close_position && quantity <= 0.0 {
            return Err(BackendError::Rejected(format!(
                "quantity {} below lot size {}",
                request.quantity, rules.step_size
            )));
        }
        let price = request.price.map(|p| rules.round_price(p));
        let notional = quantity * price.unwrap_or(request.reference_price);
        if !request.reduce_only && notional < rules.min_notional {
            return Err(BackendError::Rejected(format!(
                "notional {:.4} below minimum {}",
                notional, rules.min_notional
            )));
        }

        let mut params = vec![
            ("symbol", request.symbol.to_string()),
            ("side", request.side.as_str().to_string()),
        ];
        match (request.kind, price) {
            (OrderKind::Market, _) => params.push(("type", "MARKET".into())),
            (OrderKind::Limit, Some(p)) => {
                params.push(("type", "LIMIT".into()));
                params.push(("timeInForce", "GTC".into()));
                params.push(("price", p.to_string()));
            }
            (OrderKind::Stop, Some(p)) => {
                params.push(("type", "STOP_MARKET".into()));
                params.push(("stopPrice", p.to_string()));
            }
            (kind, None) => {
                return Err(BackendError::Rejected(format!("{:?} order without price", kind)));
            }
        }
        if request.close_position {
            params.push(("closePosition", "true".into()));
        } else {
            params.push(("quantity", quantity.to_string()));
            if request.reduce_only {
                params.push(("reduceOnly", "true".into()));
            }
        }
        Ok(params)
    }

    /// Emit the fill of a completed order, commission looked up best effort
    async fn emit_fill(&self, symbol: &Symbol, order: &FuturesOrder) {
        let commission = match self.client.order_trades(symbol.as_str(), order.order_id).await {
            Ok(trades) => trades.iter().map(|t| t.commission).sum(),
            Err(e) => {
                warn!("[{}] commission lookup for {} failed: {}", symbol, order.order_id, e);
                0.0
            }
        };
        let fill = FillEvent {
            symbol: symbol.clone(),
            order_id: OrderId::new(order.order_id.to_string()),
            price: order.avg_price,
            quantity: order.executed_qty,
            commission,
            timestamp: DateTime::from_timestamp_millis(order.update_time).unwrap_or_else(Utc::now),
        };
        info!(
            "[{}] order {} filled {:.6} @ {:.6}",
            symbol, fill.order_id, fill.quantity, fill.price
        );
        if self.fills.send(fill).is_err() {
            warn!("Fill receiver dropped");
        }
    }
}

fn parse_order_id(id: &OrderId) -> Option<i64> {
    id.as_str().parse().ok()
}

/// Venue refusals that say something about our position become `Rejected`
fn placement_error(error: BackendError) -> BackendError {
    match error {
        BackendError::Exchange { code, message } if code == ERR_REDUCE_ONLY_REJECTED => {
            BackendError::Rejected(message)
        }
        other => other,
    }
}

#[async_trait]
impl TradingBackend for LiveBackend {
    fn name(&self) -> &str {
        "binance"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, BackendError> {
        let rules = self.rules_for(&request.symbol).await?;
        if request.side == Side::Sell && !request.reduce_only {
            self.ensure_leverage(&request.symbol).await?;
        }
        let params = Self::order_params(request, &rules)?;
        let order = self
            .client
            .place_order(&params)
            .await
            .map_err(placement_error)?;
        let id = OrderId::new(order.order_id.to_string());
        info!(
            "[{}] placed {} {} order {} ({})",
            request.symbol, request.role, request.side.as_str(), id, order.status
        );

        if order.is_filled() {
            self.emit_fill(&request.symbol, &order).await;
        } else if !order.is_closed() {
            self.working.lock().await.insert(id.clone(), request.symbol.clone());
        } else {
            return Err(BackendError::Rejected(format!("order {} {}", id, order.status)));
        }

        Ok(PlacedOrder {
            id,
            status: OrderStatus::Pending,
        })
    }

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &OrderId,
    ) -> Result<CancelOutcome, BackendError> {
        let Some(venue_id) = parse_order_id(order_id) else {
            return Ok(CancelOutcome::NotFound);
        };
        match self.client.cancel_order(symbol.as_str(), venue_id).await {
            Ok(order) if order.status == "CANCELED" => {
                self.working.lock().await.remove(order_id);
                Ok(CancelOutcome::Cancelled)
            }
            // Filled meanwhile: leave it to sync so the fill is still reported
            Ok(_) => Ok(CancelOutcome::AlreadyTerminal),
            Err(BackendError::Exchange { code, .. }) if code == ERR_UNKNOWN_ORDER => {
                Ok(CancelOutcome::AlreadyTerminal)
            }
            Err(BackendError::Exchange { code, .. }) if code == ERR_NO_SUCH_ORDER => {
                self.working.lock().await.remove(order_id);
                Ok(CancelOutcome::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn available_margin(&self) -> Result<f64, BackendError> {
        let balances = self.client.balances().await?;
        Ok(balances
            .iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.available_balance)
            .unwrap_or(0.0))
    }

    async fn balance(&self) -> Result<f64, BackendError> {
        let balances = self.client.balances().await?;
        Ok(balances
            .iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.balance)
            .unwrap_or(0.0))
    }

    async fn watch_order(&self, symbol: &Symbol, order_id: &OrderId) {
        if parse_order_id(order_id).is_some() {
            self.working
                .lock()
                .await
                .insert(order_id.clone(), symbol.clone());
        }
    }

    async fn sync(&self) -> Result<(), BackendError> {
        let working: Vec<(OrderId, Symbol)> = self
            .working
            .lock()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        for (id, symbol) in working {
            let Some(venue_id) = parse_order_id(&id) else {
                continue;
            };
            let order = match self.client.query_order(symbol.as_str(), venue_id).await {
                Ok(order) => order,
                Err(e) => {
                    warn!("[{}] status of order {} unavailable: {}", symbol, id, e);
                    continue;
                }
            };
            if !order.is_closed() {
                continue;
            }
            self.working.lock().await.remove(&id);
            if order.is_filled() {
                self.emit_fill(&symbol, &order).await;
            } else {
                debug!("[{}] order {} closed as {}", symbol, id, order.status);
            }
        }
        Ok(())
    }
}
