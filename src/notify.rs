//! Lifecycle events and their delivery
//!
//! The order manager publishes [`LifecycleEvent`]s on an [`EventBus`]. A
//! dispatcher task drains the bus and hands every event to each configured
//! [`EventSink`]. Publishing never blocks and never fails the publisher; a
//! sink that errors is logged and skipped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NotificationConfig;
use crate::oms::{ExitReason, OrderRole};
use crate::strategy::Case;
use crate::Symbol;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    EntryPlaced {
        symbol: Symbol,
        case: Case,
        role: OrderRole,
        /// `None` for market entries
        price: Option<f64>,
        quantity: f64,
    },
    EntryFailed {
        symbol: Symbol,
        case: Case,
        reason: String,
    },
    SecondaryFailed {
        symbol: Symbol,
        reason: String,
    },
    PositionOpened {
        symbol: Symbol,
        case: Case,
        entry_price: f64,
        quantity: f64,
        take_profit: f64,
        stop_loss: f64,
    },
    PositionAveraged {
        symbol: Symbol,
        average_entry_price: f64,
        total_quantity: f64,
    },
    DynamicTpActivated {
        symbol: Symbol,
        take_profit: f64,
        quantity: f64,
    },
    EntryCancelled {
        symbol: Symbol,
        case: Case,
        price: f64,
    },
    PositionClosed {
        symbol: Symbol,
        case: Case,
        exit_reason: ExitReason,
        exit_price: f64,
        net_pnl: f64,
    },
    ResidualExposure {
        symbol: Symbol,
        quantity: f64,
    },
    InconsistentState {
        symbol: Symbol,
        detail: String,
    },
}

impl LifecycleEvent {
    pub fn symbol(&self) -> &Symbol {
        match self {
            LifecycleEvent::EntryPlaced { symbol, .. }
            | LifecycleEvent::EntryFailed { symbol, .. }
            | LifecycleEvent::SecondaryFailed { symbol, .. }
            | LifecycleEvent::PositionOpened { symbol, .. }
            | LifecycleEvent::PositionAveraged { symbol, .. }
            | LifecycleEvent::DynamicTpActivated { symbol, .. }
            | LifecycleEvent::EntryCancelled { symbol, .. }
            | LifecycleEvent::PositionClosed { symbol, .. }
            | LifecycleEvent::ResidualExposure { symbol, .. }
            | LifecycleEvent::InconsistentState { symbol, .. } => symbol,
        }
    }

    /// Needs operator attention
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::InconsistentState { .. } | LifecycleEvent::ResidualExposure { .. }
        )
    }

    /// One-line human readable form, used by chat sinks
    pub fn message(&self) -> String {
        match self {
            LifecycleEvent::EntryPlaced {
                symbol,
                case,
                role,
                price,
                quantity,
            } => match price {
                Some(p) => format!("📝 {} {} {} SELL {:.6} @ {:.6}", symbol, case, role, quantity, p),
                None => format!("📝 {} {} {} SELL {:.6} @ MARKET", symbol, case, role, quantity),
            },
            LifecycleEvent::EntryFailed { symbol, case, reason } => {
                format!("⚠️ {} {} entry failed: {}", symbol, case, reason)
            }
            LifecycleEvent::SecondaryFailed { symbol, reason } => {
                format!("⚠️ {} secondary entry failed, no averaging: {}", symbol, reason)
            }
            LifecycleEvent::PositionOpened {
                symbol,
                case,
                entry_price,
                quantity,
                take_profit,
                stop_loss,
            } => format!(
                "🔻 {} {} SHORT {:.6} @ {:.6} | TP {:.6} | SL {:.6}",
                symbol, case, quantity, entry_price, take_profit, stop_loss
            ),
            LifecycleEvent::PositionAveraged {
                symbol,
                average_entry_price,
                total_quantity,
            } => format!(
                "➕ {} averaged: {:.6} @ {:.6}",
                symbol, total_quantity, average_entry_price
            ),
            LifecycleEvent::DynamicTpActivated {
                symbol,
                take_profit,
                quantity,
            } => format!("🎯 {} take profit moved to {:.6} for {:.6}", symbol, take_profit, quantity),
            LifecycleEvent::EntryCancelled { symbol, case, price } => {
                format!("✖️ {} {} entry cancelled at {:.6}", symbol, case, price)
            }
            LifecycleEvent::PositionClosed {
                symbol,
                case,
                exit_reason,
                exit_price,
                net_pnl,
            } => {
                let icon = if *net_pnl > 0.0 { "✅" } else { "❌" };
                format!(
                    "{} {} {} closed by {} @ {:.6} | PnL {:+.4}",
                    icon,
                    symbol,
                    case,
                    exit_reason.as_str(),
                    exit_price,
                    net_pnl
                )
            }
            LifecycleEvent::ResidualExposure { symbol, quantity } => {
                format!("🚨 {} residual exposure {:.6}, flattening", symbol, quantity)
            }
            LifecycleEvent::InconsistentState { symbol, detail } => {
                format!("🚨 {} INCONSISTENT, entries blocked: {}", symbol, detail)
            }
        }
    }
}

/// Destination for lifecycle events
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &LifecycleEvent) -> Result<()>;
}

/// Writes every event to the structured log
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &LifecycleEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        if event.is_alert() {
            warn!(target: "lifecycle", "{}", payload);
        } else {
            info!(target: "lifecycle", "{}", payload);
        }
        Ok(())
    }
}

/// Sends event messages to a Telegram chat via the Bot API
pub struct TelegramSink {
    client: reqwest::Client,
    token: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Telegram HTTP client")?;
        Ok(Self {
            client,
            token: token.into(),
            chat_id: chat_id.into(),
        })
    }
}

#[async_trait]
impl EventSink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, event: &LifecycleEvent) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": event.message(),
            }))
            .send()
            .await
            .context("Telegram request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram API error {}: {}", status, body);
        }
        Ok(())
    }
}

/// Non-blocking publisher handle. Clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl EventBus {
    /// Create a bus whose events are handed to `sinks` by a spawned dispatcher
    pub fn spawn(sinks: Vec<Arc<dyn EventSink>>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    if let Err(e) = sink.deliver(&event).await {
                        error!("Event sink {} failed: {:#}", sink.name(), e);
                    }
                }
            }
            debug!("Event dispatcher stopped");
        });
        (Self { tx }, handle)
    }

    /// Bus backed by a plain channel, for callers that drain events themselves
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event dispatcher gone, event dropped");
        }
    }
}

/// Sinks enabled by the notification settings. The log sink is always on.
pub fn build_sinks(config: &NotificationConfig) -> Result<Vec<Arc<dyn EventSink>>> {
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];
    if config.telegram_enabled {
        match (&config.telegram_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) => {
                sinks.push(Arc::new(TelegramSink::new(token.clone(), chat_id.clone())?));
                info!("Telegram notifications enabled");
            }
            _ => warn!("Telegram enabled but token or chat id missing, skipping"),
        }
    }
    Ok(sinks)
}
