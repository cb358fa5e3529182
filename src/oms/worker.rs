//! Single-owner task per symbol
//!
//! Each worker owns one [`SymbolBook`] and processes its events strictly in
//! arrival order. Commands emitted by the book are executed against the
//! backend before the next event is taken, so a fill can never interleave
//! with a half-applied transition.
//!
//! Entry placement is a single attempt; protective orders, flattening and
//! cancels are retried with backoff on transient errors.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::book::{Command, Outcome, SymbolBook};
use super::position::Position;
use super::types::{CancelOutcome, FillEvent, OrderId, OrderRequest, OrderRole, PlacedOrder};
use crate::backend::TradingBackend;
use crate::common::{retry_with_backoff, RetryPolicy};
use crate::error::{AdmissionError, BackendError};
use crate::notify::EventBus;
use crate::state_manager::StateStore;
use crate::strategy::EntryProposal;
use crate::Symbol;

pub enum SymbolEvent {
    Propose {
        proposal: Box<EntryProposal>,
        reply: oneshot::Sender<Result<(), AdmissionError>>,
    },
    Fill(FillEvent),
    Price {
        price: f64,
        at: DateTime<Utc>,
    },
    Snapshot(oneshot::Sender<BookSnapshot>),
    /// The backend finished a sync; its fills were queued before this
    Synced,
    /// Position left open by an earlier session
    Restore(Box<Position>),
}

#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub symbol: Symbol,
    pub position: Option<Position>,
    pub inconsistent: bool,
}

/// Shared collaborators of every worker
#[derive(Clone)]
pub struct WorkerContext {
    pub backend: Arc<dyn TradingBackend>,
    pub bus: EventBus,
    pub store: Option<Arc<dyn StateStore>>,
    pub retry: RetryPolicy,
}

/// Cheap handle to a running worker
#[derive(Clone)]
pub struct SymbolHandle {
    symbol: Symbol,
    tx: mpsc::Sender<SymbolEvent>,
    active: Arc<AtomicBool>,
    inconsistent: Arc<AtomicBool>,
}

impl SymbolHandle {
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// A non-terminal position exists
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue an event; false once the worker is gone
    pub async fn send(&self, event: SymbolEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub async fn propose(&self, proposal: EntryProposal) -> Result<(), AdmissionError> {
        let (reply, rx) = oneshot::channel();
        let event = SymbolEvent::Propose {
            proposal: Box::new(proposal),
            reply,
        };
        if !self.send(event).await {
            return Err(AdmissionError::WorkerGone);
        }
        rx.await.map_err(|_| AdmissionError::WorkerGone)?
    }

    /// Round trip through the queue: everything sent before is processed
    pub async fn snapshot(&self) -> Option<BookSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(SymbolEvent::Snapshot(reply)).await {
            return None;
        }
        rx.await.ok()
    }
}

pub fn spawn_worker(
    symbol: Symbol,
    ctx: WorkerContext,
    queue: usize,
) -> (SymbolHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue.max(1));
    let active = Arc::new(AtomicBool::new(false));
    let inconsistent = Arc::new(AtomicBool::new(false));

    let worker = SymbolWorker {
        book: SymbolBook::new(symbol.clone()),
        ctx,
        active: active.clone(),
        inconsistent: inconsistent.clone(),
    };
    let handle = tokio::spawn(worker.run(rx));

    (
        SymbolHandle {
            symbol,
            tx,
            active,
            inconsistent,
        },
        handle,
    )
}

struct SymbolWorker {
    book: SymbolBook,
    ctx: WorkerContext,
    active: Arc<AtomicBool>,
    inconsistent: Arc<AtomicBool>,
}

impl SymbolWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<SymbolEvent>) {
        debug!("[{}] worker started", self.book.symbol());
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
            self.publish_flags();
        }
        debug!("[{}] worker stopped", self.book.symbol());
    }

    async fn handle(&mut self, event: SymbolEvent) {
        match event {
            SymbolEvent::Propose { proposal, reply } => {
                let result = match self.book.admit(&proposal, Utc::now()) {
                    Ok(outcome) => match self.apply(outcome).await {
                        Some(e) => Err(AdmissionError::EntryFailed(e)),
                        None => Ok(()),
                    },
                    Err(e) => Err(e),
                };
                self.publish_flags();
                // Caller may have given up waiting
                let _ = reply.send(result);
            }
            SymbolEvent::Fill(fill) => {
                let outcome = self.book.on_fill(&fill);
                self.apply(outcome).await;
            }
            SymbolEvent::Price { price, at } => {
                let outcome = self.book.on_price(price, at);
                self.apply(outcome).await;
            }
            SymbolEvent::Synced => {
                let outcome = self.book.on_synced();
                self.apply(outcome).await;
            }
            SymbolEvent::Restore(position) => {
                let working = self.book.restore(*position, Utc::now());
                for order_id in &working {
                    self.ctx
                        .backend
                        .watch_order(self.book.symbol(), order_id)
                        .await;
                }
            }
            SymbolEvent::Snapshot(reply) => {
                let _ = reply.send(BookSnapshot {
                    symbol: self.book.symbol().clone(),
                    position: self.book.position().cloned(),
                    inconsistent: self.book.is_inconsistent(),
                });
            }
        }
    }

    fn publish_flags(&self) {
        self.active.store(self.book.is_active(), Ordering::SeqCst);
        self.inconsistent
            .store(self.book.is_inconsistent(), Ordering::SeqCst);
    }

    /// Run the outcome's commands and everything they lead to.
    /// Returns the primary entry error, if the primary could not be placed.
    async fn apply(&mut self, outcome: Outcome) -> Option<BackendError> {
        let mut queue = VecDeque::new();
        let mut primary_error = None;
        self.absorb(outcome, &mut queue);

        while let Some(command) = queue.pop_front() {
            let outcome = match command {
                Command::Place(request) => match self.place(&request).await {
                    Ok(placed) => self.book.on_placed(&request, placed, Utc::now()),
                    Err(e) => {
                        if request.role == OrderRole::Primary {
                            primary_error = Some(e.clone());
                        }
                        self.book.on_place_failed(&request, &e)
                    }
                },
                Command::Cancel { order_id, role } => match self.cancel(&order_id).await {
                    Ok(result) => self.book.on_cancel_result(&order_id, result),
                    Err(e) => {
                        error!(
                            "[{}] cancel of {} order {} failed: {}",
                            self.book.symbol(),
                            role,
                            order_id,
                            e
                        );
                        self.book.on_cancel_failed(&order_id, &e)
                    }
                },
            };
            self.absorb(outcome, &mut queue);
        }
        primary_error
    }

    fn absorb(&self, outcome: Outcome, queue: &mut VecDeque<Command>) {
        queue.extend(outcome.commands);
        for event in outcome.events {
            self.ctx.bus.publish(event);
        }

        let Some(store) = &self.ctx.store else {
            return;
        };
        if let Some(record) = &outcome.closed {
            if let Err(e) = store.record_trade(record) {
                error!("[{}] failed to record trade: {:#}", self.book.symbol(), e);
            }
        }
        if outcome.changed {
            if let Some(position) = self.book.position() {
                if let Err(e) = store.save_position(position) {
                    warn!("[{}] failed to save position: {:#}", self.book.symbol(), e);
                }
            }
        }
    }

    async fn place(&self, request: &OrderRequest) -> Result<PlacedOrder, BackendError> {
        let backend = &self.ctx.backend;
        if request.role.is_entry() {
            return backend.place_order(request).await;
        }
        let what = format!("[{}] place {}", request.symbol, request.role);
        retry_with_backoff(&self.ctx.retry, &what, BackendError::is_retryable, || {
            backend.place_order(request)
        })
        .await
    }

    async fn cancel(&self, order_id: &OrderId) -> Result<CancelOutcome, BackendError> {
        let backend = &self.ctx.backend;
        let symbol = self.book.symbol();
        let what = format!("[{}] cancel {}", symbol, order_id);
        retry_with_backoff(&self.ctx.retry, &what, BackendError::is_retryable, || {
            backend.cancel_order(symbol, order_id)
        })
        .await
    }
}
