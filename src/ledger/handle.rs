//! Ledger actor and its handle
//!
//! The actor task owns `LedgerState`. Every mutation travels through an mpsc
//! mailbox, so `apply`, `reconcile` and `initialize` are serialized against
//! each other. The current position is published on a watch channel; readers
//! never touch the state directly.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ApplyOutcome, LedgerState};
use crate::domain::{LifecycleEvent, Position};
use crate::error::{PosguardError, Result};

const MAILBOX_CAPACITY: usize = 1024;

enum LedgerCommand {
    Initialize {
        snapshot: Position,
        reply: oneshot::Sender<()>,
    },
    Apply {
        event: LifecycleEvent,
        reply: oneshot::Sender<Result<ApplyOutcome>>,
    },
    Reconcile {
        snapshot: Position,
        reply: oneshot::Sender<Position>,
    },
    Outstanding {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Ledger actor; consumed by [`PositionLedger::spawn`]
pub struct PositionLedger {
    state: LedgerState,
    command_rx: mpsc::Receiver<LedgerCommand>,
    position_tx: watch::Sender<Position>,
}

impl PositionLedger {
    /// Start the actor task and return a handle to it.
    pub fn spawn(initial: Position) -> (LedgerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (position_tx, position_rx) = watch::channel(initial);

        let ledger = Self {
            state: LedgerState::new(initial),
            command_rx,
            position_tx,
        };
        let task = tokio::spawn(ledger.run());

        (
            LedgerHandle {
                command_tx,
                position_rx,
            },
            task,
        )
    }

    async fn run(mut self) {
        debug!("Position ledger started");

        while let Some(command) = self.command_rx.recv().await {
            match command {
                LedgerCommand::Initialize { snapshot, reply } => {
                    self.state.initialize(snapshot);
                    self.publish();
                    info!("Ledger initialized: {}", snapshot);
                    let _ = reply.send(());
                }
                LedgerCommand::Apply { event, reply } => {
                    let result = self.state.apply(&event);
                    if let Ok(ApplyOutcome::PositionChanged { before, after }) = &result {
                        debug!(
                            order = %event.acceptance_id,
                            "Position {} -> {}",
                            before,
                            after
                        );
                        self.publish();
                    }
                    let _ = reply.send(result);
                }
                LedgerCommand::Reconcile { snapshot, reply } => {
                    let previous = self.state.reconcile(snapshot);
                    if previous != snapshot {
                        warn!("Reconciled position drift: {} -> {}", previous, snapshot);
                    } else {
                        debug!("Reconciled position unchanged: {}", snapshot);
                    }
                    self.publish();
                    let _ = reply.send(previous);
                }
                LedgerCommand::Outstanding { reply } => {
                    let _ = reply.send(self.state.outstanding().ids());
                }
            }
        }

        debug!("Position ledger stopped");
    }

    fn publish(&self) {
        self.position_tx.send_replace(self.state.position());
    }
}

/// Clonable handle to the ledger actor
#[derive(Clone)]
pub struct LedgerHandle {
    command_tx: mpsc::Sender<LedgerCommand>,
    position_rx: watch::Receiver<Position>,
}

impl LedgerHandle {
    /// Immutable snapshot of the current position
    pub fn position(&self) -> Position {
        *self.position_rx.borrow()
    }

    /// Receiver that observes every published position
    pub fn subscribe(&self) -> watch::Receiver<Position> {
        self.position_rx.clone()
    }

    pub async fn initialize(&self, snapshot: Position) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerCommand::Initialize { snapshot, reply })
            .await?;
        rx.await.map_err(|_| closed())
    }

    pub async fn apply(&self, event: LifecycleEvent) -> Result<ApplyOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerCommand::Apply { event, reply }).await?;
        rx.await.map_err(|_| closed())?
    }

    /// Overwrite the position with a REST snapshot; returns the replaced value.
    pub async fn reconcile(&self, snapshot: Position) -> Result<Position> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerCommand::Reconcile { snapshot, reply })
            .await?;
        rx.await.map_err(|_| closed())
    }

    /// Acceptance ids currently considered live
    pub async fn outstanding(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerCommand::Outstanding { reply }).await?;
        rx.await.map_err(|_| closed())
    }

    async fn send(&self, command: LedgerCommand) -> Result<()> {
        self.command_tx.send(command).await.map_err(|_| closed())
    }
}

fn closed() -> PosguardError {
    PosguardError::Internal("position ledger channel closed".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderSide;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_apply_publishes_snapshot() {
        let (ledger, _task) = PositionLedger::spawn(Position::flat());
        let mut rx = ledger.subscribe();

        ledger
            .apply(LifecycleEvent::execution("A", OrderSide::Buy, dec!(3)))
            .await
            .unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Position::long(dec!(3)).unwrap());
        assert_eq!(ledger.position(), Position::long(dec!(3)).unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_writers_are_serialized() {
        let (ledger, _task) = PositionLedger::spawn(Position::flat());

        let mut tasks = Vec::new();
        for i in 0..50 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                ledger
                    .apply(LifecycleEvent::execution(
                        format!("B{}", i),
                        OrderSide::Buy,
                        dec!(0.1),
                    ))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(ledger.position(), Position::long(dec!(5)).unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_returns_previous() {
        let (ledger, _task) = PositionLedger::spawn(Position::long(dec!(1)).unwrap());
        let previous = ledger.reconcile(Position::flat()).await.unwrap();
        assert_eq!(previous, Position::long(dec!(1)).unwrap());
        assert!(ledger.position().is_flat());
    }

    #[tokio::test]
    async fn test_desync_error_reaches_caller() {
        let (ledger, _task) = PositionLedger::spawn(Position::flat());
        let mut event = LifecycleEvent::execution("A", OrderSide::Buy, dec!(1));
        event.side = None;

        let err = ledger.apply(event).await.unwrap_err();
        assert!(matches!(err, PosguardError::StreamDesync(_)));
    }
}
