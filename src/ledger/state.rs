use tracing::{debug, warn};

use super::OutstandingOrders;
use crate::domain::{EventKind, LifecycleEvent, Position};
use crate::error::{PosguardError, Result};

/// What applying an event did to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Execution netted into the position
    PositionChanged { before: Position, after: Position },
    /// Order event; id now tracked as outstanding
    Tracked,
    /// Terminal event; `removed` is false when the id was not tracked
    Released { removed: bool },
    /// Unknown event kind, nothing changed
    Ignored,
}

/// Net position plus outstanding orders for one instrument
#[derive(Debug, Default, Clone)]
pub struct LedgerState {
    position: Position,
    outstanding: OutstandingOrders,
}

impl LedgerState {
    pub fn new(snapshot: Position) -> Self {
        Self {
            position: snapshot,
            outstanding: OutstandingOrders::new(),
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn outstanding(&self) -> &OutstandingOrders {
        &self.outstanding
    }

    /// Set the position from a REST snapshot and forget all tracked orders.
    pub fn initialize(&mut self, snapshot: Position) {
        self.position = snapshot;
        self.outstanding.clear();
    }

    /// Overwrite the position with a fresh REST snapshot, discarding drift.
    ///
    /// Outstanding orders are kept: the snapshot says nothing about them.
    pub fn reconcile(&mut self, snapshot: Position) -> Position {
        let previous = self.position;
        self.position = snapshot;
        previous
    }

    /// Apply one lifecycle event.
    ///
    /// Only executions move the position. A malformed execution (missing
    /// side/size or a negative size) is rejected with `StreamDesync` and
    /// leaves the state untouched.
    pub fn apply(&mut self, event: &LifecycleEvent) -> Result<ApplyOutcome> {
        match &event.kind {
            EventKind::Execution => {
                let (side, size) = match (event.side, event.size) {
                    (Some(side), Some(size)) => (side, size),
                    _ => {
                        return Err(PosguardError::StreamDesync(format!(
                            "execution {} missing side or size",
                            event.acceptance_id
                        )))
                    }
                };

                if size.is_sign_negative() && !size.is_zero() {
                    return Err(PosguardError::StreamDesync(format!(
                        "execution {} has negative size {}",
                        event.acceptance_id, size
                    )));
                }

                let before = self.position;
                let after = before.net(side, size);
                self.position = after;

                // A fill that nets to flat is taken as the order being done
                if after.is_flat() && !size.is_zero() {
                    self.outstanding.remove(&event.acceptance_id);
                }

                Ok(ApplyOutcome::PositionChanged { before, after })
            }
            EventKind::Order => {
                if !self.outstanding.insert(&event.acceptance_id) {
                    debug!("Order {} already tracked", event.acceptance_id);
                }
                Ok(ApplyOutcome::Tracked)
            }
            kind if kind.is_terminal() => {
                let removed = self.outstanding.remove(&event.acceptance_id);
                Ok(ApplyOutcome::Released { removed })
            }
            other => {
                warn!(
                    "Ignoring lifecycle event {} for order {}",
                    other, event.acceptance_id
                );
                Ok(ApplyOutcome::Ignored)
            }
        }
    }
}
