//! Position Ledger
//!
//! Single-writer owner of the net position and the outstanding order set.
//! - `LedgerState`: the pure state machine (netting + order bookkeeping)
//! - `PositionLedger`: actor task that serializes every mutation
//! - `LedgerHandle`: clonable handle; readers get immutable snapshots

pub mod handle;
pub mod outstanding;
pub mod state;

pub use handle::{LedgerHandle, PositionLedger};
pub use outstanding::OutstandingOrders;
pub use state::{ApplyOutcome, LedgerState};
