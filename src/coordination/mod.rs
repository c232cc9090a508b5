//! Shutdown coordination
//!
//! The liquidation sequence that flattens exposure before the process exits.

pub mod liquidation;

pub use liquidation::{LiquidationOrchestrator, LiquidationPhase, LiquidationReport};
