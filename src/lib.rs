//! Position reconciliation and shutdown liquidation for exchange trading bots.
//!
//! `PositionEngine` keeps a net position in sync with the venue from order
//! lifecycle events and REST snapshots, and on `stop` cancels every open
//! order and flattens whatever exposure remains.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod persistence;
pub mod services;

pub use config::AppConfig;
pub use coordination::{LiquidationOrchestrator, LiquidationPhase, LiquidationReport};
pub use domain::{
    EventKind, LifecycleEvent, LifecycleUpdate, LiquidationPlan, OrderAck, OrderSide, Position,
    PositionSide,
};
pub use engine::PositionEngine;
pub use error::{PosguardError, Result};
pub use exchange::{build_gateway, ExchangeKind, Gateway, LifecycleStream};
pub use ledger::{LedgerHandle, PositionLedger};
pub use persistence::{AuditRecord, CsvOrderHistory, OrderHistory};
