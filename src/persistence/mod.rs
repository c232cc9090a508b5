//! Persistence layer
//!
//! Audit trail of liquidation orders written at shutdown.

pub mod order_history;

pub use order_history::{
    AuditRecord, CsvOrderHistory, MemoryOrderHistory, OrderHistory, LIQUIDATION_KIND,
};
