use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderSide;

/// Order lifecycle transition reported by the venue stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Order accepted and resting
    Order,
    /// Order (partially) filled
    Execution,
    /// Order rejected at submission
    OrderFailed,
    /// Order cancelled
    Cancel,
    /// Cancel request rejected; the order is no longer live either way
    CancelFailed,
    /// Order expired
    Expire,
    /// Event type the engine does not know about
    Unknown(String),
}

impl EventKind {
    /// Parse the venue spelling (`ORDER`, `ORDER_FAILED`, ...)
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ORDER" => EventKind::Order,
            "EXECUTION" => EventKind::Execution,
            "ORDER_FAILED" => EventKind::OrderFailed,
            "CANCEL" => EventKind::Cancel,
            "CANCEL_FAILED" => EventKind::CancelFailed,
            "EXPIRE" => EventKind::Expire,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    /// Kinds after which the order is no longer considered live
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::OrderFailed | EventKind::Cancel | EventKind::CancelFailed | EventKind::Expire
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Order => write!(f, "ORDER"),
            EventKind::Execution => write!(f, "EXECUTION"),
            EventKind::OrderFailed => write!(f, "ORDER_FAILED"),
            EventKind::Cancel => write!(f, "CANCEL"),
            EventKind::CancelFailed => write!(f, "CANCEL_FAILED"),
            EventKind::Expire => write!(f, "EXPIRE"),
            EventKind::Unknown(raw) => write!(f, "UNKNOWN({})", raw),
        }
    }
}

/// One message from the order lifecycle stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub acceptance_id: String,
    pub kind: EventKind,
    pub side: Option<OrderSide>,
    pub size: Option<Decimal>,
    pub price: Option<Decimal>,
    pub product_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(acceptance_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            acceptance_id: acceptance_id.into(),
            kind,
            side: None,
            size: None,
            price: None,
            product_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn order(acceptance_id: impl Into<String>, side: OrderSide, size: Decimal) -> Self {
        Self {
            side: Some(side),
            size: Some(size),
            ..Self::new(acceptance_id, EventKind::Order)
        }
    }

    pub fn execution(acceptance_id: impl Into<String>, side: OrderSide, size: Decimal) -> Self {
        Self {
            side: Some(side),
            size: Some(size),
            ..Self::new(acceptance_id, EventKind::Execution)
        }
    }

    pub fn cancel(acceptance_id: impl Into<String>) -> Self {
        Self::new(acceptance_id, EventKind::Cancel)
    }
}

/// Item yielded by a lifecycle subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleUpdate {
    Event(LifecycleEvent),
    /// The subscription reconnected; events in the gap are lost
    Resubscribed,
}
