use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::{LifecycleUpdate, OrderAck, OrderSide, Position};
use crate::error::{PosguardError, Result};

/// Ordered, unbounded lifecycle subscription for one instrument
pub type LifecycleStream = BoxStream<'static, Result<LifecycleUpdate>>;

/// Supported venues. Config spells them `bitflyer` / `gmo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Bitflyer,
    Gmo,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Bitflyer => "bitflyer",
            Self::Gmo => "gmo",
        })
    }
}

impl FromStr for ExchangeKind {
    type Err = PosguardError;

    /// Accepts the config spelling plus the short `bf` and `gmocoin` aliases.
    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bitflyer" | "bf" => Ok(Self::Bitflyer),
            "gmo" | "gmocoin" => Ok(Self::Gmo),
            other => Err(PosguardError::Validation(format!(
                "unknown exchange '{}' (bitflyer, gmo)",
                other
            ))),
        }
    }
}

pub fn parse_exchange_kind(raw: &str) -> Result<ExchangeKind> {
    raw.parse()
}

/// Request gateway for one instrument on one venue.
///
/// Implementations retry transient failures internally; callers only see the
/// final success or a classified error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Gateway: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    /// Instrument (product code / symbol) this gateway trades
    fn instrument(&self) -> String;

    async fn market_order(&self, side: OrderSide, size: Decimal) -> Result<OrderAck>;

    /// Cancel every working order. `NoOpenOrders` means there was nothing to do.
    async fn cancel_all_orders(&self) -> Result<()>;

    /// Authoritative position snapshot from REST
    async fn fetch_position(&self) -> Result<Position>;

    /// Market order that reduces the position. Venues that keep two-way
    /// positions override this with their settle endpoint.
    async fn close_position_market(&self, side: OrderSide, size: Decimal) -> Result<OrderAck> {
        self.market_order(side, size).await
    }

    /// Every open exposure, one entry per side the venue keeps open.
    ///
    /// Net-position venues hold at most one side, so the default is the
    /// non-flat net position. Venues with two-way books report each side on
    /// its own so shutdown can settle both.
    async fn fetch_open_positions(&self) -> Result<Vec<Position>> {
        let position = self.fetch_position().await?;
        Ok(if position.is_flat() {
            Vec::new()
        } else {
            vec![position]
        })
    }

    async fn fetch_open_order_ids(&self) -> Result<Vec<String>> {
        Err(unsupported(self.kind(), "open order lookup"))
    }

    async fn subscribe_lifecycle_events(&self) -> Result<LifecycleStream> {
        Err(unsupported(self.kind(), "lifecycle stream"))
    }
}

fn unsupported(exchange: ExchangeKind, feature: &str) -> PosguardError {
    PosguardError::Validation(format!("{} has no {}", exchange, feature))
}
