//! GMO Coin private REST binding
//!
//! Responses arrive in a `{status, data, messages}` envelope; a non-zero
//! status is a venue rejection even when HTTP says 200. Positions are kept
//! two-way per symbol: the ledger sees BUY minus SELL, while shutdown settles
//! each side on its own through `closeBulkOrder`.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::notify::Notifier;
use super::rest::{
    header_value, hmac_sha256_hex, ApiCredentials, RequestSigner, RestClient, RestSettings,
    SignInput,
};
use crate::domain::{OrderAck, OrderSide, Position};
use crate::error::{PosguardError, Result};
use crate::exchange::{ExchangeKind, Gateway};

pub const DEFAULT_REST_URL: &str = "https://api.coin.z.com/private";

/// Returned by cancel endpoints when there is nothing left to cancel
const NO_ORDERS_CODES: &[&str] = &["ERR-5122"];

/// `API-*` header signer. Paths are signed without the `/private` prefix.
pub struct GmoSigner;

impl GmoSigner {
    fn payload(timestamp: &str, input: &SignInput<'_>) -> String {
        format!(
            "{}{}{}{}",
            timestamp,
            input.method.as_str(),
            input.path,
            input.body
        )
    }
}

impl RequestSigner for GmoSigner {
    fn sign(&self, credentials: &ApiCredentials, input: &SignInput<'_>) -> Result<HeaderMap> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = hmac_sha256_hex(&credentials.api_secret, &Self::payload(&timestamp, input))?;

        let mut headers = HeaderMap::new();
        headers.insert("API-KEY", header_value(&credentials.api_key)?);
        headers.insert("API-TIMESTAMP", header_value(&timestamp)?);
        headers.insert("API-SIGN", header_value(&signature)?);
        Ok(headers)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: i64,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    messages: Vec<EnvelopeMessage>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeMessage {
    #[serde(default)]
    message_code: String,
    #[serde(default)]
    message_string: String,
}

/// Unwrap the envelope into `data`, classifying non-zero statuses.
fn unwrap_envelope<T: DeserializeOwned>(body: &str) -> Result<T> {
    let envelope: Envelope = serde_json::from_str(body)?;

    if envelope.status != 0 {
        if envelope
            .messages
            .iter()
            .any(|m| NO_ORDERS_CODES.contains(&m.message_code.as_str()))
        {
            return Err(PosguardError::NoOpenOrders);
        }
        let message = envelope
            .messages
            .first()
            .map(|m| format!("{} {}", m.message_code, m.message_string))
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(PosguardError::rejection(
            u16::try_from(envelope.status).unwrap_or(u16::MAX),
            message,
        ));
    }

    Ok(serde_json::from_value(envelope.data.unwrap_or(Value::Null))?)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarketOrderRequest<'a> {
    symbol: &'a str,
    side: OrderSide,
    execution_type: &'a str,
    size: Decimal,
}

#[derive(Debug, Serialize)]
struct CancelBulkRequest<'a> {
    symbols: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

impl<T> Default for Listing<T> {
    fn default() -> Self {
        Self { list: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionSummary {
    side: String,
    sum_position_quantity: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveOrder {
    order_id: Value,
}

/// One exposure per non-empty side of `positionSummary`.
fn parse_position_sides(body: &str) -> Result<Vec<Position>> {
    let summary: Option<Listing<PositionSummary>> = unwrap_envelope(body)?;
    summary
        .unwrap_or_default()
        .list
        .into_iter()
        .filter(|entry| !entry.sum_position_quantity.is_zero())
        .map(|entry| match OrderSide::parse(&entry.side) {
            Some(OrderSide::Buy) => Position::long(entry.sum_position_quantity),
            Some(OrderSide::Sell) => Position::short(entry.sum_position_quantity),
            None => Err(PosguardError::Internal(format!(
                "unexpected position side '{}'",
                entry.side
            ))),
        })
        .collect()
}

/// Net the per-side summaries: BUY quantity minus SELL quantity.
fn parse_position_summary(body: &str) -> Result<Position> {
    let sides = parse_position_sides(body)?;
    Ok(Position::from_signed(
        sides.iter().map(Position::signed).sum(),
    ))
}

fn parse_order_id(body: &str) -> Result<OrderAck> {
    let id: Value = unwrap_envelope(body)?;
    match id {
        Value::String(s) => Ok(OrderAck::new(s)),
        Value::Number(n) => Ok(OrderAck::new(n.to_string())),
        other => Err(PosguardError::Internal(format!(
            "unexpected order id payload: {}",
            other
        ))),
    }
}

fn parse_active_orders(body: &str) -> Result<Vec<String>> {
    let orders: Option<Listing<ActiveOrder>> = unwrap_envelope(body)?;
    Ok(orders
        .unwrap_or_default()
        .list
        .into_iter()
        .map(|o| match o.order_id {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect())
}

pub struct GmoGateway {
    symbol: String,
    rest: RestClient,
}

impl GmoGateway {
    pub fn new(
        symbol: impl Into<String>,
        rest_url: &str,
        credentials: Vec<ApiCredentials>,
        settings: RestSettings,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Self> {
        let rest = RestClient::new("gmo", rest_url, credentials, Box::new(GmoSigner), settings)?
            .with_notifier(notifier);
        Ok(Self {
            symbol: symbol.into(),
            rest,
        })
    }

    async fn submit_market(&self, path: &str, side: OrderSide, size: Decimal) -> Result<OrderAck> {
        let request = MarketOrderRequest {
            symbol: &self.symbol,
            side,
            execution_type: "MARKET",
            size,
        };
        let body = self.rest.post(path, &serde_json::to_value(&request)?).await?;
        let ack = parse_order_id(&body)?;
        info!("{} {} {} accepted: {}", path, side, size, ack.order_id);
        Ok(ack)
    }
}

#[async_trait]
impl Gateway for GmoGateway {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Gmo
    }

    fn instrument(&self) -> String {
        self.symbol.clone()
    }

    async fn market_order(&self, side: OrderSide, size: Decimal) -> Result<OrderAck> {
        self.submit_market("/v1/order", side, size).await
    }

    async fn close_position_market(&self, side: OrderSide, size: Decimal) -> Result<OrderAck> {
        self.submit_market("/v1/closeBulkOrder", side, size).await
    }

    async fn cancel_all_orders(&self) -> Result<()> {
        let request = CancelBulkRequest {
            symbols: [&self.symbol],
        };
        let body = self
            .rest
            .post("/v1/cancelBulkOrder", &serde_json::to_value(&request)?)
            .await?;
        let cancelled: Option<Vec<Value>> = unwrap_envelope(&body)?;
        match cancelled {
            Some(ids) if !ids.is_empty() => {
                debug!("Cancelled {} orders on {}", ids.len(), self.symbol);
                Ok(())
            }
            _ => Err(PosguardError::NoOpenOrders),
        }
    }

    async fn fetch_position(&self) -> Result<Position> {
        let body = self
            .rest
            .get("/v1/positionSummary", &[("symbol", self.symbol.clone())])
            .await?;
        parse_position_summary(&body)
    }

    async fn fetch_open_positions(&self) -> Result<Vec<Position>> {
        let body = self
            .rest
            .get("/v1/positionSummary", &[("symbol", self.symbol.clone())])
            .await?;
        parse_position_sides(&body)
    }

    async fn fetch_open_order_ids(&self) -> Result<Vec<String>> {
        let body = self
            .rest
            .get(
                "/v1/activeOrders",
                &[
                    ("symbol", self.symbol.clone()),
                    ("page", "1".to_string()),
                    ("count", "100".to_string()),
                ],
            )
            .await?;
        parse_active_orders(&body)
    }
}
