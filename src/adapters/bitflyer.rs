//! bitFlyer Lightning REST binding
//!
//! Private endpoints are signed with `ACCESS-KEY` / `ACCESS-TIMESTAMP` /
//! `ACCESS-SIGN`, where the signature is HMAC-SHA256 over
//! `timestamp + method + path(?query) + body`.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::bitflyer_ws::{BitflyerStream, StreamSettings};
use super::notify::Notifier;
use super::rest::{
    header_value, hmac_sha256_hex, ApiCredentials, RequestSigner, RestClient, RestSettings,
    SignInput,
};
use crate::domain::{OrderAck, OrderSide, Position, PositionSide};
use crate::error::{PosguardError, Result};
use crate::exchange::{ExchangeKind, Gateway, LifecycleStream};

pub const DEFAULT_REST_URL: &str = "https://api.bitflyer.com";

/// `ACCESS-*` header signer
pub struct BitflyerSigner;

impl BitflyerSigner {
    fn payload(timestamp: &str, input: &SignInput<'_>) -> String {
        let path = match input.query {
            Some(q) => format!("{}?{}", input.path, q),
            None => input.path.to_string(),
        };
        format!("{}{}{}{}", timestamp, input.method.as_str(), path, input.body)
    }
}

impl RequestSigner for BitflyerSigner {
    fn sign(&self, credentials: &ApiCredentials, input: &SignInput<'_>) -> Result<HeaderMap> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = hmac_sha256_hex(&credentials.api_secret, &Self::payload(&timestamp, input))?;

        let mut headers = HeaderMap::new();
        headers.insert("ACCESS-KEY", header_value(&credentials.api_key)?);
        headers.insert("ACCESS-TIMESTAMP", header_value(&timestamp)?);
        headers.insert("ACCESS-SIGN", header_value(&signature)?);
        Ok(headers)
    }
}

#[derive(Debug, Serialize)]
struct ChildOrderRequest<'a> {
    product_code: &'a str,
    child_order_type: &'a str,
    side: OrderSide,
    #[serde(with = "rust_decimal::serde::float")]
    size: Decimal,
}

#[derive(Debug, Serialize)]
struct ProductRequest<'a> {
    product_code: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChildOrderAccepted {
    child_order_acceptance_id: String,
}

#[derive(Debug, Deserialize)]
struct PositionEntry {
    side: String,
    size: Decimal,
}

#[derive(Debug, Deserialize)]
struct ChildOrderEntry {
    child_order_acceptance_id: String,
}

/// Sum the per-lot entries of `getpositions` into one net position.
///
/// bitFlyer keeps one-way positions, so every entry shares a side.
fn parse_positions(body: &str) -> Result<Position> {
    let entries: Vec<PositionEntry> = serde_json::from_str(body)?;
    let first = match entries.first() {
        Some(first) => first,
        None => return Ok(Position::flat()),
    };

    let side = OrderSide::parse(&first.side).ok_or_else(|| {
        PosguardError::Internal(format!("unexpected position side '{}'", first.side))
    })?;
    let size: Decimal = entries.iter().map(|e| e.size).sum();

    Position::new(PositionSide::from(side), size)
}

fn parse_acceptance(body: &str) -> Result<OrderAck> {
    let accepted: ChildOrderAccepted = serde_json::from_str(body)?;
    Ok(OrderAck::new(accepted.child_order_acceptance_id))
}

fn parse_active_orders(body: &str) -> Result<Vec<String>> {
    let orders: Vec<ChildOrderEntry> = serde_json::from_str(body)?;
    Ok(orders
        .into_iter()
        .map(|o| o.child_order_acceptance_id)
        .collect())
}

pub struct BitflyerGateway {
    product_code: String,
    rest: RestClient,
    stream: Option<StreamSettings>,
}

impl BitflyerGateway {
    pub fn new(
        product_code: impl Into<String>,
        rest_url: &str,
        credentials: Vec<ApiCredentials>,
        settings: RestSettings,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Self> {
        let rest = RestClient::new(
            "bitflyer",
            rest_url,
            credentials,
            Box::new(BitflyerSigner),
            settings,
        )?
        .with_notifier(notifier);

        Ok(Self {
            product_code: product_code.into(),
            rest,
            stream: None,
        })
    }

    /// Enable `subscribe_lifecycle_events` over the realtime API
    pub fn with_stream(mut self, settings: StreamSettings) -> Self {
        self.stream = Some(settings);
        self
    }
}

#[async_trait]
impl Gateway for BitflyerGateway {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Bitflyer
    }

    fn instrument(&self) -> String {
        self.product_code.clone()
    }

    async fn market_order(&self, side: OrderSide, size: Decimal) -> Result<OrderAck> {
        let request = ChildOrderRequest {
            product_code: &self.product_code,
            child_order_type: "MARKET",
            side,
            size,
        };
        let body = self
            .rest
            .post("/v1/me/sendchildorder", &serde_json::to_value(&request)?)
            .await?;
        let ack = parse_acceptance(&body)?;
        info!("Market {} {} accepted: {}", side, size, ack.order_id);
        Ok(ack)
    }

    async fn cancel_all_orders(&self) -> Result<()> {
        let request = ProductRequest {
            product_code: &self.product_code,
        };
        self.rest
            .post("/v1/me/cancelallchildorders", &serde_json::to_value(&request)?)
            .await?;
        debug!("Cancel-all sent for {}", self.product_code);
        Ok(())
    }

    async fn fetch_position(&self) -> Result<Position> {
        let body = self
            .rest
            .get(
                "/v1/me/getpositions",
                &[("product_code", self.product_code.clone())],
            )
            .await?;
        parse_positions(&body)
    }

    async fn fetch_open_order_ids(&self) -> Result<Vec<String>> {
        let body = self
            .rest
            .get(
                "/v1/me/getchildorders",
                &[
                    ("product_code", self.product_code.clone()),
                    ("child_order_state", "ACTIVE".to_string()),
                ],
            )
            .await?;
        parse_active_orders(&body)
    }

    async fn subscribe_lifecycle_events(&self) -> Result<LifecycleStream> {
        let settings = self.stream.clone().ok_or_else(|| {
            PosguardError::Validation("bitflyer realtime stream is not configured".to_string())
        })?;
        Ok(BitflyerStream::new(settings, self.product_code.clone()).spawn())
    }
}
