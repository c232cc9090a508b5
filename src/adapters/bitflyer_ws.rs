//! bitFlyer realtime API client for the private `child_order_events` channel
//!
//! The connection runs on its own task and feeds an mpsc channel that the
//! caller consumes as a [`LifecycleStream`]. Every successful subscription,
//! the first one included, yields [`LifecycleUpdate::Resubscribed`] so the
//! consumer can reconcile over the gap before it.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt as _};
use futures_util::SinkExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use super::rest::{hmac_sha256_hex, ApiCredentials};
use crate::domain::{EventKind, LifecycleEvent, LifecycleUpdate, OrderSide};
use crate::error::{PosguardError, Result};
use crate::exchange::LifecycleStream;

pub const DEFAULT_WS_URL: &str = "wss://ws.lightstream.bitflyer.com/json-rpc";
const CHANNEL: &str = "child_order_events";
const AUTH_REQUEST_ID: u64 = 1;
const BUFFER: usize = 1024;
const PREVIEW_BYTES: usize = 200;

/// Connection settings for the realtime stream
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub ws_url: String,
    pub credentials: ApiCredentials,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub auth_timeout: Duration,
}

impl StreamSettings {
    pub fn new(ws_url: impl Into<String>, credentials: ApiCredentials) -> Self {
        Self {
            ws_url: ws_url.into(),
            credentials,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: P,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct AuthParams {
    api_key: String,
    timestamp: i64,
    nonce: String,
    signature: String,
}

#[derive(Debug, Serialize)]
struct SubscribeParams<'a> {
    channel: &'a str,
}

#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<ChannelParams>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChannelParams {
    channel: String,
    message: Vec<ChildOrderEvent>,
}

#[derive(Debug, Deserialize)]
struct ChildOrderEvent {
    #[serde(default)]
    product_code: Option<String>,
    child_order_acceptance_id: String,
    event_type: String,
    #[serde(default)]
    event_date: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    size: Option<Decimal>,
    #[serde(default)]
    price: Option<Decimal>,
}

impl ChildOrderEvent {
    fn into_lifecycle(self) -> LifecycleEvent {
        let timestamp = self
            .event_date
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        LifecycleEvent {
            acceptance_id: self.child_order_acceptance_id,
            kind: EventKind::parse(&self.event_type),
            side: self.side.as_deref().and_then(OrderSide::parse),
            size: self.size,
            price: self.price,
            product_code: self.product_code,
            timestamp,
        }
    }
}

/// Auth frame payload: HMAC-SHA256(secret, timestamp + nonce)
fn auth_params(credentials: &ApiCredentials, timestamp: i64, nonce: String) -> Result<AuthParams> {
    let signature = hmac_sha256_hex(&credentials.api_secret, &format!("{}{}", timestamp, nonce))?;
    Ok(AuthParams {
        api_key: credentials.api_key.clone(),
        timestamp,
        nonce,
        signature,
    })
}

/// Extract the events for `product_code` from a `channelMessage` frame.
fn parse_channel_message(text: &str, product_code: &str) -> Option<Vec<LifecycleEvent>> {
    let msg: RpcMessage = serde_json::from_str(text).ok()?;
    if msg.method.as_deref() != Some("channelMessage") {
        return None;
    }
    let params = msg.params?;
    if params.channel != CHANNEL {
        return None;
    }

    Some(
        params
            .message
            .into_iter()
            .filter(|e| e.product_code.as_deref().map_or(true, |p| p == product_code))
            .map(ChildOrderEvent::into_lifecycle)
            .collect(),
    )
}

/// Wait for the reply to the auth request.
async fn await_auth<S>(read: &mut S) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = read.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            _ => continue,
        };
        let reply: RpcMessage = match serde_json::from_str(&text) {
            Ok(reply) => reply,
            Err(_) => continue,
        };
        if reply.id != Some(AUTH_REQUEST_ID) {
            continue;
        }
        if reply.error.is_none() && reply.result == Some(Value::Bool(true)) {
            return Ok(());
        }
        return Err(PosguardError::Auth(format!(
            "bitflyer realtime auth rejected: {}",
            reply.error.unwrap_or(Value::Null)
        )));
    }
    Err(PosguardError::TransientNetwork(
        "connection closed during auth".to_string(),
    ))
}

/// At most `PREVIEW_BYTES` of `text`, cut on a char boundary
fn frame_preview(text: &str) -> &str {
    if text.len() <= PREVIEW_BYTES {
        return text;
    }
    let mut end = PREVIEW_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

enum SessionEnd {
    Disconnected,
    ConsumerGone,
}

pub struct BitflyerStream {
    settings: StreamSettings,
    product_code: String,
}

impl BitflyerStream {
    pub fn new(settings: StreamSettings, product_code: String) -> Self {
        Self {
            settings,
            product_code,
        }
    }

    /// Start the connection task and hand back the consuming end.
    pub fn spawn(self) -> LifecycleStream {
        let (tx, rx) = mpsc::channel(BUFFER);
        tokio::spawn(async move { self.run(tx).await });

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    async fn run(self, tx: mpsc::Sender<Result<LifecycleUpdate>>) {
        let mut attempt: u32 = 0;

        loop {
            match self.connect_and_subscribe(&tx).await {
                Ok(SessionEnd::ConsumerGone) => {
                    debug!("Lifecycle consumer dropped; closing bitflyer stream");
                    return;
                }
                Ok(SessionEnd::Disconnected) => {
                    info!("bitflyer WebSocket closed, reconnecting...");
                    attempt = 0;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    error!("bitflyer WebSocket error (attempt {}): {}", attempt, e);
                    if tx.is_closed() {
                        return;
                    }

                    let delay = (self.settings.reconnect_delay * attempt)
                        .min(self.settings.max_reconnect_delay);
                    warn!("Reconnecting in {:?} (attempt {})", delay, attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect_and_subscribe(
        &self,
        tx: &mpsc::Sender<Result<LifecycleUpdate>>,
    ) -> Result<SessionEnd> {
        let url = Url::parse(&self.settings.ws_url)
            .map_err(|e| PosguardError::Internal(format!("Invalid WebSocket URL: {}", e)))?;

        info!("Connecting to WebSocket: {}", url);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let auth = RpcRequest {
            jsonrpc: "2.0",
            method: "auth",
            params: auth_params(
                &self.settings.credentials,
                Utc::now().timestamp_millis(),
                uuid::Uuid::new_v4().simple().to_string(),
            )?,
            id: Some(AUTH_REQUEST_ID),
        };
        write.send(Message::Text(serde_json::to_string(&auth)?)).await?;

        timeout(self.settings.auth_timeout, await_auth(&mut read))
            .await
            .map_err(|_| PosguardError::Timeout("bitflyer realtime auth".to_string()))??;

        let subscribe = RpcRequest {
            jsonrpc: "2.0",
            method: "subscribe",
            params: SubscribeParams { channel: CHANNEL },
            id: None,
        };
        write
            .send(Message::Text(serde_json::to_string(&subscribe)?))
            .await?;
        info!("Subscribed to {} for {}", CHANNEL, self.product_code);

        // Fills between the caller's snapshot (or the last session) and now were missed
        if tx.send(Ok(LifecycleUpdate::Resubscribed)).await.is_err() {
            return Ok(SessionEnd::ConsumerGone);
        }

        let mut ping_interval = interval(self.settings.ping_interval);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let events = match parse_channel_message(&text, &self.product_code) {
                                Some(events) => events,
                                None => {
                                    debug!("Ignoring WS frame: {}", frame_preview(&text));
                                    continue;
                                }
                            };
                            for event in events {
                                if tx.send(Ok(LifecycleUpdate::Event(event))).await.is_err() {
                                    return Ok(SessionEnd::ConsumerGone);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            return Err(e.into());
                        }
                        None => {
                            break;
                        }
                        _ => {}
                    }
                }
                _ = ping_interval.tick() => {
                    write.send(Message::Ping(vec![])).await?;
                    debug!("Sent ping");
                }
                _ = tx.closed() => {
                    return Ok(SessionEnd::ConsumerGone);
                }
            }
        }

        Ok(SessionEnd::Disconnected)
    }
}
