//! Status notifications (Discord webhook or LINE Notify)
//!
//! A `Notifier` is injected into the gateway and the liquidation
//! orchestrator. Delivery failures are reported to the caller, who logs them;
//! a failed notification never stops trading or shutdown.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::NotifyConfig;
use crate::error::{PosguardError, Result};

const LINE_NOTIFY_URL: &str = "https://notify-api.line.me/api/notify";

/// Upper bound on one delivery; notifications sit on the shutdown path
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Send and log, swallowing delivery errors. Gives up after `NOTIFY_TIMEOUT`.
pub async fn notify_best_effort(notifier: Option<&Arc<dyn Notifier>>, message: &str) {
    if let Some(notifier) = notifier {
        match tokio::time::timeout(NOTIFY_TIMEOUT, notifier.notify(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to send status notification: {}", e),
            Err(_) => warn!(
                "Status notification timed out after {:?}",
                NOTIFY_TIMEOUT
            ),
        }
    }
}

fn notify_client() -> Client {
    Client::builder()
        .timeout(NOTIFY_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Build the configured notifier. Discord wins when both are set.
pub fn notifier_from_config(config: &NotifyConfig) -> Option<Arc<dyn Notifier>> {
    if let Some(url) = config.discord_webhook.as_deref().filter(|u| !u.is_empty()) {
        info!("Discord notifications enabled");
        return Some(Arc::new(DiscordNotifier::new(url.to_string())));
    }
    if let Some(token) = config.line_notify_token.as_deref().filter(|t| !t.is_empty()) {
        info!("LINE notifications enabled");
        return Some(Arc::new(LineNotifier::new(token.to_string())));
    }
    None
}

/// Discord webhook client
#[derive(Clone)]
pub struct DiscordNotifier {
    client: Client,
    webhook_url: String,
}

#[derive(Serialize)]
struct DiscordMessage<'a> {
    content: &'a str,
}

impl DiscordNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: notify_client(),
            webhook_url,
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&DiscordMessage { content: message })
            .send()
            .await?;

        if resp.status().is_success() {
            debug!("Discord notification sent");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(PosguardError::Internal(format!(
                "Discord webhook HTTP {}: {}",
                status, body
            )))
        }
    }
}

/// LINE Notify client
#[derive(Clone)]
pub struct LineNotifier {
    client: Client,
    token: String,
}

impl LineNotifier {
    pub fn new(token: String) -> Self {
        Self {
            client: notify_client(),
            token,
        }
    }
}

#[async_trait]
impl Notifier for LineNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let resp = self
            .client
            .post(LINE_NOTIFY_URL)
            .bearer_auth(&self.token)
            .form(&[("message", message)])
            .send()
            .await?;

        if resp.status().is_success() {
            debug!("LINE notification sent");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(PosguardError::Internal(format!(
                "LINE notify HTTP {}: {}",
                status, body
            )))
        }
    }
}
