//! Signed REST core shared by the venue clients.
//!
//! Handles credential rotation, request signing, HTTP status classification
//! and retry. Venue clients only build paths/bodies and decode payloads.

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::notify::{notify_best_effort, Notifier};
use super::retry::{with_retry_if, RetryConfig};
use crate::error::{PosguardError, Result};

/// API key pair for one account key
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// What a signer sees of an outgoing request
pub struct SignInput<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub body: &'a str,
}

/// Venue-specific authentication headers
pub trait RequestSigner: Send + Sync {
    fn sign(&self, credentials: &ApiCredentials, input: &SignInput<'_>) -> Result<HeaderMap>;
}

/// Round-robin over the configured keys so rate limits spread across them
#[derive(Debug)]
pub struct CredentialRing {
    keys: Vec<ApiCredentials>,
    cursor: AtomicUsize,
}

impl CredentialRing {
    pub fn new(keys: Vec<ApiCredentials>) -> Result<Self> {
        if keys.is_empty() {
            return Err(PosguardError::Auth(
                "at least one API key is required".to_string(),
            ));
        }
        Ok(Self {
            keys,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn next(&self) -> &ApiCredentials {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        &self.keys[idx]
    }
}

/// Request timeout and retry settings
#[derive(Debug, Clone)]
pub struct RestSettings {
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

pub struct RestClient {
    http: Client,
    venue: &'static str,
    base_url: String,
    credentials: CredentialRing,
    signer: Box<dyn RequestSigner>,
    retry: RetryConfig,
    notifier: Option<Arc<dyn Notifier>>,
}

impl RestClient {
    pub fn new(
        venue: &'static str,
        base_url: &str,
        credentials: Vec<ApiCredentials>,
        signer: Box<dyn RequestSigner>,
        settings: RestSettings,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent("posguard/0.1")
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| {
                PosguardError::Internal(format!("failed to build {} HTTP client: {}", venue, e))
            })?;

        Ok(Self {
            http,
            venue,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: CredentialRing::new(credentials)?,
            signer,
            retry: settings.retry,
            notifier: None,
        })
    }

    /// Attach a notifier that hears about terminal HTTP failures
    pub fn with_notifier(mut self, notifier: Option<Arc<dyn Notifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        self.request(Method::GET, path, query, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<String> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    /// Signed request with retry; returns the raw body of a 2xx response.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<String> {
        let query = encode_query(query);
        let body = match body {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };

        let result = with_retry_if(
            &self.retry,
            || self.send_once(&method, path, query.as_deref(), &body),
            |e| retry_safe(&method, e),
        )
        .await;

        if let Err(e) = &result {
            if !e.is_no_open_orders() {
                notify_best_effort(
                    self.notifier.as_ref(),
                    &format!("[{}] {} {} failed: {}", self.venue, method, path, e),
                )
                .await;
            }
        }

        result
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        body: &str,
    ) -> Result<String> {
        let credentials = self.credentials.next();
        let headers = self.signer.sign(
            credentials,
            &SignInput {
                method,
                path,
                query,
                body,
            },
        )?;

        let url = match query {
            Some(q) => format!("{}{}?{}", self.base_url, path, q),
            None => format!("{}{}", self.base_url, path),
        };

        let mut request = self.http.request(method.clone(), &url).headers(headers);
        if !body.is_empty() {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        debug!("{} {} {}", self.venue, method, path);

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport_error)?;

        classify_status(status, text)
    }
}

fn encode_query(query: &[(&str, String)]) -> Option<String> {
    if query.is_empty() {
        return None;
    }
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in query {
        serializer.append_pair(key, value);
    }
    Some(serializer.finish())
}

fn classify_transport_error(e: reqwest::Error) -> PosguardError {
    if e.is_connect() {
        PosguardError::TransientNetwork(e.to_string())
    } else if e.is_timeout() {
        PosguardError::Timeout(e.to_string())
    } else {
        PosguardError::Http(e)
    }
}

/// Map an HTTP status onto the gateway error kinds.
pub(crate) fn classify_status(status: StatusCode, body: String) -> Result<String> {
    if status.is_success() {
        return Ok(body);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!("429 Too Many Requests");
        return Err(PosguardError::RateLimited(body));
    }

    if status.is_server_error() {
        return Err(PosguardError::rejection(
            status.as_u16(),
            format!("Internal Server Error {}", body),
        ));
    }

    Err(PosguardError::rejection(status.as_u16(), body))
}

/// Rate limits and refused connections never reached the matching engine,
/// so they are safe to resend. A timed-out POST may have been accepted and
/// is only retried for reads.
fn retry_safe(method: &Method, err: &PosguardError) -> bool {
    match err {
        PosguardError::RateLimited(_) | PosguardError::TransientNetwork(_) => true,
        PosguardError::Timeout(_) => *method == Method::GET,
        _ => false,
    }
}

pub(crate) fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw)
        .map_err(|e| PosguardError::Auth(format!("invalid header value: {}", e)))
}

/// HMAC-SHA256 hex digest used by both venues
pub(crate) fn hmac_sha256_hex(secret: &str, payload: &str) -> Result<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| PosguardError::Auth(format!("invalid API secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_ring_rotates() {
        let ring = CredentialRing::new(vec![
            ApiCredentials::new("k1", "s1"),
            ApiCredentials::new("k2", "s2"),
        ])
        .unwrap();

        let keys: Vec<String> = (0..4).map(|_| ring.next().api_key.clone()).collect();
        assert_eq!(keys, vec!["k1", "k2", "k1", "k2"]);
    }

    #[test]
    fn test_credential_ring_requires_key() {
        assert!(matches!(
            CredentialRing::new(Vec::new()),
            Err(PosguardError::Auth(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = ApiCredentials::new("key", "very-secret");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("key"));
        assert!(!printed.contains("very-secret"));
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(StatusCode::OK, "{}".to_string()).unwrap(),
            "{}"
        );
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            Err(PosguardError::RateLimited(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad".to_string()),
            Err(PosguardError::VenueRejection { status: 400, .. })
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            Err(PosguardError::VenueRejection { status: 502, .. })
        ));
    }

    #[test]
    fn test_retry_safety() {
        assert!(retry_safe(&Method::POST, &PosguardError::RateLimited(String::new())));
        assert!(retry_safe(&Method::GET, &PosguardError::Timeout(String::new())));
        assert!(!retry_safe(&Method::POST, &PosguardError::Timeout(String::new())));
        assert!(!retry_safe(&Method::POST, &PosguardError::rejection(400, "")));
    }

    #[test]
    fn test_encode_query() {
        assert_eq!(encode_query(&[]), None);
        assert_eq!(
            encode_query(&[("product_code", "FX_BTC_JPY".to_string()), ("count", "10".to_string())]),
            Some("product_code=FX_BTC_JPY&count=10".to_string())
        );
    }

    #[test]
    fn test_hmac_is_hex() {
        let sig = hmac_sha256_hex("secret", "payload").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
