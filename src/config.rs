use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapters::rest::{ApiCredentials, RestSettings};
use crate::adapters::retry::RetryConfig;
use crate::exchange::ExchangeKind;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub venue: VenueConfig,
    /// API keys; requests rotate across them
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub liquidation: LiquidationConfig,
    #[serde(default)]
    pub order_history: OrderHistoryConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    /// `bitflyer` or `gmo`
    pub exchange: ExchangeKind,
    /// Product code / symbol (e.g. "FX_BTC_JPY", "BTC_JPY")
    pub instrument: String,
    /// Bot name used in log and order history file names
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    /// Override the venue REST base URL
    #[serde(default)]
    pub rest_url: Option<String>,
    /// Override the realtime stream URL
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Subscribe to the order lifecycle stream when the venue has one
    #[serde(default = "default_true")]
    pub stream: bool,
}

fn default_bot_name() -> String {
    "bot".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Deserialize)]
pub struct CredentialConfig {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retries after the first attempt for 429 / connection failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between retries
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn rest_settings(&self) -> RestSettings {
        RestSettings {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            retry: RetryConfig {
                max_retries: self.max_retries,
                backoff: Duration::from_millis(self.retry_backoff_ms),
            },
        }
    }
}

/// Shutdown liquidation tuning
#[derive(Debug, Clone, Deserialize)]
pub struct LiquidationConfig {
    /// Wait after the first cancel-all
    #[serde(default = "default_wait_ms")]
    pub first_wait_ms: u64,
    /// Wait after the second cancel-all
    #[serde(default = "default_wait_ms")]
    pub second_wait_ms: u64,
    /// Residuals below this are left alone
    #[serde(default = "default_minimum_order_quantity")]
    pub minimum_order_quantity: Decimal,
    /// Bound on the residual open-order lookup
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

fn default_wait_ms() -> u64 {
    5_000
}

fn default_minimum_order_quantity() -> Decimal {
    dec!(0.01)
}

fn default_lookup_timeout_ms() -> u64 {
    2_000
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            first_wait_ms: default_wait_ms(),
            second_wait_ms: default_wait_ms(),
            minimum_order_quantity: default_minimum_order_quantity(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl LiquidationConfig {
    pub fn first_wait(&self) -> Duration {
        Duration::from_millis(self.first_wait_ms)
    }

    pub fn second_wait(&self) -> Duration {
        Duration::from_millis(self.second_wait_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderHistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for `<exchange>_<bot>_order_history.csv`
    #[serde(default = "default_history_dir")]
    pub dir: PathBuf,
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for OrderHistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_history_dir(),
        }
    }
}

/// Discord is used when both are set
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub discord_webhook: Option<String>,
    #[serde(default)]
    pub line_notify_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Also write a daily-rotated `<exchange>_<bot>.log` here
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("venue.exchange", "bitflyer")?
            .set_default("venue.instrument", "FX_BTC_JPY")?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific file (e.g. config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("POSGUARD_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // POSGUARD_VENUE__INSTRUMENT, POSGUARD_LIQUIDATION__FIRST_WAIT_MS, ...
            .add_source(
                Environment::with_prefix("POSGUARD")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// In-code configuration for one venue and instrument
    pub fn for_venue(exchange: ExchangeKind, instrument: &str) -> Self {
        Self {
            venue: VenueConfig {
                exchange,
                instrument: instrument.to_string(),
                bot_name: default_bot_name(),
                rest_url: None,
                ws_url: None,
                stream: true,
            },
            credentials: Vec::new(),
            gateway: GatewayConfig::default(),
            liquidation: LiquidationConfig::default(),
            order_history: OrderHistoryConfig::default(),
            notify: NotifyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Configured keys plus `POSGUARD_API_KEY` / `POSGUARD_API_SECRET`
    pub fn api_credentials(&self) -> Vec<ApiCredentials> {
        self.credentials_with(
            std::env::var("POSGUARD_API_KEY").ok(),
            std::env::var("POSGUARD_API_SECRET").ok(),
        )
    }

    fn credentials_with(
        &self,
        env_key: Option<String>,
        env_secret: Option<String>,
    ) -> Vec<ApiCredentials> {
        let mut keys: Vec<ApiCredentials> = self
            .credentials
            .iter()
            .map(|c| ApiCredentials::new(c.api_key.clone(), c.api_secret.clone()))
            .collect();

        if let (Some(key), Some(secret)) = (env_key, env_secret) {
            if !key.is_empty() && !keys.iter().any(|k| k.api_key == key) {
                keys.push(ApiCredentials::new(key, secret));
            }
        }

        keys
    }

    /// `<exchange>_<bot>` prefix shared by log and history files
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.venue.exchange, self.venue.bot_name)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.venue.instrument.trim().is_empty() {
            errors.push("venue.instrument must not be empty".to_string());
        }

        if self.venue.bot_name.trim().is_empty() {
            errors.push("venue.bot_name must not be empty".to_string());
        }

        if self.api_credentials().is_empty() {
            errors.push(
                "no API credentials: set [[credentials]] or POSGUARD_API_KEY/POSGUARD_API_SECRET"
                    .to_string(),
            );
        }

        if self
            .credentials
            .iter()
            .any(|c| c.api_key.is_empty() || c.api_secret.is_empty())
        {
            errors.push("credentials entries need both api_key and api_secret".to_string());
        }

        if self.gateway.request_timeout_ms == 0 {
            errors.push("gateway.request_timeout_ms must be positive".to_string());
        }

        if self.liquidation.minimum_order_quantity <= Decimal::ZERO {
            errors.push("liquidation.minimum_order_quantity must be positive".to_string());
        }

        if self.liquidation.lookup_timeout_ms == 0 {
            errors.push("liquidation.lookup_timeout_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
