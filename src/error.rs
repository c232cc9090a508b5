use thiserror::Error;

/// Main error type for the position engine
#[derive(Error, Debug)]
pub enum PosguardError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    // Venue errors
    #[error("Venue rejected request ({status}): {message}")]
    VenueRejection { status: u16, message: String },

    #[error("No open orders to cancel")]
    NoOpenOrders,

    // Position state errors
    #[error("Lifecycle stream out of sync: {0}")]
    StreamDesync(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PosguardError {
    /// Errors the request gateway may retry after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            PosguardError::TransientNetwork(_)
            | PosguardError::RateLimited(_)
            | PosguardError::Timeout(_) => true,
            PosguardError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Cancel-all against an empty book. Treated as success by callers.
    pub fn is_no_open_orders(&self) -> bool {
        matches!(self, PosguardError::NoOpenOrders)
    }

    pub fn rejection(status: u16, message: impl Into<String>) -> Self {
        PosguardError::VenueRejection {
            status,
            message: message.into(),
        }
    }
}

/// Result type alias for PosguardError
pub type Result<T> = std::result::Result<T, PosguardError>;
