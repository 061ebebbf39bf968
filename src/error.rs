//! Typed error taxonomy consumed by control flow (retry, bot status, HTTP
//! responses). Ambient `anyhow::Result` is still used for purely internal
//! I/O operations; these types exist wherever a caller needs to `match`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Errors the Exchange Client Adapter can return from `PlaceOrder` and any
/// other network-facing call. Only `Transient` is retried by the Executor.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ExchangeError {
    #[error("transient exchange error: {0}")]
    Transient(String),

    #[error("permanent exchange error: {0}")]
    Permanent(#[from] PermanentReason),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }
}

/// Reasons a `Permanent` exchange error can carry. Mirrors the classes
/// named in spec.md §4.1's failure model.
#[derive(Debug, thiserror::Error, Clone, Serialize)]
#[serde(tag = "reason", content = "detail")]
pub enum PermanentReason {
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("insufficient allowance")]
    InsufficientAllowance,
    #[error("market closed")]
    MarketClosed,
    #[error("no orderbook available")]
    NoOrderbook,
    #[error("order rejected: {0}")]
    Rejected(String),
}

/// Configuration-load-time validation failures. A bot whose config fails
/// validation is placed in `error` status and does not start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    MustBePositive { field: &'static str, value: f64 },

    #[error("proxy signature mode requires a funder_address")]
    MissingFunderAddress,

    #[error("trade_size_usd {0} is below the exchange minimum {1}")]
    BelowExchangeMinimum(f64, f64),

    #[error("io error reading/writing config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Structured error envelope returned by every state-changing control
/// surface endpoint, per spec.md §7 "User-visible failure behavior".
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn status(&self) -> StatusCode {
        match self.code {
            "not_found" => StatusCode::NOT_FOUND,
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "invalid_request" | "config_invalid" | "bot_running" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(self)).into_response()
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        ApiError::new("config_invalid", e.to_string())
    }
}
