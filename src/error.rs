//! Error types for the DealScan engine
//!
//! - `thiserror` for the error hierarchy
//! - Provider failures carry enough detail to decide retry vs. skip vs. abort
//! - HTTP status code mapping for the status API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;

/// Result type alias for DealScan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the DealScan engine
#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("Configuration error: {message}")]
    Config {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig {
        key: &'static str,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // Provider Errors
    // ========================================================================
    #[error("Provider transient failure (status {status:?}): {message}")]
    ProviderTransient {
        message: Cow<'static, str>,
        status: Option<u16>,
    },

    #[error("Provider rate limited, retry after {retry_after_ms:?}ms")]
    ProviderRateLimited { retry_after_ms: Option<u64> },

    #[error("Provider rejected credentials: {message}")]
    ProviderAuth { message: Cow<'static, str> },

    #[error("Provider rejected request: {message}")]
    ProviderBadRequest { message: Cow<'static, str> },

    #[error("Malformed provider response for category {category_id}: {message}")]
    MalformedResponse {
        category_id: u64,
        message: Cow<'static, str>,
    },

    #[error("Request budget exhausted for category {category_id} after {attempts} attempts")]
    BudgetExhausted { category_id: u64, attempts: u32 },

    // ========================================================================
    // Persistence Errors
    // ========================================================================
    #[error("Database error: {message}")]
    Database {
        message: Cow<'static, str>,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("Migration error: {0}")]
    Migration(String),

    // ========================================================================
    // Publisher Errors
    // ========================================================================
    #[error("Publishing deal {deal_id} failed: {message}")]
    Publish {
        deal_id: String,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // Generic Errors
    // ========================================================================
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    // ========================================================================
    // Constructors for common error patterns
    // ========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient provider error
    pub fn transient(message: impl Into<Cow<'static, str>>, status: Option<u16>) -> Self {
        Self::ProviderTransient {
            message: message.into(),
            status,
        }
    }

    /// Create a malformed response error for a category
    pub fn malformed(category_id: u64, message: impl Into<Cow<'static, str>>) -> Self {
        Self::MalformedResponse {
            category_id,
            message: message.into(),
        }
    }

    /// Create a publisher error
    pub fn publish(deal_id: impl Into<String>, message: impl Into<Cow<'static, str>>) -> Self {
        Self::Publish {
            deal_id: deal_id.into(),
            message: message.into(),
        }
    }

    // ========================================================================
    // Error Classification
    // ========================================================================

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ProviderTransient { .. }
            | Error::ProviderRateLimited { .. }
            | Error::Timeout { .. }
            | Error::Database { .. } => true,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Returns true if this error must stop the scheduler
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProviderAuth { .. }
                | Error::Config { .. }
                | Error::MissingEnvVar { .. }
                | Error::InvalidConfig { .. }
        )
    }

    /// Extra backoff factor applied on top of the exponential delay
    pub fn retry_multiplier(&self, rate_limited: u32) -> u32 {
        match self {
            Error::ProviderRateLimited { .. } => rate_limited.max(1),
            _ => 1,
        }
    }

    /// Returns true if this error should be logged at error level
    pub fn is_error_level(&self) -> bool {
        matches!(
            self,
            Error::ProviderAuth { .. }
                | Error::Database { .. }
                | Error::Migration(_)
                | Error::Config { .. }
                | Error::InvalidConfig { .. }
        )
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ProviderRateLimited { .. } | Error::BudgetExhausted { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Error::ProviderTransient { .. } | Error::MalformedResponse { .. } | Error::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Database { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error code for API responses and log fields
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } | Error::MissingEnvVar { .. } | Error::InvalidConfig { .. } => {
                "CONFIG_ERROR"
            }
            Error::ProviderTransient { .. } | Error::Http(_) => "PROVIDER_TRANSIENT",
            Error::ProviderRateLimited { .. } => "PROVIDER_RATE_LIMITED",
            Error::ProviderAuth { .. } => "PROVIDER_AUTH",
            Error::ProviderBadRequest { .. } => "PROVIDER_BAD_REQUEST",
            Error::MalformedResponse { .. } => "MALFORMED_RESPONSE",
            Error::BudgetExhausted { .. } => "BUDGET_EXHAUSTED",
            Error::Database { .. } | Error::Migration(_) => "DATABASE_ERROR",
            Error::Publish { .. } => "PUBLISH_ERROR",
            Error::Json(_) => "SERIALIZATION_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Io(_) | Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// Error Response for API
// ============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        // Don't expose internal error details
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let retry_after = match &self {
            Error::ProviderRateLimited { retry_after_ms } => retry_after_ms.map(|ms| ms / 1000),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code,
                message,
                retry_after,
            },
        };

        (status, Json(body)).into_response()
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database {
            message: err.to_string().into(),
            source: Some(err),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Migration(err.to_string())
    }
}
