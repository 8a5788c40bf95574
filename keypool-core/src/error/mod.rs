use std::fmt::Display;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::bucket::KeyId;

pub const IMPOSSIBLE_ERROR_MESSAGE: &str =
    "This should never happen, please file a bug report against the keypool gateway";

#[derive(Clone, Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
#[error(transparent)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We arc `ErrorDetails` per the `clippy::result_large_err` lint, as well as to make it cloneable
pub struct Error(Arc<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Arc::new(details))
    }

    /// Builds an error without logging it.
    /// Used on hot paths where the caller recovers locally (lost reservation races,
    /// store timeouts that trigger the fallback) and logs the outcome itself.
    pub fn new_quiet(details: ErrorDetails) -> Self {
        Error(Arc::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        self.0.log_at_level(prefix, level);
    }

    pub fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }

    /// Whether the error means the bucket store could not be reached in time.
    /// The selector treats these as a signal to degrade to uniform-random selection.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self.get_details(),
            ErrorDetails::BucketStoreUnavailable { .. }
                | ErrorDetails::ValkeyConnection { .. }
                | ErrorDetails::ValkeyQuery { .. }
        )
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
pub enum ErrorDetails {
    AllKeysExhausted {
        sampled: usize,
    },
    BucketNotFound {
        key_id: KeyId,
    },
    BucketStoreUnavailable {
        message: String,
    },
    CacheReload {
        message: String,
    },
    Config {
        message: String,
    },
    InternalError {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    InvalidTierConfig {
        tier: String,
        message: String,
    },
    KeyRecordStoreUnavailable {
        message: String,
    },
    NoAvailableKey,
    Observability {
        message: String,
    },
    PostgresConnectionInitialization {
        message: String,
    },
    PostgresQuery {
        message: String,
    },
    RaceLost {
        key_id: KeyId,
        tokens_remaining: f64,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    Serialization {
        message: String,
    },
    ValkeyConnection {
        message: String,
    },
    ValkeyQuery {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AllKeysExhausted { .. } => tracing::Level::WARN,
            ErrorDetails::BucketNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::BucketStoreUnavailable { .. } => tracing::Level::WARN,
            ErrorDetails::CacheReload { .. } => tracing::Level::WARN,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidTierConfig { .. } => tracing::Level::WARN,
            ErrorDetails::KeyRecordStoreUnavailable { .. } => tracing::Level::ERROR,
            ErrorDetails::NoAvailableKey => tracing::Level::WARN,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresConnectionInitialization { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresQuery { .. } => tracing::Level::ERROR,
            ErrorDetails::RaceLost { .. } => tracing::Level::DEBUG,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::ValkeyConnection { .. } => tracing::Level::ERROR,
            ErrorDetails::ValkeyQuery { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AllKeysExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::BucketNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::BucketStoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::CacheReload { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::InvalidTierConfig { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::KeyRecordStoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::NoAvailableKey => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PostgresConnectionInitialization { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorDetails::PostgresQuery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::RaceLost { .. } => StatusCode::CONFLICT,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::ValkeyConnection { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::ValkeyQuery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        match level {
            tracing::Level::ERROR => tracing::error!("{prefix}{self}"),
            tracing::Level::WARN => tracing::warn!("{prefix}{self}"),
            tracing::Level::INFO => tracing::info!("{prefix}{self}"),
            tracing::Level::DEBUG => tracing::debug!("{prefix}{self}"),
            tracing::Level::TRACE => tracing::trace!("{prefix}{self}"),
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        self.log_at_level("", self.level());
    }

    pub fn is_retryable(&self) -> bool {
        match &self {
            ErrorDetails::NoAvailableKey => false,
            ErrorDetails::InvalidRequest { .. } => false,
            ErrorDetails::InvalidTierConfig { .. } => false,
            ErrorDetails::Config { .. } => false,
            _ => true,
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AllKeysExhausted { sampled } => {
                write!(
                    f,
                    "All {sampled} sampled keys are out of tokens and random fallback is disabled"
                )
            }
            ErrorDetails::BucketNotFound { key_id } => {
                write!(f, "No token bucket is tracked for key {key_id}")
            }
            ErrorDetails::BucketStoreUnavailable { message } => {
                write!(f, "Bucket store unavailable: {message}")
            }
            ErrorDetails::CacheReload { message } => {
                write!(f, "Failed to reload cache: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InternalError { message } => write!(f, "{message}"),
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::InvalidTierConfig { tier, message } => {
                write!(f, "Invalid configuration for tier `{tier}`: {message}")
            }
            ErrorDetails::KeyRecordStoreUnavailable { message } => {
                write!(f, "Key record store unavailable: {message}")
            }
            ErrorDetails::NoAvailableKey => write!(f, "No upstream key available"),
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::PostgresConnectionInitialization { message } => {
                write!(f, "Failed to initialize Postgres connection: {message}")
            }
            ErrorDetails::PostgresQuery { message } => {
                write!(f, "Postgres query failed: {message}")
            }
            ErrorDetails::RaceLost {
                key_id,
                tokens_remaining,
            } => {
                write!(
                    f,
                    "Lost reservation race for key {key_id} ({tokens_remaining} tokens remaining)"
                )
            }
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::ValkeyConnection { message } => {
                write!(f, "Valkey connection error: {message}")
            }
            ErrorDetails::ValkeyQuery { message } => write!(f, "Valkey query error: {message}"),
        }
    }
}

impl IntoResponse for Error {
    /// Convert the error into an Axum response
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.to_string(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorDetails::Serialization {
            message: err.to_string(),
        })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::new(ErrorDetails::PostgresQuery {
            message: err.to_string(),
        })
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::new(ErrorDetails::ValkeyQuery {
            message: err.to_string(),
        })
    }
}
