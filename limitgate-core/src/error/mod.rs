use std::fmt::{Debug, Display};
use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::rate_limiting::Dimension;

#[derive(Clone, Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
#[error(transparent)]
// The struct member is private so that callers must go through `new`,
// which logs the error exactly once at its variant's level.
pub struct Error(Arc<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Arc::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
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
    Config {
        message: String,
    },
    CoordinationUnavailable {
        message: String,
    },
    GeneratorFailed {
        message: String,
    },
    InternalError {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    Overloaded,
    RateLimited {
        dimension: Dimension,
        retry_after_seconds: u64,
    },
    Serialization {
        message: String,
    },
    Unauthorized {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the level at which this error is logged.
    /// `RateLimited` is an expected outcome and must never log at error level.
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::CoordinationUnavailable { .. } => tracing::Level::ERROR,
            ErrorDetails::GeneratorFailed { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::JsonRequest { .. } => tracing::Level::WARN,
            ErrorDetails::Overloaded => tracing::Level::WARN,
            ErrorDetails::RateLimited { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::Unauthorized { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::CoordinationUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::GeneratorFailed { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        }
    }

    /// Stable machine-readable error type for the response envelope
    fn error_type(&self) -> &'static str {
        match self {
            ErrorDetails::Config { .. } => "configuration_error",
            ErrorDetails::CoordinationUnavailable { .. } => "coordination_unavailable",
            ErrorDetails::GeneratorFailed { .. } => "generator_failed",
            ErrorDetails::InternalError { .. } => "internal_error",
            ErrorDetails::InvalidRequest { .. } => "invalid_request",
            ErrorDetails::JsonRequest { .. } => "invalid_request",
            ErrorDetails::Overloaded => "overloaded",
            ErrorDetails::RateLimited { .. } => "rate_limit_exceeded",
            ErrorDetails::Serialization { .. } => "internal_error",
            ErrorDetails::Unauthorized { .. } => "unauthorized",
        }
    }

    fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => {
                write!(f, "Configuration error: {message}")
            }
            ErrorDetails::CoordinationUnavailable { message } => {
                write!(f, "Coordination store unavailable: {message}")
            }
            ErrorDetails::GeneratorFailed { message } => {
                write!(f, "Response generator failed: {message}")
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::InvalidRequest { message } => {
                write!(f, "Invalid request: {message}")
            }
            ErrorDetails::JsonRequest { message } => {
                write!(f, "Failed to parse request body as JSON: {message}")
            }
            ErrorDetails::Overloaded => {
                write!(f, "Node is at its in-flight request ceiling")
            }
            ErrorDetails::RateLimited {
                dimension,
                retry_after_seconds,
            } => {
                write!(
                    f,
                    "Rate limit exceeded on {dimension}, retry after {retry_after_seconds}s"
                )
            }
            ErrorDetails::Serialization { message } => {
                write!(f, "Serialization error: {message}")
            }
            ErrorDetails::Unauthorized { message } => {
                write!(f, "Unauthorized: {message}")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = match self.get_details() {
            ErrorDetails::RateLimited {
                dimension,
                retry_after_seconds,
            } => json!({
                "error": {
                    "type": "rate_limit_exceeded",
                    "dimension": dimension,
                    "retry_after": retry_after_seconds,
                },
            }),
            details => json!({
                "error": {
                    "type": details.error_type(),
                    "message": self.to_string(),
                },
            }),
        };
        let mut response = (self.status_code(), Json(body)).into_response();
        if let ErrorDetails::RateLimited {
            retry_after_seconds,
            ..
        } = self.get_details()
        {
            if let Ok(value) = retry_after_seconds.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
