use std::sync::Arc;

use axum::extract::{FromRequest, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::db::{CoordinationConnectionInfo, ValkeyConnectionInfo};
use crate::error::{Error, ErrorDetails};
use crate::generator::{MockResponseConfig, MockResponseGenerator};
use crate::rate_limiting::config::ConfigResolver;
use crate::rate_limiting::{AdmissionEngine, ApiKey};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub coordination: CoordinationConnectionInfo,
    pub engine: Arc<AdmissionEngine>,
    pub generator: Arc<MockResponseGenerator>,
    /// Bounds in-flight admission requests; over-ceiling arrivals are
    /// rejected before any coordination-store round trip.
    pub inflight: Arc<Semaphore>,
}

pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    /// Production construction: connect to the coordination store with the
    /// startup retry budget.
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let valkey = ValkeyConnectionInfo::new_with_retries(&config.coordination_url).await?;
        Ok(Self::with_coordination(
            config,
            CoordinationConnectionInfo::Valkey(valkey),
        ))
    }

    pub fn with_coordination(
        config: Arc<Config>,
        coordination: CoordinationConnectionInfo,
    ) -> Self {
        let resolver = Arc::new(ConfigResolver::new(
            config.overrides.clone(),
            config.ceiling,
        ));
        let engine = Arc::new(AdmissionEngine::new(
            coordination.clone(),
            resolver,
            config.window_seconds,
        ));
        let inflight = Arc::new(Semaphore::new(config.max_inflight));
        Self {
            config,
            coordination,
            engine,
            generator: Arc::new(MockResponseGenerator::new(MockResponseConfig::default())),
            inflight,
        }
    }
}

/// Rejects over-ceiling arrivals with 503 before they touch the
/// coordination store. The permit is held for the request's lifetime.
pub async fn inflight_limit(
    State(state): AppState,
    request: Request,
    next: Next,
) -> Response {
    match state.inflight.clone().try_acquire_owned() {
        Ok(_permit) => next.run(request).await,
        Err(_) => Error::new(ErrorDetails::Overloaded).into_response(),
    }
}

/// Bearer credential extractor.
///
/// 401 when the `Authorization` header is absent, not a Bearer scheme, or
/// carries a key that fails the shape rules.
#[derive(Debug)]
pub struct BearerApiKey(pub ApiKey);

impl<S> FromRequestParts<S> for BearerApiKey
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .ok_or_else(|| {
                Error::new(ErrorDetails::Unauthorized {
                    message: "Missing Authorization header".to_string(),
                })
            })?
            .to_str()
            .map_err(|_| {
                Error::new(ErrorDetails::Unauthorized {
                    message: "Authorization header is not valid UTF-8".to_string(),
                })
            })?;
        let key = header.trim().strip_prefix("Bearer ").ok_or_else(|| {
            Error::new(ErrorDetails::Unauthorized {
                message: "Authorization header must use the Bearer scheme".to_string(),
            })
        })?;
        Ok(BearerApiKey(ApiKey::new(key)?))
    }
}

/// A JSON extractor that reports the path to the offending field on
/// deserialization failures, instead of serde's bare message.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        // Retrieve the request body as Bytes before deserializing it
        let bytes = bytes::Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}
