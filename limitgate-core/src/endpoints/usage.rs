//! Read-only usage view: the current non-expired sums for one key's three
//! counters, plus the key's resolved limits. Never mutates a counter.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::rate_limiting::ApiKey;
use crate::utils::gateway::{AppState, BearerApiKey};

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct UsageResponse {
    pub input_tokens_used: u64,
    pub input_tpm_limit: u64,
    pub output_tokens_used: u64,
    pub output_tpm_limit: u64,
    pub requests_used: u64,
    pub rpm_limit: u64,
    pub window_seconds: u64,
}

pub async fn usage_handler(
    State(state): AppState,
    BearerApiKey(_caller): BearerApiKey,
    Path(api_key): Path<String>,
) -> Result<Json<UsageResponse>, Error> {
    let api_key = ApiKey::new(&api_key)?;
    let config = state.engine.resolve_config(&api_key);
    let usage = state.engine.usage(&api_key).await?;
    Ok(Json(UsageResponse {
        input_tokens_used: usage.input_tokens_used,
        input_tpm_limit: config.input_tpm,
        output_tokens_used: usage.output_tokens_used,
        output_tpm_limit: config.output_tpm,
        requests_used: usage.requests_used,
        rpm_limit: config.rpm,
        window_seconds: state.engine.window_seconds(),
    }))
}
