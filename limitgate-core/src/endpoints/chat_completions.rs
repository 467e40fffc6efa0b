//! Chat completions endpoint handler.
//!
//! The single admission path: extract the Bearer key, estimate costs, run
//! the atomic admission, dispatch the mock generator on admit, reconcile
//! the booked output estimate against the sampled count, and answer with an
//! OpenAI-shaped completion.

use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::{now_seconds, AdmissionDecision};
use crate::tokens;
use crate::utils::gateway::{AppState, AppStateData, BearerApiKey, StructuredJson};

/// Output estimate booked when the request does not carry `max_tokens`, and
/// the cap applied on top of it when it does.
pub const DEFAULT_MAX_OUT: u64 = 150;

const MAX_TOKENS_CEILING: u32 = 4096;

/// Upper bound on the mock generator dispatch.
const GENERATOR_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatCompletionParams {
    #[serde(default = "default_model")]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: CompletionUsage,
}

fn validate(params: &ChatCompletionParams) -> Result<(), Error> {
    if params.messages.is_empty() {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "`messages` must contain at least one message".to_string(),
        }));
    }
    if let Some(max_tokens) = params.max_tokens {
        if max_tokens == 0 || max_tokens > MAX_TOKENS_CEILING {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!("`max_tokens` must be between 1 and {MAX_TOKENS_CEILING}"),
            }));
        }
    }
    if let Some(temperature) = params.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: "`temperature` must be between 0.0 and 2.0".to_string(),
            }));
        }
    }
    if params.stream {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "Streaming responses are not supported; omit `stream` or set it to false"
                .to_string(),
        }));
    }
    Ok(())
}

pub async fn chat_completions_handler(
    State(state): AppState,
    BearerApiKey(api_key): BearerApiKey,
    StructuredJson(params): StructuredJson<ChatCompletionParams>,
) -> Result<Response, Error> {
    validate(&params)?;

    let est_in = tokens::count_input(&params.messages);
    // The generator may emit up to the caller's `max_tokens`; the booked
    // estimate is additionally capped so one pessimistic request cannot
    // blank out a whole window. The difference reconciles after generation.
    let request_cap = params.max_tokens.map(u64::from).unwrap_or(DEFAULT_MAX_OUT);
    let est_out = request_cap.min(DEFAULT_MAX_OUT);

    let decision = state
        .engine
        .admit(&api_key, est_in, est_out, now_seconds())
        .await?;

    let (event_id, committed_output_estimate) = match decision {
        AdmissionDecision::Denied {
            dimension,
            retry_after_seconds,
        } => {
            metrics::counter!("limitgate_denials_total", "dimension" => dimension.as_str())
                .increment(1);
            return Err(Error::new(ErrorDetails::RateLimited {
                dimension,
                retry_after_seconds,
            }));
        }
        AdmissionDecision::Admitted {
            event_id,
            committed_output_estimate,
            ..
        } => (event_id, committed_output_estimate),
    };

    let completion = run_generator(&state, params, request_cap).await?;

    let actual_out = completion.usage.completion_tokens;
    if actual_out != committed_output_estimate {
        state
            .engine
            .reconcile(&api_key, event_id, committed_output_estimate, actual_out)
            .await;
    }

    metrics::counter!("limitgate_admissions_total").increment(1);

    let request_id = completion.id.clone();
    let mut response = Json(completion).into_response();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    Ok(response)
}

/// The generator is synchronous CPU-bound work of bounded duration; run it
/// on the blocking pool so it cannot starve the I/O loop, and bound it.
async fn run_generator(
    state: &AppStateData,
    params: ChatCompletionParams,
    request_cap: u64,
) -> Result<ChatCompletion, Error> {
    let generator = state.generator.clone();
    let task = tokio::task::spawn_blocking(move || generator.generate(&params, request_cap));
    timeout(GENERATOR_TIMEOUT, task)
        .await
        .map_err(|_| {
            Error::new(ErrorDetails::GeneratorFailed {
                message: "Response generation timed out".to_string(),
            })
        })?
        .map_err(|e| {
            Error::new(ErrorDetails::GeneratorFailed {
                message: format!("Response generation panicked: {e}"),
            })
        })
}
