pub mod chat_completions;
pub mod models;
pub mod status;
pub mod usage;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::utils::gateway::{inflight_limit, AppStateData};

/// Build the full HTTP surface.
///
/// The in-flight cap wraps only the admission path: health, models, and
/// usage stay reachable while the node is saturated.
pub fn router(app_state: AppStateData) -> Router {
    let admission_routes = Router::new()
        .route(
            "/v1/chat/completions",
            post(chat_completions::chat_completions_handler),
        )
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            inflight_limit,
        ));

    Router::new()
        .merge(admission_routes)
        .route("/v1/models", get(models::models_handler))
        .route("/v1/usage/{api_key}", get(usage::usage_handler))
        .route("/health", get(status::health_handler))
        .with_state(app_state)
}
