//! Anthropic API routing configuration

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

use crate::model::config::Config;
use crate::whisperer::provider::WhispererProvider;

use super::{
    handlers::{count_tokens, get_models, post_messages},
    middleware::{AppState, auth_middleware, cors_layer},
};

/// Maximum request body size limit (50 MB)
const MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Create the Anthropic API router.
///
/// # Endpoints
/// - `GET /v1/models`
/// - `POST /v1/messages`
/// - `POST /v1/messages/count_tokens`
///
/// All `/v1` paths require API-key authentication via `x-api-key` or
/// `Authorization: Bearer`.
pub fn create_router_with_provider(
    api_key: impl Into<String>,
    provider: Option<WhispererProvider>,
    config: Config,
) -> Router {
    let mut state = AppState::new(api_key, config);
    if let Some(provider) = provider {
        state = state.with_provider(provider);
    }

    let v1_routes = Router::new()
        .route("/models", get(get_models))
        .route("/messages", post(post_messages))
        .route("/messages/count_tokens", post(count_tokens))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .nest("/v1", v1_routes)
        .layer(cors_layer())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}
