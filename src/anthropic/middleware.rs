//! Anthropic API middleware

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};

use crate::common::auth;
use crate::model::config::Config;
use crate::whisperer::provider::WhispererProvider;

use super::types::ErrorResponse;

/// Application shared state
#[derive(Clone)]
pub struct AppState {
    /// API key clients must present
    pub api_key: String,
    /// Upstream provider (absent in degraded configurations)
    pub provider: Option<Arc<WhispererProvider>>,
    /// Application configuration
    pub config: Config,
}

impl AppState {
    pub fn new(api_key: impl Into<String>, config: Config) -> Self {
        Self {
            api_key: api_key.into(),
            provider: None,
            config,
        }
    }

    pub fn with_provider(mut self, provider: WhispererProvider) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }
}

/// API key authentication middleware
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, &state.api_key) => next.run(request).await,
        _ => {
            let error = ErrorResponse::authentication_error();
            (StatusCode::UNAUTHORIZED, Json(error)).into_response()
        }
    }
}

/// CORS layer allowing any origin; the gateway is an API-only service
pub fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
