//! Anthropic-compatible service module
//!
//! HTTP endpoints compatible with the Anthropic Messages API, backed by the
//! upstream translation pipeline.
//!
//! # Endpoints
//! - `GET /v1/models` - list available models
//! - `POST /v1/messages` - create a message (streaming and non-streaming)
//! - `POST /v1/messages/count_tokens` - estimate a request's token count

mod converter;
mod handlers;
pub mod lifecycle;
mod middleware;
mod router;
pub mod sse;
pub mod stream;
pub mod types;
pub mod validator;

pub use router::create_router_with_provider;
