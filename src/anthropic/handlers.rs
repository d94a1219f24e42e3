//! Anthropic API handler functions
//!
//! The streaming handler owns the per-request pipeline: upstream bytes →
//! staging ring → frame decoder → event translation (+ tool lifecycle) →
//! validation → SSE sink.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json as JsonExtractor,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use serde_json::json;
use tokio::time::interval;
use uuid::Uuid;

use crate::model::config::Config;
use crate::whisperer::aggregator::FragmentAggregator;
use crate::whisperer::model::events::Event;
use crate::whisperer::parser::decoder::EventStreamDecoder;
use crate::whisperer::parser::ring::DEFAULT_RING_CAPACITY;
use crate::whisperer::provider::WhispererProvider;

use super::converter::{ConversionError, build_request_body, convert_request};
use super::middleware::AppState;
use super::sse::SseEvent;
use super::stream::{StreamContext, estimate_tokens, strip_control_chars};
use super::types::{
    CountTokensRequest, CountTokensResponse, ErrorResponse, MessagesRequest, Model, ModelsResponse,
    SystemMessage, Tool,
};
use super::validator::ResponseValidator;

/// Map an upstream failure onto an Anthropic-compatible error response
fn convert_upstream_error_to_response(error_message: &str) -> Response {
    let error_lower = error_message.to_lowercase();

    if error_lower.contains("credentials exhausted") {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse::new(
                "rate_limit_error",
                "All credentials exhausted. Please wait for quota reset or add new credentials.",
            )),
        )
            .into_response();
    }

    if error_lower.contains("content length")
        || error_lower.contains("too long")
        || error_lower.contains("context")
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("invalid_request_error", error_message)),
        )
            .into_response();
    }

    if error_lower.contains("rate limit") || error_lower.contains("throttl") {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse::new("rate_limit_error", error_message)),
        )
            .into_response();
    }

    if error_lower.contains("overload") || error_lower.contains("capacity") {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("overloaded_error", error_message)),
        )
            .into_response();
    }

    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorResponse::new(
            "api_error",
            format!("Upstream API call failed: {}", error_message),
        )),
    )
        .into_response()
}

/// GET /v1/models
pub async fn get_models() -> impl IntoResponse {
    tracing::info!("received GET /v1/models request");

    let models = vec![
        Model {
            id: "claude-sonnet-4-5-20250929".to_string(),
            object: "model".to_string(),
            created: 1727568000,
            owned_by: "anthropic".to_string(),
            display_name: "Claude Sonnet 4.5".to_string(),
            model_type: "chat".to_string(),
            max_tokens: 32000,
            context_length: Some(200_000),
        },
        Model {
            id: "claude-opus-4-5-20251101".to_string(),
            object: "model".to_string(),
            created: 1730419200,
            owned_by: "anthropic".to_string(),
            display_name: "Claude Opus 4.5".to_string(),
            model_type: "chat".to_string(),
            max_tokens: 32000,
            context_length: Some(200_000),
        },
        Model {
            id: "claude-haiku-4-5-20251001".to_string(),
            object: "model".to_string(),
            created: 1727740800,
            owned_by: "anthropic".to_string(),
            display_name: "Claude Haiku 4.5".to_string(),
            model_type: "chat".to_string(),
            max_tokens: 32000,
            context_length: Some(200_000),
        },
    ];

    Json(ModelsResponse {
        object: "list".to_string(),
        data: models,
    })
}

/// Estimate the input token count of a request
fn estimate_input_tokens(
    system: Option<&[SystemMessage]>,
    messages: &[super::types::Message],
    tools: Option<&[Tool]>,
) -> i32 {
    let mut total = 0;

    if let Some(system) = system {
        for msg in system {
            total += estimate_tokens(&msg.text);
        }
    }
    for msg in messages {
        let text = match &msg.content {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        };
        total += estimate_tokens(&text);
    }
    if let Some(tools) = tools {
        for tool in tools {
            total += estimate_tokens(&tool.name);
            total += estimate_tokens(&tool.description);
            total += estimate_tokens(&serde_json::to_string(&tool.input_schema).unwrap_or_default());
        }
    }

    total
}

/// POST /v1/messages
pub async fn post_messages(
    State(state): State<AppState>,
    JsonExtractor(payload): JsonExtractor<MessagesRequest>,
) -> Response {
    tracing::info!(
        model = %payload.model,
        max_tokens = %payload.max_tokens,
        stream = %payload.stream,
        message_count = %payload.messages.len(),
        "received POST /v1/messages request"
    );

    let Some(provider) = state.provider.clone() else {
        tracing::error!("upstream provider not configured");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new(
                "service_unavailable",
                "Upstream provider not configured",
            )),
        )
            .into_response();
    };

    let conversion_result = match convert_request(&payload) {
        Ok(result) => result,
        Err(e) => {
            let (error_type, message) = match &e {
                ConversionError::UnsupportedModel(model) => (
                    "invalid_request_error",
                    format!("Model not supported: {}", model),
                ),
                ConversionError::EmptyMessages => {
                    ("invalid_request_error", "Message list is empty".to_string())
                }
            };
            tracing::warn!("request conversion failed: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(error_type, message)),
            )
                .into_response();
        }
    };

    let request_body = match build_request_body(conversion_result.conversation_state, None) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("failed to serialize upstream request: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(
                    "internal_error",
                    format!("Failed to serialize request: {}", e),
                )),
            )
                .into_response();
        }
    };

    let max_body = state.config.max_request_body_bytes;
    if max_body > 0 && request_body.len() > max_body {
        tracing::warn!(
            request_body_bytes = request_body.len(),
            threshold = max_body,
            "request too large"
        );
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "invalid_request_error",
                "Input is too long for model context window.",
            )),
        )
            .into_response();
    }

    let input_tokens = estimate_input_tokens(
        payload.system.as_deref(),
        &payload.messages,
        payload.tools.as_deref(),
    );

    if payload.stream {
        handle_stream_request(
            provider,
            state.config.clone(),
            &request_body,
            &payload.model,
            input_tokens,
        )
        .await
    } else {
        handle_non_stream_request(
            provider,
            state.config.clone(),
            &request_body,
            &payload.model,
            input_tokens,
        )
        .await
    }
}

/// POST /v1/messages/count_tokens
pub async fn count_tokens(
    JsonExtractor(payload): JsonExtractor<CountTokensRequest>,
) -> impl IntoResponse {
    let input_tokens = estimate_input_tokens(
        payload.system.as_deref(),
        &payload.messages,
        payload.tools.as_deref(),
    );
    Json(CountTokensResponse { input_tokens })
}

/// Handle a streaming request
async fn handle_stream_request(
    provider: Arc<WhispererProvider>,
    config: Config,
    request_body: &str,
    model: &str,
    input_tokens: i32,
) -> Response {
    let response = match provider.call_api_stream(request_body).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!("upstream call failed: {}", e);
            return convert_upstream_error_to_response(&e.to_string());
        }
    };

    let mut ctx = StreamContext::new(model, input_tokens, config.incremental_tool_events);
    let mut validator = ResponseValidator::new(STREAM_TIMEOUT_THRESHOLD);
    let initial_events = ctx.generate_initial_events();
    let initial_bytes = render_events(initial_events, &mut validator);

    let stream = create_sse_stream(response, config, ctx, validator, initial_bytes);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Ping keepalive interval
const PING_INTERVAL_SECS: u64 = 25;

/// Inter-event gap the validator flags as a stall
const STREAM_TIMEOUT_THRESHOLD: Duration = Duration::from_secs(60);

fn create_ping_sse() -> Bytes {
    Bytes::from("event: ping\ndata: {\"type\": \"ping\"}\n\n")
}

/// Validate and serialize a batch of SSE events
fn render_events(
    events: Vec<SseEvent>,
    validator: &mut ResponseValidator,
) -> Vec<Result<Bytes, Infallible>> {
    events
        .into_iter()
        .map(|e| {
            validator.observe(&e);
            Ok(Bytes::from(e.to_sse_string()))
        })
        .collect()
}

/// Create the SSE event stream for one request.
///
/// Upstream chunks are decoded as they arrive; a ping keepalive fires every
/// 25 seconds and doubles as the fragment-expiry tick.
fn create_sse_stream(
    response: reqwest::Response,
    config: Config,
    ctx: StreamContext,
    validator: ResponseValidator,
    initial_bytes: Vec<Result<Bytes, Infallible>>,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    let initial_stream = stream::iter(initial_bytes);

    let decoder = EventStreamDecoder::with_config(
        config.strict_mode,
        config.max_errors,
        DEFAULT_RING_CAPACITY,
    );
    let buffer_expiry = config.buffer_expiry();
    let body_stream = response.bytes_stream();

    let processing_stream = stream::unfold(
        (
            body_stream,
            ctx,
            decoder,
            validator,
            false,
            interval(Duration::from_secs(PING_INTERVAL_SECS)),
        ),
        move |(mut body_stream, mut ctx, mut decoder, mut validator, finished, mut ping)| async move {
            if finished {
                return None;
            }

            tokio::select! {
                chunk_result = body_stream.next() => {
                    match chunk_result {
                        Some(Ok(chunk)) => {
                            let (frames, fatal) = decoder.parse(&chunk);

                            let mut events = Vec::new();
                            for frame in frames {
                                match Event::from_frame(frame) {
                                    Ok(event) => events.extend(ctx.process_event(&event)),
                                    Err(e) => tracing::warn!("failed to interpret frame: {}", e),
                                }
                            }

                            let done = if let Some(e) = fatal {
                                tracing::error!("stream decoding aborted: {}", e);
                                events.push(SseEvent::error(
                                    "api_error",
                                    &format!("upstream stream aborted: {}", e),
                                    None,
                                ));
                                events.extend(ctx.finalize());
                                true
                            } else {
                                false
                            };

                            let bytes = render_events(events, &mut validator);
                            Some((stream::iter(bytes), (body_stream, ctx, decoder, validator, done, ping)))
                        }
                        Some(Err(e)) => {
                            tracing::error!("failed to read upstream stream: {}", e);
                            let events = ctx.finalize();
                            let bytes = render_events(events, &mut validator);
                            Some((stream::iter(bytes), (body_stream, ctx, decoder, validator, true, ping)))
                        }
                        None => {
                            let events = ctx.finalize();
                            let bytes = render_events(events, &mut validator);
                            if validator.failed() {
                                tracing::error!(
                                    violations = validator.violation_count(),
                                    "stream completed with validation failures"
                                );
                            }
                            Some((stream::iter(bytes), (body_stream, ctx, decoder, validator, true, ping)))
                        }
                    }
                }
                _ = ping.tick() => {
                    // The keepalive tick doubles as the fragment-expiry sweep
                    let expiry_events = ctx.expire_tools(buffer_expiry);
                    let mut bytes = vec![Ok(create_ping_sse())];
                    bytes.extend(render_events(expiry_events, &mut validator));
                    Some((stream::iter(bytes), (body_stream, ctx, decoder, validator, false, ping)))
                }
            }
        },
    )
    .flatten();

    initial_stream.chain(processing_stream)
}

/// Handle a non-streaming request: decode the whole upstream stream, then
/// return a single message body.
async fn handle_non_stream_request(
    provider: Arc<WhispererProvider>,
    config: Config,
    request_body: &str,
    model: &str,
    input_tokens: i32,
) -> Response {
    let response = match provider.call_api_stream(request_body).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!("upstream call failed: {}", e);
            return convert_upstream_error_to_response(&e.to_string());
        }
    };

    let body_bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("failed to read upstream response: {}", e);
            return (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::new(
                    "api_error",
                    format!("Failed to read response: {}", e),
                )),
            )
                .into_response();
        }
    };

    let mut decoder = EventStreamDecoder::with_config(
        config.strict_mode,
        config.max_errors,
        DEFAULT_RING_CAPACITY,
    );
    let (frames, fatal) = decoder.parse(&body_bytes);
    if let Some(e) = fatal {
        tracing::error!("upstream response undecodable: {}", e);
    }

    let mut aggregator = FragmentAggregator::new();
    let mut text_content = String::new();
    let mut tool_uses: Vec<serde_json::Value> = Vec::new();
    let mut has_tool_use = false;
    let mut stop_reason = "end_turn".to_string();

    for frame in frames {
        let event = match Event::from_frame(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("failed to interpret frame: {}", e);
                continue;
            }
        };

        match event {
            Event::AssistantResponse(resp) => {
                text_content.push_str(&strip_control_chars(&resp.content));
            }
            Event::ToolUse(tool_use) => {
                has_tool_use = true;
                match aggregator.process(
                    &tool_use.tool_use_id,
                    &tool_use.name,
                    tool_use.input.as_bytes(),
                    tool_use.stop,
                    tool_use.fragment_index,
                ) {
                    Ok(Some(full_json)) => {
                        let input: serde_json::Value =
                            serde_json::from_str(&full_json).unwrap_or_else(|_| json!({}));
                        tool_uses.push(json!({
                            "type": "tool_use",
                            "id": tool_use.tool_use_id,
                            "name": tool_use.name,
                            "input": input
                        }));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("tool aggregation failed: {}", e);
                    }
                }
            }
            Event::Completion(completion) => {
                text_content.push_str(&strip_control_chars(&completion.completion));
            }
            Event::CompletionChunk(chunk) => {
                text_content.push_str(&strip_control_chars(&chunk.delta));
            }
            Event::Exception { exception_type, .. } => {
                if exception_type == "ContentLengthExceededException" {
                    stop_reason = "max_tokens".to_string();
                }
            }
            Event::Error {
                error_code,
                error_message,
            } => {
                tracing::error!(code = %error_code, "upstream error event: {}", error_message);
            }
            Event::Session { .. } | Event::Unknown => {}
        }
    }

    if has_tool_use && stop_reason == "end_turn" {
        stop_reason = "tool_use".to_string();
    }

    let mut content: Vec<serde_json::Value> = Vec::new();
    if !text_content.is_empty() {
        content.push(json!({ "type": "text", "text": text_content }));
    }
    content.extend(tool_uses);

    let output_tokens: i32 = content
        .iter()
        .map(|block| estimate_tokens(&block.to_string()))
        .sum();

    let response_body = json!({
        "id": format!("msg_{}", Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "content": content,
        "model": model,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens
        }
    });

    (StatusCode::OK, Json(response_body)).into_response()
}
