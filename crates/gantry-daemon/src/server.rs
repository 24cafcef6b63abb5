//! HTTP dispatcher
//!
//! Routes `POST /v1/messages`, resolves the model to an upstream target,
//! drives the translator over the upstream stream, and writes either the
//! Anthropic SSE stream or the assembled JSON body. Owns the keep-alive ping
//! ticker and the request deadline.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use gantry_core::anthropic::{MessagesRequest, StopReason, StreamEvent};
use gantry_core::openai::StreamOptions;
use gantry_core::GatewayError;
use gantry_translator::adapters::AdapterRegistry;
use gantry_translator::sse::{SseItem, SseParser};
use gantry_translator::stream::StreamTranslator;
use gantry_translator::{assemble, normalize, request as request_builder};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::resolver::{HandlerKind, ModelResolver, UpstreamTarget};
use crate::upstream;

/// Cap on the total request deadline; a client-supplied value can only
/// shorten it.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

/// The ping ticker fires when the stream has been quiet this long.
const PING_IDLE: Duration = Duration::from_secs(1);

const DROPPED_PARAMS_HEADER: &str = "x-dropped-params";

#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub resolver: ModelResolver,
    pub adapters: Arc<AdapterRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/health", get(health_check))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "gantry-daemon",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
    let started_at = Instant::now();

    let version_ok = headers
        .get("anthropic-version")
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false);
    if !version_ok {
        return error_response(
            &GatewayError::InvalidRequest("anthropic-version header is required".to_string()),
            &[],
        );
    }
    if let Some(beta) = headers.get("anthropic-beta").and_then(|v| v.to_str().ok()) {
        debug!(%request_id, beta, "anthropic-beta header present");
    }

    let wire: MessagesRequest = match serde_json::from_value(body.clone()) {
        Ok(r) => r,
        Err(e) => return error_response(&GatewayError::from(e), &[]),
    };
    let model = wire.model.clone();
    let stream_requested = wire.stream.unwrap_or(false);

    info!(
        %request_id,
        %model,
        stream = stream_requested,
        messages = wire.messages.len(),
        "/v1/messages request"
    );

    let Some(target) = state.resolver.resolve(&model) else {
        return error_response(&GatewayError::ModelNotFound(model), &[]);
    };
    let deadline = request_deadline(&headers);

    match target.handler_kind {
        HandlerKind::AnthropicPassthrough => {
            passthrough_request(&state, &target, &body, &request_id).await
        }
        HandlerKind::OpenAiCompat => {
            translate_request(state, target, wire, request_id, started_at, deadline).await
        }
    }
}

/// Total deadline: client-supplied `x-request-timeout` (seconds) capped at
/// the default.
fn request_deadline(headers: &HeaderMap) -> Duration {
    headers
        .get("x-request-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(DEFAULT_DEADLINE))
        .unwrap_or(DEFAULT_DEADLINE)
}

async fn translate_request(
    state: AppState,
    target: UpstreamTarget,
    wire: MessagesRequest,
    request_id: String,
    started_at: Instant,
    deadline: Duration,
) -> Response {
    let normalized = match normalize::normalize(wire) {
        Ok(n) => n,
        Err(e) => return error_response(&e, &[]),
    };
    let mut canonical = normalized.request;
    let dropped = normalized.dropped;
    let client_stream = canonical.stream;

    if !target.capabilities.supports_tools && !canonical.tools.is_empty() {
        warn!(
            %request_id,
            count = canonical.tools.len(),
            "upstream does not support tools, stripping tool definitions"
        );
        canonical.tools.clear();
        canonical.tool_choice = None;
    }

    let mut payload = request_builder::build_chat_request(&canonical);
    // The upstream is always streamed, so both client modes share one
    // translator; the non-streaming path assembles afterwards
    payload.stream = true;
    payload.stream_options = Some(StreamOptions { include_usage: true });

    let adapter = state.adapters.select(&canonical.model);
    adapter.prepare_request(&mut payload, &canonical);
    debug!(%request_id, adapter = adapter.name(), "adapter selected");
    let translator = StreamTranslator::new(&canonical.model, adapter);

    let response = match upstream::post_chat(&state.http, &target, &payload).await {
        Ok(r) => r,
        Err(e) => return error_response(&e, &dropped),
    };

    if client_stream {
        stream_response(translator, response, dropped, request_id, started_at, deadline)
    } else {
        json_response(translator, response, dropped, request_id, started_at, deadline).await
    }
}

fn frame(event: &StreamEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event.event_name(), data)
}

/// Stream the translated response as Anthropic SSE.
fn stream_response(
    mut translator: StreamTranslator,
    upstream_response: reqwest::Response,
    dropped: Vec<String>,
    request_id: String,
    started_at: Instant,
    deadline: Duration,
) -> Response {
    let stream = async_stream::stream! {
        let mut parser = SseParser::new();
        let mut byte_stream = upstream_response.bytes_stream();
        let deadline_at = tokio::time::Instant::now() + deadline;
        let mut ticker = tokio::time::interval(PING_IDLE);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        for event in translator.start() {
            yield Ok::<_, std::convert::Infallible>(frame(&event));
        }
        let mut last_write = Instant::now();
        let mut errored = false;

        'outer: loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Pings only when nothing else went out this tick, and
                    // always between frames, never inside one
                    if last_write.elapsed() >= PING_IDLE {
                        yield Ok(frame(&StreamEvent::Ping));
                        last_write = Instant::now();
                    }
                }
                _ = tokio::time::sleep_until(deadline_at) => {
                    warn!(%request_id, "request deadline expired mid-stream, aborting upstream");
                    translator.set_stop_reason(StopReason::MaxTokens);
                    break 'outer;
                }
                chunk = byte_stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for item in parser.push(&bytes) {
                                match item {
                                    SseItem::Event { data, .. } => {
                                        for event in translator.on_payload(&data) {
                                            yield Ok(frame(&event));
                                            last_write = Instant::now();
                                        }
                                    }
                                    SseItem::Done => break 'outer,
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!(%request_id, "upstream stream error: {}", e);
                            for event in translator.fail(&e.to_string()) {
                                yield Ok(frame(&event));
                            }
                            errored = true;
                            break 'outer;
                        }
                        None => break 'outer,
                    }
                }
            }
        }

        if !errored {
            for event in translator.finish() {
                yield Ok(frame(&event));
            }
            yield Ok("data: [DONE]\n\n".to_string());
        }
        info!(
            %request_id,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "stream complete"
        );
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap();
    apply_dropped_header(&mut response, &dropped);
    response
}

/// Buffer the translated stream and reply with a single JSON body.
async fn json_response(
    mut translator: StreamTranslator,
    upstream_response: reqwest::Response,
    dropped: Vec<String>,
    request_id: String,
    started_at: Instant,
    deadline: Duration,
) -> Response {
    let mut parser = SseParser::new();
    let mut byte_stream = upstream_response.bytes_stream();
    let deadline_at = Instant::now() + deadline;

    let mut events = translator.start();
    let mut data_flowed = false;

    'outer: loop {
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let next = tokio::time::timeout(remaining, byte_stream.next()).await;
        match next {
            Err(_) => {
                // Deadline expired while buffering
                if data_flowed {
                    warn!(%request_id, "deadline expired, returning partial response");
                    translator.set_stop_reason(StopReason::MaxTokens);
                    break 'outer;
                }
                return (
                    StatusCode::GATEWAY_TIMEOUT,
                    Json(json!({
                        "type": "error",
                        "error": {"type": "upstream_error", "message": "upstream produced no data before the request deadline"}
                    })),
                )
                    .into_response();
            }
            Ok(Some(Ok(bytes))) => {
                for item in parser.push(&bytes) {
                    match item {
                        SseItem::Event { data, .. } => {
                            let translated = translator.on_payload(&data);
                            if !translated.is_empty() {
                                data_flowed = true;
                            }
                            events.extend(translated);
                        }
                        SseItem::Done => break 'outer,
                    }
                }
            }
            Ok(Some(Err(e))) => {
                // Nothing has been written to the client yet, so a proper
                // HTTP error is still possible
                error!(%request_id, "upstream stream error: {}", e);
                return error_response(&GatewayError::UpstreamError(e.to_string()), &dropped);
            }
            Ok(None) => break 'outer,
        }
    }

    events.extend(translator.finish());
    let response_body = assemble::assemble(&events, translator.prompt_tokens());

    info!(
        %request_id,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        blocks = response_body.content.len(),
        "request complete"
    );

    let mut response = Json(response_body).into_response();
    apply_dropped_header(&mut response, &dropped);
    response
}

/// Forward an Anthropic-format request body unchanged and relay the
/// upstream's bytes back to the client.
async fn passthrough_request(
    state: &AppState,
    target: &UpstreamTarget,
    body: &Value,
    request_id: &str,
) -> Response {
    let upstream_response = match upstream::post_passthrough(&state.http, target, body).await {
        Ok(r) => r,
        Err(e) => return error_response(&e, &[]),
    };

    let content_type = upstream_response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    info!(%request_id, "passthrough request forwarded");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(upstream_response.bytes_stream()))
        .unwrap()
}

/// Error body for failures that happen before any SSE byte is written.
fn error_response(err: &GatewayError, dropped: &[String]) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "type": "error",
        "error": {"type": err.wire_type(), "message": err.to_string()}
    });

    let mut response = (status, Json(body)).into_response();
    if let GatewayError::RateLimited { retry_after: Some(secs), .. } = err {
        if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    apply_dropped_header(&mut response, dropped);
    response
}

fn apply_dropped_header(response: &mut Response, dropped: &[String]) {
    if dropped.is_empty() {
        return;
    }
    if let Ok(value) = header::HeaderValue::from_str(&dropped.join(", ")) {
        response
            .headers_mut()
            .insert(header::HeaderName::from_static(DROPPED_PARAMS_HEADER), value);
    }
}
