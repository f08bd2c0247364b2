// Proxy module - HTTP server that forwards requests to the inference backend
//
// This module implements a transparent HTTP proxy using Axum. One route is
// special: POST /v1/chat/completions goes through the structured chat client.
// Everything else is forwarded byte-for-byte to the backend. Both paths open
// a span per request and attach the facts the extract module recovers from
// the request and response blobs; extraction failures never affect the
// proxied call, which always uses the raw bytes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
    routing::{any, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::Value;
use tokio::net::TcpListener;

use crate::client::ChatCompletions;
use crate::config::Config;
use crate::extract;
use crate::telemetry::{attrs, TraceSink};

/// Connecting to the (local) backend should be quick.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Full-response timeout; slow token-by-token generation can take minutes.
const READ_TIMEOUT: Duration = Duration::from_secs(600);

/// Framing prefix seen in request bodies replayed from exported trace data,
/// where the JSON document sits behind an attribute-value marker. Plain JSON
/// bodies don't contain it and pass through the parser untouched.
const REQUEST_FRAME_PREFIX: &str = "stringValue:";

/// Shared state for the proxy server
#[derive(Clone)]
pub struct ProxyState {
    /// HTTP client for forwarding raw requests
    client: reqwest::Client,
    /// Structured client for the chat/completions route
    chat: Arc<dyn ChatCompletions>,
    /// Span capability; one span per inbound request
    sink: Arc<dyn TraceSink>,
    /// Normalized backend base URL
    backend_url: String,
}

impl ProxyState {
    pub fn new(
        backend_url: String,
        sink: Arc<dyn TraceSink>,
        chat: Arc<dyn ChatCompletions>,
    ) -> Result<Self> {
        // Connection pooling plus a generous overall timeout - the backend may
        // stream a long generation before the response body completes.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            chat,
            sink,
            backend_url,
        })
    }
}

/// Build the proxy router. Non-POST methods on the chat route fall through
/// to the generic handler so only the documented method is special-cased.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(chat_completions).fallback(proxy_handler),
        )
        .route("/", any(proxy_handler))
        .route("/*path", any(proxy_handler))
        .with_state(state)
}

/// Start the proxy server
pub async fn start_proxy(
    config: Config,
    sink: Arc<dyn TraceSink>,
    chat: Arc<dyn ChatCompletions>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let state = ProxyState::new(config.backend_url.clone(), sink, chat)?;
    let app = router(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        "Proxy listening on {}, forwarding to {}",
        config.bind_addr,
        config.backend_url
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}

/// Chat-completions handler - the one structured route.
///
/// The backend-specific `options` object and the `format` field are not part
/// of the structured client's parameters and are removed before forwarding;
/// `options` is kept around because it may carry the temperature.
async fn chat_completions(
    State(state): State<ProxyState>,
    Json(payload): Json<Value>,
) -> Result<Response<Body>, ProxyError> {
    let mut payload = match payload {
        Value::Object(map) => map,
        _ => {
            return Err(ProxyError::BadRequest(
                "chat completion body must be a JSON object".to_string(),
            ))
        }
    };
    let options = payload.remove("options");
    payload.remove("format");

    let messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let prompt = extract::last_user_message(&messages);
    let system = extract::system_messages(&messages);
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let temperature = payload
        .get("temperature")
        .and_then(Value::as_f64)
        .or_else(|| {
            options
                .as_ref()
                .and_then(|options| options.get("temperature"))
                .and_then(Value::as_f64)
        });

    let forward_payload = Value::Object(payload);

    let mut span = state.sink.start_span("chat.completions");
    span.set_str(attrs::PROMPT, prompt);
    span.set_str(attrs::SYSTEM, system);
    span.set_str(attrs::REQUEST_MODEL, model);
    if let Some(temperature) = temperature {
        span.set_f64(attrs::REQUEST_TEMPERATURE, temperature);
    }
    span.set_str(attrs::REQUEST_BODY, forward_payload.to_string());
    tracing::debug!("chat/completions payload: {}", forward_payload);

    let data = match state.chat.create(&forward_payload).await {
        Ok(data) => data,
        Err(err) => {
            span.set_error(format!("{err:#}"));
            span.end();
            return Err(ProxyError::Upstream(format!("{err:#}")));
        }
    };

    let parsed = data.as_object().cloned().unwrap_or_default();
    let completion = extract::first_completion_text(&parsed);
    let usage = extract::usage_facts(&parsed);

    span.set_str(attrs::COMPLETION, completion);
    if let Some(tokens) = usage.prompt_tokens {
        span.set_i64(attrs::USAGE_INPUT_TOKENS, tokens);
    }
    if let Some(tokens) = usage.completion_tokens {
        span.set_i64(attrs::USAGE_OUTPUT_TOKENS, tokens);
    }
    if let Some(tokens) = usage.total_tokens {
        span.set_i64(attrs::USAGE_TOTAL_TOKENS, tokens);
    }
    span.set_str(attrs::RESPONSE_BODY, data.to_string());
    tracing::debug!("chat/completions response: {}", data);
    span.end();

    Ok(Json(data).into_response())
}

/// Generic proxy handler - forwards every other request verbatim.
async fn proxy_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let body_bytes: Bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|err| ProxyError::BodyRead(err.to_string()))?;
    let body_text = extract::lossy_text(&body_bytes);

    // Best-effort request facts for the span only - forwarding always uses
    // the raw bytes, so a body that doesn't parse changes nothing downstream.
    let request_payload = extract::last_json_object(&body_text, REQUEST_FRAME_PREFIX);
    let messages = request_payload
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let prompt = extract::last_user_message(&messages);
    let system = extract::system_messages(&messages);
    let model = request_payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let temperature = request_payload
        .get("temperature")
        .and_then(Value::as_f64)
        .or_else(|| {
            request_payload
                .get("options")
                .and_then(|options| options.get("temperature"))
                .and_then(Value::as_f64)
        });

    let target_url = match uri.query() {
        Some(query) => format!("{}{}?{}", state.backend_url, uri.path(), query),
        None => format!("{}{}", state.backend_url, uri.path()),
    };

    let mut span = state.sink.start_span("proxy.request");
    span.set_str(attrs::TARGET_URL, target_url.clone());
    span.set_str(attrs::REQUEST_BODY, body_text);
    span.set_str(attrs::PROMPT, prompt);
    span.set_str(attrs::SYSTEM, system);
    if !model.is_empty() {
        span.set_str(attrs::REQUEST_MODEL, model);
    }
    if let Some(temperature) = temperature {
        span.set_f64(attrs::REQUEST_TEMPERATURE, temperature);
    }

    tracing::debug!("proxying {} {}", method, target_url);

    let mut forward_req = state.client.request(method, &target_url).body(body_bytes);
    for (key, value) in headers.iter() {
        // The backend must see its own Host; hop-by-hop headers are rebuilt
        // by the client for the new connection.
        if key == "host" || key == "connection" || key == "transfer-encoding" {
            continue;
        }
        forward_req = forward_req.header(key, value);
    }

    let response = match forward_req.send().await {
        Ok(response) => response,
        Err(err) => {
            span.set_error(err.to_string());
            span.end();
            return Err(ProxyError::Upstream(err.to_string()));
        }
    };

    let status = response.status();
    let response_headers = response.headers().clone();
    let response_body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            span.set_error(err.to_string());
            span.end();
            return Err(ProxyError::BodyRead(err.to_string()));
        }
    };

    let response_text = extract::lossy_text(&response_body);
    span.set_str(attrs::RESPONSE_BODY, response_text.clone());
    tracing::debug!("upstream {} returned {} bytes", status, response_body.len());

    // Streamed fragments first; when nothing aggregates, fall back to the
    // last JSON object's completion or its message content.
    let response_payload = extract::last_json_object(&response_text, "");
    let mut completion = extract::aggregate_completion(&response_text, "");
    if completion.is_empty() {
        completion = extract::first_completion_text(&response_payload);
    }
    if completion.is_empty() {
        completion = response_payload
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
    }
    let usage = extract::usage_facts(&response_payload);

    span.set_str(attrs::COMPLETION, completion);
    if let Some(tokens) = usage.prompt_tokens {
        span.set_i64(attrs::USAGE_INPUT_TOKENS, tokens);
    }
    if let Some(tokens) = usage.completion_tokens {
        span.set_i64(attrs::USAGE_OUTPUT_TOKENS, tokens);
    }
    if let Some(tokens) = usage.total_tokens {
        span.set_i64(attrs::USAGE_TOTAL_TOKENS, tokens);
    }
    span.end();

    // Return upstream bytes unchanged; the body is fully buffered, so
    // transport-level encoding headers no longer describe it.
    let mut builder = Response::builder().status(status);
    for (key, value) in response_headers.iter() {
        if key == "content-encoding" || key == "transfer-encoding" || key == "connection" {
            continue;
        }
        builder = builder.header(key, value);
    }

    builder
        .body(Body::from(response_body))
        .map_err(|err| ProxyError::ResponseBuild(err.to_string()))
}

/// Errors that can occur during proxying
#[derive(Debug)]
enum ProxyError {
    BadRequest(String),
    BodyRead(String),
    Upstream(String),
    ResponseBuild(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match self {
            ProxyError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ProxyError::BodyRead(msg) => (StatusCode::BAD_REQUEST, msg),
            ProxyError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ProxyError::ResponseBuild(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        tracing::error!("Proxy error: {} - {}", status, message);

        Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap()
    }
}
