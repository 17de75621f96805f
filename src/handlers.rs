use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::recipes::RecipeStore;
use crate::resolver::{resolve, rewrite_model};
use crate::stream::{SseTransducer, drive};
use crate::switcher::SwitchError;
use crate::transforms::apply_completion_fixups;
use crate::upstream::{self, GatewayConfig, UpstreamCallError, UpstreamErrorKind};
use crate::usage::{UsageSink, count_usage_fallback, record_usage};
use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// What the proxy learned from the request body before forwarding it.
struct PreparedRequest {
    body: Bytes,
    model: Option<String>,
    stream: bool,
    /// The proxy asked for usage on the client's behalf.
    usage_injected: bool,
    prompt: String,
}

/// Inputs for usage accounting on a streamed response.
struct StreamAccounting {
    model: Option<String>,
    prompt: String,
    usage_injected: bool,
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Response> {
    state.usage.add_requests(1);
    let PreparedRequest {
        body,
        model,
        stream,
        usage_injected,
        prompt,
    } = prepare_request(&state, body).await?;

    let gateway = state.runtime.gateway();
    let upstream_resp =
        upstream::call_chat_completions_raw(&state.http, &gateway, body, stream)
            .await
            .map_err(upstream_error_to_app)?;

    let status = upstream_resp.status();
    if !status.is_success() {
        tracing::debug!(%status, "forwarding upstream error response");
        return passthrough(upstream_resp).await;
    }

    let is_event_stream = upstream_resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));
    if stream && is_event_stream {
        let accounting = StreamAccounting {
            model,
            prompt,
            usage_injected,
        };
        return stream_response(&state, upstream_resp, &gateway, accounting);
    }
    forward_nonstream(&state, upstream_resp).await
}

/// Resolves and rewrites the model, makes sure it is loaded, and asks for
/// usage on streaming requests. Bodies that are not JSON objects, or carry no
/// string `model`, go through untouched.
async fn prepare_request(state: &AppState, raw: Bytes) -> AppResult<PreparedRequest> {
    let Some(mut body) = serde_json::from_slice::<Value>(&raw)
        .ok()
        .filter(|v| v.is_object())
    else {
        return Ok(PreparedRequest {
            body: raw,
            model: None,
            stream: false,
            usage_injected: false,
            prompt: String::new(),
        });
    };

    let mut changed = false;
    let mut model = body.get("model").and_then(|v| v.as_str()).map(str::to_string);
    if let Some(requested) = model.clone() {
        let recipes = state.recipe_store.list().await.map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "recipe_store_error",
                err.to_string(),
            )
        })?;
        if let Some(recipe) = resolve(&requested, &recipes) {
            let canonical = recipe.canonical_name();
            if canonical != requested && rewrite_model(&mut body, canonical) {
                tracing::debug!(requested = %requested, canonical = %canonical, "rewrote model name");
                changed = true;
            }
            model = Some(canonical.to_string());
            state
                .switcher
                .ensure_running(recipe)
                .await
                .map_err(switch_error_to_app)?;
        }
    }

    let stream = body.get("stream").and_then(|v| v.as_bool()) == Some(true);
    let mut usage_injected = false;
    if stream && body.get("stream_options").is_none() {
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "stream_options".to_string(),
                json!({ "include_usage": true }),
            );
            usage_injected = true;
            changed = true;
        }
    }

    let prompt = prompt_text(&body);
    let body = if changed {
        Bytes::from(serde_json::to_vec(&body).map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request_encode_failed",
                err.to_string(),
            )
        })?)
    } else {
        raw
    };
    Ok(PreparedRequest {
        body,
        model,
        stream,
        usage_injected,
        prompt,
    })
}

/// Text of every message, for tokenizer-based usage fallback.
fn prompt_text(body: &Value) -> String {
    let mut out = String::new();
    let messages = body.get("messages").and_then(|v| v.as_array());
    for message in messages.into_iter().flatten() {
        match message.get("content") {
            Some(Value::String(text)) => {
                out.push_str(text);
                out.push('\n');
            }
            Some(Value::Array(parts)) => {
                for text in parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
                {
                    out.push_str(text);
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
    out
}

fn stream_response(
    state: &AppState,
    upstream_resp: reqwest::Response,
    gateway: &GatewayConfig,
    accounting: StreamAccounting,
) -> AppResult<Response> {
    let StreamAccounting {
        model,
        prompt,
        usage_injected,
    } = accounting;
    let sink: Arc<dyn UsageSink> = state.usage.clone();
    let usage_sink = sink.clone();
    let transducer = SseTransducer::new()
        .hide_usage_chunks(usage_injected)
        .on_usage(move |usage| {
            record_usage(usage_sink.as_ref(), usage);
        });

    let http = state.http.clone();
    let tokenize_url = state.runtime.tokenize_url();
    let idle_timeout = gateway.timeout();
    let stream = drive(upstream_resp.bytes_stream(), transducer, idle_timeout, move |done| {
        if done.usage_reported() {
            return;
        }
        let Some(model) = model else {
            return;
        };
        let completion = done.completion_text().to_string();
        tokio::spawn(count_usage_fallback(
            http,
            tokenize_url,
            model,
            prompt,
            completion,
            sink,
        ));
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "response_build_failed",
                err.to_string(),
            )
        })
}

async fn forward_nonstream(state: &AppState, upstream_resp: reqwest::Response) -> AppResult<Response> {
    let status = upstream_resp.status();
    let content_type = upstream_resp.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = upstream_resp.bytes().await.map_err(read_error_to_app)?;
    let Ok(mut body) = serde_json::from_slice::<Value>(&bytes) else {
        return Ok(raw_response(status, content_type, bytes));
    };
    if let Some(usage) = apply_completion_fixups(&mut body) {
        record_usage(state.usage.as_ref(), usage);
    }
    Ok((status, Json(body)).into_response())
}

async fn passthrough(upstream_resp: reqwest::Response) -> AppResult<Response> {
    let status = upstream_resp.status();
    let content_type = upstream_resp.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = upstream_resp.bytes().await.map_err(read_error_to_app)?;
    Ok(raw_response(status, content_type, bytes))
}

fn raw_response(status: StatusCode, content_type: Option<HeaderValue>, bytes: Bytes) -> Response {
    let mut resp = (status, bytes).into_response();
    match content_type {
        Some(value) => {
            resp.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        None => {
            resp.headers_mut().remove(header::CONTENT_TYPE);
        }
    }
    resp
}

fn switch_error_to_app(err: SwitchError) -> AppError {
    AppError::service_unavailable("model_switch_failed", err.to_string()).with_param("model")
}

fn upstream_error_to_app(err: UpstreamCallError) -> AppError {
    match err.kind {
        UpstreamErrorKind::Network => {
            AppError::new(StatusCode::BAD_GATEWAY, "upstream_unreachable", err.message)
                .with_type("upstream_error")
        }
        UpstreamErrorKind::Http => {
            let status = err.status.unwrap_or(StatusCode::BAD_GATEWAY);
            AppError::new(status, "upstream_error", err.message).with_type("upstream_error")
        }
    }
}

fn read_error_to_app(err: reqwest::Error) -> AppError {
    upstream_error_to_app(UpstreamCallError::new(
        UpstreamErrorKind::Network,
        None,
        err.to_string(),
    ))
}
