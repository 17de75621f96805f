use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use studio_proxy::process::{LaunchResult, ProcessInfo, ProcessManager};
use studio_proxy::recipes::{Backend, Recipe};
use studio_proxy::switcher::SwitchTimings;
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Default)]
struct MockUpstream {
    bodies: Mutex<Vec<Bytes>>,
    tokenize_calls: AtomicUsize,
}

impl MockUpstream {
    fn last_body(&self) -> Bytes {
        self.bodies
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("upstream saw a request")
    }

    fn last_json(&self) -> Value {
        serde_json::from_slice(&self.last_body()).expect("upstream body is json")
    }
}

#[derive(Default)]
struct FakeProcesses {
    current: Mutex<Option<String>>,
    launch_fails: bool,
    launches: AtomicUsize,
    evictions: AtomicUsize,
}

#[async_trait]
impl ProcessManager for FakeProcesses {
    async fn find_inference_process(&self, _port: u16) -> Option<ProcessInfo> {
        self.current.lock().unwrap().clone().map(|name| ProcessInfo {
            pid: 4242,
            backend: Backend::Vllm,
            served_model_name: Some(name),
            model_path: None,
        })
    }

    async fn launch_model(&self, recipe: &Recipe) -> LaunchResult {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.launch_fails {
            return LaunchResult::failed("vllm: command not found");
        }
        *self.current.lock().unwrap() = Some(recipe.canonical_name().to_string());
        LaunchResult::started(4243, "launched")
    }

    async fn evict_model(&self, _force: bool) -> Option<u32> {
        self.evictions.fetch_add(1, Ordering::SeqCst);
        self.current.lock().unwrap().take().map(|_| 4242)
    }

    async fn pid_exists(&self, _pid: u32) -> bool {
        true
    }
}

struct TestContext {
    router: Router,
    state: studio_proxy::app::AppState,
    upstream: Arc<MockUpstream>,
    processes: Arc<FakeProcesses>,
    _temp_dir: TempDir,
}

fn sse(payload: Value) -> String {
    format!("data: {payload}\n\n")
}

fn sse_response(chunks: Vec<String>) -> Response {
    let stream = futures_util::stream::iter(
        chunks
            .into_iter()
            .map(|chunk| Ok::<_, Infallible>(Bytes::from(chunk))),
    );
    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

fn chunk(model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "created": 1700000000,
        "model": model,
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
    })
}

async fn chat(State(mock): State<Arc<MockUpstream>>, body: Bytes) -> Response {
    mock.bodies.lock().unwrap().push(body.clone());
    let Ok(req) = serde_json::from_slice::<Value>(&body) else {
        return (StatusCode::OK, "not json, but forwarded").into_response();
    };
    let model = req
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("mock")
        .to_string();
    let scenario = req
        .get("mock_scenario")
        .and_then(|v| v.as_str())
        .unwrap_or("plain");
    let stream = req.get("stream").and_then(|v| v.as_bool()) == Some(true);

    if scenario == "error" {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(CONTENT_TYPE, "application/json")],
            r#"{"error":{"message":"slow down","code":"rate_limited"}}"#,
        )
            .into_response();
    }

    if !stream {
        let content = match scenario {
            "tool_text" => {
                r#"<tool_call>{"name":"get_weather","arguments":{"city":"Oslo"}}</tool_call>"#
            }
            "think" => "<think>weighing options</think>Final answer",
            _ => "hello",
        };
        return axum::Json(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "created": 1700000000,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
        }))
        .into_response();
    }

    let usage = json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "created": 1700000000,
        "model": model,
        "choices": [],
        "usage": {"prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13}
    });
    let chunks = match scenario {
        "think" => {
            let split = sse(chunk(&model, json!({"content": "ning</think>Answer"}), None));
            let (head, tail) = split.split_at(25);
            vec![
                sse(chunk(&model, json!({"role": "assistant", "content": ""}), None)),
                sse(chunk(&model, json!({"content": "<think>plan"}), None)),
                head.to_string(),
                tail.to_string(),
                sse(chunk(&model, json!({}), Some("stop"))),
                sse(usage),
                "data: [DONE]\n\n".to_string(),
            ]
        }
        "echo" => vec![
            sse(chunk(&model, json!({"role": "user", "content": "", "tool_calls": []}), None)),
            sse(chunk(&model, json!({"role": "assistant", "content": "hi there"}), None)),
            "data: [DONE]\n\n".to_string(),
        ],
        "slow" => {
            let mut chunks: Vec<String> = (0..6)
                .map(|i| sse(chunk(&model, json!({"content": format!("part{i} ")}), None)))
                .collect();
            chunks.push("data: [DONE]\n\n".to_string());
            let stream = futures_util::StreamExt::then(
                futures_util::stream::iter(chunks),
                |chunk| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, Infallible>(Bytes::from(chunk))
                },
            );
            return Response::builder()
                .header(CONTENT_TYPE, "text/event-stream")
                .body(Body::from_stream(stream))
                .unwrap();
        }
        "tool_text" => vec![
            sse(chunk(
                &model,
                json!({"content": "<tool_call>{\"name\":\"get_weather\",\"arguments\":{\"city\":\"Oslo\"}}"}),
                None,
            )),
            sse(chunk(&model, json!({"content": "</tool_call>"}), None)),
            sse(chunk(&model, json!({}), Some("stop"))),
            "data: [DONE]\n\n".to_string(),
        ],
        _ => vec![
            sse(chunk(&model, json!({"content": "plain words"}), None)),
            sse(chunk(&model, json!({}), Some("stop"))),
            "data: [DONE]\n\n".to_string(),
        ],
    };
    sse_response(chunks)
}

async fn tokenize(State(mock): State<Arc<MockUpstream>>, body: axum::Json<Value>) -> Response {
    mock.tokenize_calls.fetch_add(1, Ordering::SeqCst);
    let count = body
        .get("prompt")
        .and_then(|v| v.as_str())
        .map(|text| text.split_whitespace().count())
        .unwrap_or(0);
    axum::Json(json!({ "count": count })).into_response()
}

async fn start_upstream() -> (SocketAddr, Arc<MockUpstream>) {
    let mock = Arc::new(MockUpstream::default());
    let router = Router::new()
        .route("/v1/chat/completions", post(chat))
        .route("/tokenize", post(tokenize))
        .route("/health", get(|| async { "ok" }))
        .with_state(Arc::clone(&mock));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, mock)
}

fn recipe(id: &str, served: &str) -> Recipe {
    Recipe {
        id: id.to_string(),
        name: format!("{id} recipe"),
        model_path: format!("/models/{id}"),
        served_model_name: Some(served.to_string()),
        backend: Backend::Vllm,
        tensor_parallel_size: None,
        max_model_len: None,
        gpu_memory_utilization: None,
        extra_args: Vec::new(),
    }
}

async fn setup_with(processes: FakeProcesses) -> TestContext {
    setup_with_timeout(processes, 10_000).await
}

async fn setup_with_timeout(processes: FakeProcesses, upstream_timeout_ms: u64) -> TestContext {
    let (addr, upstream) = start_upstream().await;
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("studio.db");
    let runtime = studio_proxy::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        upstream_url: format!("http://{addr}"),
        upstream_api_key: "sk-test".to_string(),
        upstream_timeout_ms,
        inference_host: addr.ip().to_string(),
        inference_port: addr.port(),
        log_dir: temp_dir.path().to_path_buf(),
        max_body_bytes: 1024 * 1024,
        switch: SwitchTimings {
            settle: Duration::from_millis(1),
            deadline: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            health_timeout: Duration::from_millis(500),
        },
    };
    let processes = Arc::new(processes);
    let state = studio_proxy::app::load_state_with(runtime, processes.clone())
        .await
        .expect("load state");
    state
        .recipe_store
        .upsert(&recipe("glm", "GLM-4-Air"))
        .await
        .expect("seed glm");
    state
        .recipe_store
        .upsert(&recipe("qwen", "Qwen3-32B"))
        .await
        .expect("seed qwen");

    TestContext {
        router: studio_proxy::app::build_app(state.clone()),
        state,
        upstream,
        processes,
        _temp_dir: temp_dir,
    }
}

async fn setup() -> TestContext {
    setup_with(FakeProcesses {
        current: Mutex::new(Some("GLM-4-Air".to_string())),
        ..Default::default()
    })
    .await
}

async fn post_raw(ctx: &TestContext, body: impl Into<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

async fn json_post(ctx: &TestContext, body: Value) -> (StatusCode, axum::http::HeaderMap, String) {
    post_raw(ctx, body.to_string()).await
}

fn stream_events(text: &str) -> Vec<Value> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|payload| *payload != "[DONE]")
        .map(|payload| serde_json::from_str(payload).unwrap())
        .collect()
}

#[tokio::test]
async fn health_reports_ok() {
    let ctx = setup().await;
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn streaming_rewrites_model_and_splits_think_tags() {
    let ctx = setup().await;
    let (status, headers, text) = json_post(
        &ctx,
        json!({
            "model": "glm-4-air",
            "stream": true,
            "mock_scenario": "think",
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/event-stream");
    assert_eq!(headers.get("cache-control").unwrap(), "no-cache");
    assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");

    let forwarded = ctx.upstream.last_json();
    assert_eq!(forwarded["model"], "GLM-4-Air");
    assert_eq!(forwarded["stream_options"], json!({"include_usage": true}));
    assert_eq!(ctx.processes.launches.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.processes.evictions.load(Ordering::SeqCst), 0);

    let events = stream_events(&text);
    let reasoning: String = events
        .iter()
        .filter_map(|e| e["choices"][0]["delta"]["reasoning_content"].as_str())
        .collect();
    let content: String = events
        .iter()
        .filter_map(|e| e["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(reasoning, "planning");
    assert_eq!(content, "Answer");
    assert!(!text.contains("<think>"));
    assert!(!text.contains("\"usage\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));

    let usage = ctx.state.usage.snapshot();
    assert_eq!(usage.requests, 1);
    assert_eq!(usage.prompt_tokens, 9);
    assert_eq!(usage.completion_tokens, 4);
    assert_eq!(usage.total_tokens, 13);
}

#[tokio::test]
async fn usage_chunk_is_kept_when_client_asked_for_it() {
    let ctx = setup().await;
    let (_, _, text) = json_post(
        &ctx,
        json!({
            "model": "glm-4-air",
            "stream": true,
            "stream_options": {"include_usage": true},
            "mock_scenario": "think",
            "messages": []
        }),
    )
    .await;
    let events = stream_events(&text);
    let usage = events
        .iter()
        .find(|e| e.get("usage").is_some())
        .expect("usage event");
    assert_eq!(usage["usage"]["prompt_tokens"], 9);
    assert_eq!(ctx.state.usage.snapshot().prompt_tokens, 9);
}

#[tokio::test]
async fn long_stream_outlives_upstream_timeout() {
    let ctx = setup_with_timeout(
        FakeProcesses {
            current: Mutex::new(Some("GLM-4-Air".to_string())),
            ..Default::default()
        },
        300,
    )
    .await;
    let (status, _, text) = json_post(
        &ctx,
        json!({"model": "glm-4-air", "stream": true, "mock_scenario": "slow", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let content: String = stream_events(&text)
        .iter()
        .filter_map(|e| e["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "part0 part1 part2 part3 part4 part5 ");
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn user_echo_events_are_dropped() {
    let ctx = setup().await;
    let (_, _, text) = json_post(
        &ctx,
        json!({"model": "GLM-4-Air", "stream": true, "mock_scenario": "echo", "messages": []}),
    )
    .await;
    let events = stream_events(&text);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["choices"][0]["delta"]["content"], "hi there");
}

#[tokio::test]
async fn textual_tool_call_gets_synthetic_chunk_before_done() {
    let ctx = setup().await;
    let (_, _, text) = json_post(
        &ctx,
        json!({"model": "glm-4-air", "stream": true, "mock_scenario": "tool_text", "messages": []}),
    )
    .await;
    let done_at = text.find("data: [DONE]").expect("done line");
    let events = stream_events(&text);
    let synthetic = events.last().unwrap();
    assert_eq!(synthetic["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(synthetic["id"], "chatcmpl-mock");
    assert_eq!(synthetic["model"], "GLM-4-Air");
    let call = &synthetic["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(call["type"], "function");
    assert_eq!(call["function"]["name"], "get_weather");
    assert_eq!(call["function"]["arguments"], "{\"city\":\"Oslo\"}");
    assert!(call["id"].as_str().unwrap().starts_with("call_"));
    assert!(text.find("\"finish_reason\":\"tool_calls\"").unwrap() < done_at);
}

#[tokio::test]
async fn stream_without_usage_falls_back_to_tokenizer() {
    let ctx = setup().await;
    let (status, _, _) = json_post(
        &ctx,
        json!({
            "model": "glm-4-air",
            "stream": true,
            "messages": [{"role": "user", "content": "count these four words"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let mut snapshot = ctx.state.usage.snapshot();
    for _ in 0..100 {
        if snapshot.total_tokens > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        snapshot = ctx.state.usage.snapshot();
    }
    assert_eq!(ctx.upstream.tokenize_calls.load(Ordering::SeqCst), 2);
    assert_eq!(snapshot.prompt_tokens, 4);
    assert_eq!(snapshot.completion_tokens, 2);
}

#[tokio::test]
async fn nonstream_response_gets_one_shot_fixups() {
    let ctx = setup().await;
    let (status, _, text) = json_post(
        &ctx,
        json!({"model": "glm-4-air", "mock_scenario": "think", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&text).unwrap();
    let message = &body["choices"][0]["message"];
    assert_eq!(message["reasoning_content"], "weighing options");
    assert_eq!(message["content"], "Final answer");
    assert!(ctx.upstream.last_json().get("stream_options").is_none());

    let usage = ctx.state.usage.snapshot();
    assert_eq!(usage.prompt_tokens, 12);
    assert_eq!(usage.completion_tokens, 5);
}

#[tokio::test]
async fn nonstream_inline_tool_calls_become_structured() {
    let ctx = setup().await;
    let (_, _, text) = json_post(
        &ctx,
        json!({"model": "glm-4-air", "mock_scenario": "tool_text", "messages": []}),
    )
    .await;
    let body: Value = serde_json::from_str(&text).unwrap();
    let choice = &body["choices"][0];
    assert_eq!(choice["finish_reason"], "tool_calls");
    assert_eq!(choice["message"]["content"], Value::Null);
    assert_eq!(
        choice["message"]["tool_calls"][0]["function"]["name"],
        "get_weather"
    );
}

#[tokio::test]
async fn upstream_errors_pass_through_verbatim() {
    let ctx = setup().await;
    let (status, headers, text) = json_post(
        &ctx,
        json!({"model": "glm-4-air", "stream": true, "mock_scenario": "error", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    assert_eq!(text, r#"{"error":{"message":"slow down","code":"rate_limited"}}"#);
}

#[tokio::test]
async fn malformed_body_is_forwarded_unchanged() {
    let ctx = setup().await;
    let raw = "{\"model\": \"glm-4-air\", oops";
    let (status, _, text) = post_raw(&ctx, raw).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "not json, but forwarded");
    assert_eq!(ctx.upstream.last_body(), Bytes::from(raw));
    assert_eq!(ctx.processes.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_model_is_forwarded_without_switching() {
    let ctx = setup().await;
    let (status, _, _) = json_post(
        &ctx,
        json!({"model": "mistral-large", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx.upstream.last_json()["model"], "mistral-large");
    assert_eq!(ctx.processes.evictions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn requesting_another_model_switches_backend() {
    let ctx = setup().await;
    let (status, _, _) = json_post(
        &ctx,
        json!({"model": "qwen/qwen3-32b:latest", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx.upstream.last_json()["model"], "Qwen3-32B");
    assert_eq!(ctx.processes.evictions.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.processes.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_switch_returns_service_unavailable() {
    let ctx = setup_with(FakeProcesses {
        launch_fails: true,
        ..Default::default()
    })
    .await;
    let (status, _, text) = json_post(&ctx, json!({"model": "qwen3-32b", "messages": []})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["error"]["code"], "model_switch_failed");
    assert_eq!(body["error"]["param"], "model");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("command not found")
    );
    assert!(ctx.upstream.bodies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn metrics_endpoint_renders() {
    let ctx = setup().await;
    let _ = json_post(&ctx, json!({"model": "glm-4-air", "messages": []})).await;
    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
