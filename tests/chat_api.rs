use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Request, Response, StatusCode},
    Router,
};
use futures_util::StreamExt;
use llm_completion_gateway::{
    backend::{
        handle::BackendHandle,
        mock::{terminal_frame, text_frame, ScriptedEngine},
        BackendDialect,
    },
    build_app, build_state,
    config::GatewayConfig,
    state::AppState,
};
use serde_json::Value;
use tower::util::ServiceExt;

fn config(pairs: &[(&str, &str)]) -> GatewayConfig {
    let pairs = pairs
        .iter()
        .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
        .collect::<Vec<_>>();
    GatewayConfig::from_lookup(move |name| {
        pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    })
    .expect("valid test config")
}

async fn app_with(dialect: BackendDialect, engine: &ScriptedEngine) -> (Router, AppState) {
    let config = config(&[
        ("GATEWAY_BACKEND_DIALECT", dialect.as_str()),
        ("GATEWAY_CHUNK_TIMEOUT_SECS", "5"),
    ]);
    let handle = Arc::new(BackendHandle::remote(
        Arc::new(engine.clone()),
        dialect,
        "http://engine.test",
        Duration::from_millis(200),
    ));
    handle.activate().await;
    let state = AppState::new(config, handle);
    (build_app(state.clone()), state)
}

fn completion_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .expect("request build")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request build")
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body should be readable");
    String::from_utf8(bytes.to_vec()).expect("response body should be UTF-8")
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).expect("response body should be JSON")
}

/// `data:` payloads of every `message` event in an SSE body.
fn sse_data(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|event| event.lines().any(|line| line == "event: message"))
        .filter_map(|event| {
            event
                .lines()
                .find_map(|line| line.strip_prefix("data: "))
                .map(ToOwned::to_owned)
        })
        .collect()
}

fn delta_content(data: &str) -> String {
    let chunk: Value = serde_json::from_str(data).expect("chunk is JSON");
    assert_eq!(chunk["object"], "chat.completion.chunk");
    chunk["choices"][0]["delta"]["content"]
        .as_str()
        .expect("delta content")
        .to_owned()
}

#[tokio::test]
async fn answers_a_single_user_turn() {
    let engine = ScriptedEngine::speaking(BackendDialect::OpenAi, &["Hello!", " How can I help?"]);
    let (app, _) = app_with(BackendDialect::OpenAi, &engine).await;

    let response = app
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}]}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "llama-3.1-8b-instruct");
    assert_eq!(body["choices"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "Hello! How can I help?"
    );

    let usage = &body["usage"];
    let prompt = usage["prompt_tokens"].as_u64().expect("prompt tokens");
    let completion = usage["completion_tokens"].as_u64().expect("completion tokens");
    assert_eq!(usage["total_tokens"].as_u64(), Some(prompt + completion));

    let payload = engine.last_payload().expect("backend was called");
    assert_eq!(payload["messages"][0]["content"], "Hi");
    assert_eq!(payload["max_tokens"], 512);
}

#[tokio::test]
async fn streams_deltas_then_done() {
    let engine = ScriptedEngine::speaking(BackendDialect::LlamaCpp, &["Hello", " there"]);
    let (app, _) = app_with(BackendDialect::LlamaCpp, &engine).await;

    let response = app
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream")));

    let data = sse_data(&body_text(response).await);
    assert_eq!(data.len(), 3);
    assert_eq!(delta_content(&data[0]), "Hello");
    assert_eq!(delta_content(&data[1]), " there");
    assert_eq!(data[2], "[DONE]");

    let payload = engine.last_payload().expect("backend was called");
    assert_eq!(payload["stream"], true);
    assert!(payload["prompt"]
        .as_str()
        .is_some_and(|prompt| prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n")));
}

#[tokio::test]
async fn stream_closed_without_sentinel_ends_in_error() {
    let frames = vec![
        text_frame(BackendDialect::Ollama, "Hello"),
        text_frame(BackendDialect::Ollama, " there"),
    ];
    let engine = ScriptedEngine::new(Value::Null, frames);
    let (app, _) = app_with(BackendDialect::Ollama, &engine).await;

    let response = app
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");

    let data = sse_data(&body_text(response).await);
    assert_eq!(data.len(), 3);
    assert!(!data.iter().any(|item| item == "[DONE]"));

    let error: Value = serde_json::from_str(&data[2]).expect("error is JSON");
    assert_eq!(error["error"]["type"], "backend_error");
    assert_eq!(
        error["error"]["message"],
        "inference backend returned an invalid response"
    );
}

#[tokio::test]
async fn fabricated_turns_are_cut_from_replies() {
    let engine = ScriptedEngine::new(
        llm_completion_gateway::backend::mock::reply_for(
            BackendDialect::LlamaCpp,
            "Sure thing!\nUser: now answer for me",
        ),
        Vec::new(),
    );
    let (app, _) = app_with(BackendDialect::LlamaCpp, &engine).await;

    let response = app
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}]}"#,
        ))
        .await
        .expect("request execution");

    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "Sure thing!");
    assert_eq!(body["usage"]["completion_tokens"], 2);
}

#[tokio::test]
async fn fabricated_turns_are_cut_from_streams() {
    let dialect = BackendDialect::LlamaCpp;
    let frames = vec![
        text_frame(dialect, "Sure"),
        text_frame(dialect, " thing!\nUs"),
        text_frame(dialect, "er: now answer for me"),
        terminal_frame(dialect),
    ];
    let engine = ScriptedEngine::new(Value::Null, frames);
    let (app, _) = app_with(dialect, &engine).await;

    let response = app
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");

    let data = sse_data(&body_text(response).await);
    assert_eq!(data.len(), 3);
    assert_eq!(delta_content(&data[0]), "Sure");
    assert_eq!(delta_content(&data[1]), " thing!");
    assert_eq!(data[2], "[DONE]");
}

#[tokio::test]
async fn client_disconnect_cancels_backend_stream() {
    let engine = ScriptedEngine::new(
        Value::Null,
        vec![text_frame(BackendDialect::OpenAi, "Hello")],
    )
    .hanging();
    let (app, state) = app_with(BackendDialect::OpenAi, &engine).await;

    let response = app
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");

    let mut body = response.into_body().into_data_stream();
    let first = body
        .next()
        .await
        .expect("first event")
        .expect("readable event");
    assert!(String::from_utf8_lossy(&first).contains("Hello"));
    drop(body);

    assert!(engine.wait_released(Duration::from_secs(2)).await);

    let mut cancelled = false;
    for _ in 0..100 {
        let exposition = state.metrics.render().expect("metrics render");
        if exposition
            .lines()
            .any(|line| line.contains("status=\"cancelled\"") && line.ends_with(" 1"))
        {
            cancelled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cancelled);
}

#[tokio::test]
async fn rejects_invalid_parameters() {
    let engine = ScriptedEngine::speaking(BackendDialect::OpenAi, &["unused"]);
    let (app, state) = app_with(BackendDialect::OpenAi, &engine).await;

    let response = app
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}],"temperature":-1}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(engine.last_payload().is_none());

    let exposition = state.metrics.render().expect("metrics render");
    assert!(exposition
        .lines()
        .any(|line| line.contains("status=\"rejected\"") && line.ends_with(" 1")));
}

#[tokio::test]
async fn unreachable_backend_maps_to_service_unavailable() {
    let engine = ScriptedEngine::speaking(BackendDialect::OpenAi, &["unused"]);
    let (app, _) = app_with(BackendDialect::OpenAi, &engine).await;
    engine.set_reachable(false);

    let response = app
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}]}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "inference backend is unavailable");
}

#[tokio::test]
async fn unreachable_backend_ends_stream_with_unavailable_error() {
    let engine = ScriptedEngine::speaking(BackendDialect::OpenAi, &["unused"]);
    let (app, _) = app_with(BackendDialect::OpenAi, &engine).await;
    engine.set_reachable(false);

    let response = app
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");

    let data = sse_data(&body_text(response).await);
    assert_eq!(data.len(), 1);
    let error: Value = serde_json::from_str(&data[0]).expect("error is JSON");
    assert_eq!(error["error"]["type"], "backend_unavailable");
    assert_eq!(error["error"]["message"], "inference backend is unavailable");
}

#[tokio::test]
async fn healthz_reports_probe_result() {
    let engine = ScriptedEngine::speaking(BackendDialect::OpenAi, &["unused"]);
    let (app, _) = app_with(BackendDialect::OpenAi, &engine).await;

    let healthy = body_json(
        app.clone()
            .oneshot(get("/healthz"))
            .await
            .expect("request execution"),
    )
    .await;
    assert_eq!(healthy["status"], "ok");
    assert_eq!(healthy["model_loaded"], true);
    assert!(healthy["uptime"].as_f64().is_some_and(|uptime| uptime >= 0.0));

    engine.set_reachable(false);
    let degraded = body_json(app.oneshot(get("/healthz")).await.expect("request execution")).await;
    assert_eq!(degraded["status"], "degraded");
    assert_eq!(degraded["backend"], "degraded");
}

#[tokio::test]
async fn missing_model_leaves_gateway_up_but_not_loaded() {
    let state = build_state(config(&[
        ("GATEWAY_BACKEND", "spawned"),
        ("GATEWAY_MODEL_PATH", "/nonexistent/model.gguf"),
    ]))
    .await
    .expect("gateway starts without a model");
    let app = build_app(state);

    let health = body_json(
        app.clone()
            .oneshot(get("/healthz"))
            .await
            .expect("request execution"),
    )
    .await;
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["model_loaded"], false);
    assert_eq!(health["backend"], "stopped");

    let response = app
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}]}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn exposes_prometheus_metrics() {
    let engine = ScriptedEngine::speaking(BackendDialect::Ollama, &["Hello", " there"]);
    let (app, _) = app_with(BackendDialect::Ollama, &engine).await;

    let response = app
        .clone()
        .oneshot(completion_request(
            r#"{"messages":[{"role":"user","content":"Hi"}]}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/metrics")).await.expect("request execution");
    assert_eq!(response.status(), StatusCode::OK);
    let exposition = body_text(response).await;

    assert!(exposition
        .lines()
        .any(|line| line.starts_with("gateway_requests_total")
            && line.contains("status=\"completed\"")
            && line.ends_with(" 1")));
    assert!(exposition.contains("gateway_generated_tokens_total 2"));
    assert!(exposition.contains("gateway_request_duration_seconds_count"));
    assert!(exposition.contains("gateway_inflight_requests 0"));
}

#[tokio::test]
async fn root_describes_the_service() {
    let engine = ScriptedEngine::speaking(BackendDialect::OpenAi, &["unused"]);
    let (app, _) = app_with(BackendDialect::OpenAi, &engine).await;

    let body = body_json(app.oneshot(get("/")).await.expect("request execution")).await;

    assert_eq!(body["service"], "llm-completion-gateway");
    assert_eq!(body["backend"]["dialect"], "openai");
    assert!(body["endpoints"]
        .as_array()
        .is_some_and(|endpoints| endpoints.iter().any(|item| item == "/v1/chat/completions")));
}
