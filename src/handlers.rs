use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::header::CONTENT_TYPE,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    backend::handle::BackendState,
    errors::{
        GatewayError, OpenAiErrorEnvelope, CANCELLED_MESSAGE, TIMEOUT_MESSAGE,
        UNAVAILABLE_MESSAGE,
    },
    metrics::Outcome,
    models::{ChatCompletionsChunk, CompletionRequest, StreamEvent},
    proxy::COMPLETIONS_ENDPOINT,
    state::AppState,
};

pub async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.config.model_name,
        "backend": {
            "kind": state.backend.kind().as_str(),
            "dialect": state.backend.dialect().as_str(),
        },
        "endpoints": ["/v1/chat/completions", "/healthz", "/metrics"],
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub model_loaded: bool,
    pub uptime: f64,
    pub backend: &'static str,
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthReport> {
    let backend_state = state.backend.check_health().await;
    Json(HealthReport {
        status: if backend_state == BackendState::Ready {
            "ok"
        } else {
            "degraded"
        },
        model_loaded: state.backend.model_loaded(),
        uptime: state.started_at.elapsed().as_secs_f64(),
        backend: backend_state.as_str(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => {
            GatewayError::Internal(format!("metrics render failed: {error}")).into_response()
        }
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Response {
    let request = match payload
        .map_err(|rejection| rejection.body_text())
        .and_then(|Json(request)| request.normalize(&state.config.model_name))
    {
        Ok(request) => request,
        Err(message) => {
            state
                .metrics
                .start_request("POST", COMPLETIONS_ENDPOINT)
                .finish(Outcome::Rejected);
            warn!(reason = %message, "rejected completion request");
            return GatewayError::BadRequest(message).into_response();
        }
    };

    if request.stream {
        return stream_completion(&state, request);
    }

    match state.proxy.complete(request).await {
        Ok(response) => Json(response).into_response(),
        Err(error) => error.into_response(),
    }
}

fn stream_completion(state: &AppState, request: CompletionRequest) -> Response {
    let events = state.proxy.stream(request);
    let id = events.id().to_owned();
    let created = events.created();
    let model = events.model().to_owned();
    debug!(request_id = %id, "opening event stream");

    let outbound =
        events.map(move |event| Ok::<Event, Infallible>(wire_event(&id, created, &model, event)));

    Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
        .into_response()
}

fn wire_event(id: &str, created: i64, model: &str, event: StreamEvent) -> Event {
    let message = Event::default().event("message");
    match event {
        StreamEvent::TokenDelta { content } => json_event(
            message,
            &ChatCompletionsChunk::delta(id, created, model, content),
        ),
        StreamEvent::Done => message.data("[DONE]"),
        StreamEvent::Error { message: text } => {
            let error_type = match text.as_str() {
                CANCELLED_MESSAGE => "cancelled",
                TIMEOUT_MESSAGE => "timeout_error",
                UNAVAILABLE_MESSAGE => "backend_unavailable",
                _ => "backend_error",
            };
            json_event(message, &OpenAiErrorEnvelope::new(text, error_type))
        }
    }
}

fn json_event<T: Serialize>(event: Event, payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(serialized) => event.data(serialized),
        Err(error) => {
            let fallback = json!({
                "error": {
                    "message": format!("serialization error: {error}"),
                    "type": "server_error"
                }
            });
            event.data(fallback.to_string())
        }
    }
}
