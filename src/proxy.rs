use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::{sync::mpsc, time::timeout};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{handle::BackendHandle, BackendDialect},
    cancel::{CancelOnDrop, CancelToken},
    config::Timeouts,
    errors::{GatewayError, CANCELLED_MESSAGE, PROTOCOL_MESSAGE},
    formatter::PromptFormatter,
    metrics::{GatewayMetrics, Outcome, RequestRecorder},
    models::{word_tokens, CompletionRequest, CompletionResponse, StreamEvent, Usage},
    translator::{translate_reply, StreamTranslator},
};

pub const COMPLETIONS_ENDPOINT: &str = "/v1/chat/completions";

const EVENT_BUFFER: usize = 32;

pub struct CompletionProxy {
    handle: Arc<BackendHandle>,
    metrics: Arc<GatewayMetrics>,
    formatter: PromptFormatter,
    timeouts: Timeouts,
    shutdown: CancelToken,
}

impl CompletionProxy {
    pub fn new(
        handle: Arc<BackendHandle>,
        metrics: Arc<GatewayMetrics>,
        formatter: PromptFormatter,
        timeouts: Timeouts,
        shutdown: CancelToken,
    ) -> Self {
        Self {
            handle,
            metrics,
            formatter,
            timeouts,
            shutdown,
        }
    }

    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        let recorder = self.metrics.start_request("POST", COMPLETIONS_ENDPOINT);
        let request_id = completion_id();
        let prompt = self.formatter.format(&request);
        self.metrics.observe_prompt_tokens(prompt.prompt_tokens);
        info!(
            request_id = %request_id,
            backend = %self.handle.name(),
            model = %request.model,
            stream = false,
            retained_turns = prompt.retained.len(),
            prompt_tokens = prompt.prompt_tokens,
            "completion dispatched"
        );

        let reply = match timeout(self.timeouts.request, self.handle.submit(&prompt.payload)).await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => return Err(self.fail(recorder, &request_id, "submit", error.into())),
            Err(_) => {
                let error = GatewayError::Timeout(format!(
                    "no reply within {}s",
                    self.timeouts.request.as_secs_f64()
                ));
                return Err(self.fail(recorder, &request_id, "submit", error));
            }
        };

        let content = match translate_reply(self.handle.dialect(), &reply) {
            Ok(content) => content,
            Err(error) => return Err(self.fail(recorder, &request_id, "translate", error)),
        };

        let usage = Usage::new(prompt.prompt_tokens, word_tokens(&content));
        self.metrics.observe_generated_tokens(usage.completion_tokens);
        info!(
            request_id = %request_id,
            completion_tokens = usage.completion_tokens,
            elapsed_ms = recorder.elapsed().as_millis() as u64,
            "completion finished"
        );
        recorder.finish(Outcome::Completed);

        Ok(CompletionResponse::assistant(
            request_id,
            unix_timestamp(),
            request.model,
            content,
            usage,
        ))
    }

    fn fail(
        &self,
        recorder: RequestRecorder,
        request_id: &str,
        stage: &'static str,
        error: GatewayError,
    ) -> GatewayError {
        self.metrics.observe_backend_error(stage);
        if error.degrades_backend() {
            self.handle.mark_degraded(&error.to_string());
        }
        warn!(
            request_id,
            backend = %self.handle.name(),
            stage,
            error = %error,
            "completion failed"
        );
        recorder.finish(Outcome::Failed);
        error
    }

    pub fn stream(&self, request: CompletionRequest) -> EventStream {
        let recorder = self.metrics.start_request("POST", COMPLETIONS_ENDPOINT);
        let request_id = completion_id();
        let prompt = self.formatter.format(&request);
        self.metrics.observe_prompt_tokens(prompt.prompt_tokens);
        info!(
            request_id = %request_id,
            backend = %self.handle.name(),
            model = %request.model,
            stream = true,
            retained_turns = prompt.retained.len(),
            prompt_tokens = prompt.prompt_tokens,
            "completion dispatched"
        );

        let cancel = self.shutdown.child();
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let pump = StreamPump {
            handle: self.handle.clone(),
            metrics: self.metrics.clone(),
            dialect: self.handle.dialect(),
            chunk_timeout: self.timeouts.chunk,
            request_id: request_id.clone(),
            cancel: cancel.clone(),
            events,
        };
        tokio::spawn(pump.run(prompt.payload, recorder));

        EventStream {
            id: request_id,
            created: unix_timestamp(),
            model: request.model,
            events: ReceiverStream::new(receiver),
            finished: false,
            _scope: CancelOnDrop::new(cancel),
        }
    }
}

struct StreamPump {
    handle: Arc<BackendHandle>,
    metrics: Arc<GatewayMetrics>,
    dialect: BackendDialect,
    chunk_timeout: Duration,
    request_id: String,
    cancel: CancelToken,
    events: mpsc::Sender<StreamEvent>,
}

impl StreamPump {
    async fn run(self, payload: Value, recorder: RequestRecorder) {
        let (outcome, completion_tokens) = self.drive(&payload).await;
        info!(
            request_id = %self.request_id,
            outcome = outcome.as_str(),
            completion_tokens,
            elapsed_ms = recorder.elapsed().as_millis() as u64,
            "stream finished"
        );
        recorder.finish(outcome);
    }

    async fn drive(&self, payload: &Value) -> (Outcome, u32) {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return (self.cancelled(), 0),
            opened = timeout(self.chunk_timeout, self.handle.submit_stream(payload)) => opened,
        };
        let mut frames = match opened {
            Ok(Ok(frames)) => frames,
            Ok(Err(error)) => return (self.fail("stream_open", error.into()).await, 0),
            Err(_) => return (self.fail("stream_open", self.chunk_timed_out()).await, 0),
        };
        debug!(request_id = %self.request_id, "backend stream opened");

        let mut translator = StreamTranslator::new(self.dialect);
        let mut counted = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return (self.cancelled(), counted),
                next = timeout(self.chunk_timeout, frames.next()) => next,
            };

            let events = match next {
                Ok(Some(Ok(chunk))) => translator.push(&chunk),
                Ok(Some(Err(error))) => {
                    return (self.fail("stream_read", error.into()).await, counted)
                }
                Ok(None) => translator.finish(),
                Err(_) => return (self.fail("stream_read", self.chunk_timed_out()).await, counted),
            };

            let total = translator.completion_tokens();
            self.metrics
                .observe_generated_tokens(total.saturating_sub(counted));
            counted = total;

            for event in events {
                let terminal = event.is_terminal();
                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return (self.cancelled(), counted),
                    sent = self.events.send(event) => sent,
                };
                if sent.is_err() {
                    return (self.cancelled(), counted);
                }
                if !terminal {
                    continue;
                }
                return match translator.failure() {
                    Some(detail) => {
                        self.metrics.observe_backend_error("stream_protocol");
                        warn!(
                            request_id = %self.request_id,
                            backend = %self.handle.name(),
                            detail,
                            "backend stream was malformed"
                        );
                        (Outcome::Failed, counted)
                    }
                    None => (Outcome::Completed, counted),
                };
            }
        }
    }

    fn chunk_timed_out(&self) -> GatewayError {
        GatewayError::Timeout(format!(
            "no backend output within {}s",
            self.chunk_timeout.as_secs_f64()
        ))
    }

    async fn fail(&self, stage: &'static str, error: GatewayError) -> Outcome {
        self.metrics.observe_backend_error(stage);
        if error.degrades_backend() {
            self.handle.mark_degraded(&error.to_string());
        }
        warn!(
            request_id = %self.request_id,
            backend = %self.handle.name(),
            stage,
            error = %error,
            "stream failed"
        );
        // A reader that stopped polling must not hold up cancellation.
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.events.send(StreamEvent::error(error.client_message())) => {}
        }
        Outcome::Failed
    }

    fn cancelled(&self) -> Outcome {
        // Only delivered when the client side is still listening.
        let _ = self.events.try_send(StreamEvent::error(CANCELLED_MESSAGE));
        info!(request_id = %self.request_id, "stream cancelled");
        Outcome::Cancelled
    }
}

/// Canonical events for one streamed completion, ending with exactly one
/// terminal event. Dropping it cancels the backend call.
pub struct EventStream {
    id: String,
    created: i64,
    model: String,
    events: ReceiverStream<StreamEvent>,
    finished: bool,
    _scope: CancelOnDrop,
}

impl EventStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.events).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                this.finished = event.is_terminal();
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(StreamEvent::error(PROTOCOL_MESSAGE)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

fn unix_timestamp() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            handle::BackendState,
            mock::{text_frame, ScriptedEngine},
        },
        errors::TIMEOUT_MESSAGE,
        formatter::PromptStyle,
        models::{ChatMessage, FinishReason},
    };

    struct Fixture {
        engine: ScriptedEngine,
        handle: Arc<BackendHandle>,
        metrics: Arc<GatewayMetrics>,
        shutdown: CancelToken,
        proxy: CompletionProxy,
    }

    async fn fixture(dialect: BackendDialect, engine: ScriptedEngine, chunk: Duration) -> Fixture {
        let timeouts = Timeouts {
            request: Duration::from_secs(2),
            chunk,
            ..Timeouts::default()
        };
        fixture_with(dialect, engine, timeouts).await
    }

    async fn fixture_with(
        dialect: BackendDialect,
        engine: ScriptedEngine,
        timeouts: Timeouts,
    ) -> Fixture {
        let handle = Arc::new(BackendHandle::remote(
            Arc::new(engine.clone()),
            dialect,
            "http://engine.test",
            Duration::from_millis(200),
        ));
        handle.activate().await;
        let metrics = Arc::new(GatewayMetrics::new());
        let shutdown = CancelToken::new();
        let proxy = CompletionProxy::new(
            handle.clone(),
            metrics.clone(),
            PromptFormatter::new(dialect, PromptStyle::Llama3, 3),
            timeouts,
            shutdown.clone(),
        );
        Fixture {
            engine,
            handle,
            metrics,
            shutdown,
            proxy,
        }
    }

    fn request(stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: "llama-3.1-8b-instruct".to_owned(),
            conversation: vec![ChatMessage::user("Hi")],
            temperature: 0.7,
            max_tokens: 64,
            stream,
            context: None,
        }
    }

    async fn wait_for_count(metrics: &GatewayMetrics, outcome: Outcome) -> u64 {
        for _ in 0..100 {
            let count = metrics.request_count("POST", COMPLETIONS_ENDPOINT, outcome);
            if count > 0 {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        0
    }

    #[tokio::test]
    async fn non_streaming_reply_carries_usage() {
        let engine = ScriptedEngine::speaking(BackendDialect::LlamaCpp, &["Hello", " there"]);
        let fx = fixture(BackendDialect::LlamaCpp, engine, Duration::from_secs(2)).await;

        let response = fx.proxy.complete(request(false)).await.expect("completes");

        assert!(response.id.starts_with("chatcmpl-"));
        assert_eq!(response.choices.len(), 1);
        assert_eq!(response.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(response.choices[0].message.content, "Hello there");
        assert_eq!(response.usage.completion_tokens, 2);
        assert_eq!(
            response.usage.total_tokens,
            response.usage.prompt_tokens + response.usage.completion_tokens
        );
        assert_eq!(
            fx.metrics
                .request_count("POST", COMPLETIONS_ENDPOINT, Outcome::Completed),
            1
        );
        assert_eq!(fx.metrics.generated_tokens(), 2);
    }

    #[tokio::test]
    async fn unreachable_backend_fails_and_degrades_handle() {
        let engine = ScriptedEngine::speaking(BackendDialect::OpenAi, &["Hello"]);
        let fx = fixture(BackendDialect::OpenAi, engine, Duration::from_secs(2)).await;
        fx.engine.set_reachable(false);

        let error = fx
            .proxy
            .complete(request(false))
            .await
            .expect_err("backend is down");

        assert!(matches!(error, GatewayError::BackendUnavailable(_)));
        assert_eq!(fx.handle.state(), BackendState::Degraded);
        assert_eq!(
            fx.metrics
                .request_count("POST", COMPLETIONS_ENDPOINT, Outcome::Failed),
            1
        );
    }

    #[tokio::test]
    async fn stalled_reply_times_out_and_degrades_handle() {
        let engine = ScriptedEngine::speaking(BackendDialect::LlamaCpp, &["Hello"]).stalling();
        let timeouts = Timeouts {
            request: Duration::from_millis(100),
            chunk: Duration::from_secs(2),
            ..Timeouts::default()
        };
        let fx = fixture_with(BackendDialect::LlamaCpp, engine, timeouts).await;

        let error = fx
            .proxy
            .complete(request(false))
            .await
            .expect_err("reply never arrives");

        assert!(matches!(error, GatewayError::Timeout(_)));
        assert_eq!(error.status(), axum::http::StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(error.error_type(), "timeout_error");
        assert_eq!(fx.handle.state(), BackendState::Degraded);
        assert_eq!(
            fx.metrics
                .request_count("POST", COMPLETIONS_ENDPOINT, Outcome::Failed),
            1
        );
    }

    #[tokio::test]
    async fn stream_relays_deltas_then_done() {
        let engine = ScriptedEngine::speaking(BackendDialect::Ollama, &["Hello", " there"]);
        let fx = fixture(BackendDialect::Ollama, engine, Duration::from_secs(2)).await;

        let events = fx.proxy.stream(request(true)).collect::<Vec<_>>().await;

        assert_eq!(
            events,
            vec![
                StreamEvent::delta("Hello"),
                StreamEvent::delta(" there"),
                StreamEvent::Done
            ]
        );
        assert_eq!(wait_for_count(&fx.metrics, Outcome::Completed).await, 1);
        assert_eq!(fx.metrics.generated_tokens(), 2);
    }

    #[tokio::test]
    async fn stream_without_sentinel_ends_in_error() {
        let frames = vec![
            text_frame(BackendDialect::LlamaCpp, "Hello"),
            text_frame(BackendDialect::LlamaCpp, " there"),
        ];
        let engine = ScriptedEngine::new(Value::Null, frames);
        let fx = fixture(BackendDialect::LlamaCpp, engine, Duration::from_secs(2)).await;

        let events = fx.proxy.stream(request(true)).collect::<Vec<_>>().await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[2], StreamEvent::error(PROTOCOL_MESSAGE));
        assert!(!events.contains(&StreamEvent::Done));
        assert_eq!(wait_for_count(&fx.metrics, Outcome::Failed).await, 1);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_backend_call() {
        let engine =
            ScriptedEngine::new(Value::Null, vec![text_frame(BackendDialect::OpenAi, "Hello")])
                .hanging();
        let fx = fixture(BackendDialect::OpenAi, engine, Duration::from_secs(30)).await;

        let mut stream = fx.proxy.stream(request(true));
        assert_eq!(stream.next().await, Some(StreamEvent::delta("Hello")));
        drop(stream);

        assert!(fx.engine.wait_released(Duration::from_secs(1)).await);
        assert_eq!(wait_for_count(&fx.metrics, Outcome::Cancelled).await, 1);
        assert_eq!(
            fx.metrics
                .request_count("POST", COMPLETIONS_ENDPOINT, Outcome::Failed),
            0
        );
    }

    #[tokio::test]
    async fn shutdown_ends_open_streams_with_an_error() {
        let engine =
            ScriptedEngine::new(Value::Null, vec![text_frame(BackendDialect::OpenAi, "Hello")])
                .hanging();
        let fx = fixture(BackendDialect::OpenAi, engine, Duration::from_secs(30)).await;

        let mut stream = fx.proxy.stream(request(true));
        assert_eq!(stream.next().await, Some(StreamEvent::delta("Hello")));
        fx.shutdown.cancel();

        assert_eq!(stream.next().await, Some(StreamEvent::error(CANCELLED_MESSAGE)));
        assert_eq!(stream.next().await, None);
        assert!(fx.engine.wait_released(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn shutdown_releases_backend_while_client_is_not_reading() {
        let frames = (0..EVENT_BUFFER * 3)
            .map(|_| text_frame(BackendDialect::OpenAi, "word "))
            .collect();
        let engine = ScriptedEngine::new(Value::Null, frames)
            .with_frame_delay(Duration::ZERO)
            .hanging();
        let fx = fixture(BackendDialect::OpenAi, engine, Duration::from_secs(30)).await;

        let stream = fx.proxy.stream(request(true));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!fx.engine.stream_released());
        fx.shutdown.cancel();

        assert!(fx.engine.wait_released(Duration::from_secs(2)).await);
        assert_eq!(wait_for_count(&fx.metrics, Outcome::Cancelled).await, 1);
        drop(stream);
    }

    #[tokio::test]
    async fn silent_backend_hits_the_chunk_timeout() {
        let engine = ScriptedEngine::new(Value::Null, Vec::new()).hanging();
        let fx = fixture(BackendDialect::LlamaCpp, engine, Duration::from_millis(50)).await;

        let events = fx.proxy.stream(request(true)).collect::<Vec<_>>().await;

        assert_eq!(events, vec![StreamEvent::error(TIMEOUT_MESSAGE)]);
        assert_eq!(fx.handle.state(), BackendState::Degraded);
        assert!(fx.engine.wait_released(Duration::from_secs(1)).await);
    }
}
