use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use tokio::sync::watch;

use crate::backend::handle::BackendState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
            Outcome::Rejected => "rejected",
        }
    }
}

pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    generated_tokens_total: IntCounter,
    prompt_tokens_total: IntCounter,
    inflight_requests: IntGauge,
    backend_errors_total: IntCounterVec,
    backend_up: IntGauge,
}

/// Records one request exactly once. Dropping it unfinished counts the
/// request as cancelled, which covers futures abandoned by a disconnect.
pub struct RequestRecorder {
    metrics: Arc<GatewayMetrics>,
    method: &'static str,
    endpoint: &'static str,
    started: Instant,
    recorded: bool,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts!(
                "gateway_requests_total",
                "Requests handled by the gateway, by final outcome"
            ),
            &["method", "endpoint", "status"],
        )
        .expect("valid requests_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Dispatch-to-terminal latency of completed requests",
            )
            .buckets(vec![
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0,
            ]),
            &["endpoint"],
        )
        .expect("valid request_duration_seconds metric");

        let generated_tokens_total = IntCounter::new(
            "gateway_generated_tokens_total",
            "Generated word-tokens delivered to clients",
        )
        .expect("valid generated_tokens_total metric");

        let prompt_tokens_total = IntCounter::new(
            "gateway_prompt_tokens_total",
            "Prompt word-tokens sent to the backend",
        )
        .expect("valid prompt_tokens_total metric");

        let inflight_requests = IntGauge::new(
            "gateway_inflight_requests",
            "Current in-flight requests at gateway",
        )
        .expect("valid inflight_requests metric");

        let backend_errors_total = IntCounterVec::new(
            opts!(
                "gateway_backend_errors_total",
                "Total backend-related errors by stage"
            ),
            &["stage"],
        )
        .expect("valid backend_errors_total metric");

        let backend_up = IntGauge::new(
            "gateway_backend_up",
            "1 when the last backend health probe succeeded",
        )
        .expect("valid backend_up metric");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("register requests_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(generated_tokens_total.clone()))
            .expect("register generated_tokens_total");
        registry
            .register(Box::new(prompt_tokens_total.clone()))
            .expect("register prompt_tokens_total");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(backend_errors_total.clone()))
            .expect("register backend_errors_total");
        registry
            .register(Box::new(backend_up.clone()))
            .expect("register backend_up");

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            generated_tokens_total,
            prompt_tokens_total,
            inflight_requests,
            backend_errors_total,
            backend_up,
        }
    }

    pub fn start_request(
        self: &Arc<Self>,
        method: &'static str,
        endpoint: &'static str,
    ) -> RequestRecorder {
        self.inflight_requests.inc();
        RequestRecorder {
            metrics: self.clone(),
            method,
            endpoint,
            started: Instant::now(),
            recorded: false,
        }
    }

    fn observe_request(
        &self,
        method: &str,
        endpoint: &str,
        outcome: Outcome,
        duration: Duration,
    ) {
        self.requests_total
            .with_label_values(&[method, endpoint, outcome.as_str()])
            .inc();
        if outcome == Outcome::Completed {
            self.request_duration_seconds
                .with_label_values(&[endpoint])
                .observe(duration.as_secs_f64());
        }
    }

    pub fn observe_backend_error(&self, stage: &str) {
        self.backend_errors_total.with_label_values(&[stage]).inc();
    }

    pub fn observe_generated_tokens(&self, tokens: u32) {
        self.generated_tokens_total.inc_by(u64::from(tokens));
    }

    pub fn observe_prompt_tokens(&self, tokens: u32) {
        self.prompt_tokens_total.inc_by(u64::from(tokens));
    }

    pub fn set_backend_up(&self, up: bool) {
        self.backend_up.set(i64::from(up));
    }

    pub fn track_backend(self: &Arc<Self>, mut states: watch::Receiver<BackendState>) {
        let metrics = self.clone();
        tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                metrics.set_backend_up(state == BackendState::Ready);
                if state == BackendState::Stopped || states.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    pub fn backend_up(&self) -> bool {
        self.backend_up.get() == 1
    }

    pub fn request_count(&self, method: &str, endpoint: &str, outcome: Outcome) -> u64 {
        self.requests_total
            .with_label_values(&[method, endpoint, outcome.as_str()])
            .get()
    }

    pub fn generated_tokens(&self) -> u64 {
        self.generated_tokens_total.get()
    }

    pub fn inflight(&self) -> i64 {
        self.inflight_requests.get()
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRecorder {
    pub fn finish(mut self, outcome: Outcome) {
        self.record(outcome);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn record(&mut self, outcome: Outcome) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        self.metrics.inflight_requests.dec();
        self.metrics
            .observe_request(self.method, self.endpoint, outcome, self.started.elapsed());
    }
}

impl Drop for RequestRecorder {
    fn drop(&mut self) {
        self.record(Outcome::Cancelled);
    }
}
