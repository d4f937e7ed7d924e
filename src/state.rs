use std::{sync::Arc, time::Instant};

use crate::{
    backend::handle::BackendHandle, cancel::CancelToken, config::GatewayConfig,
    formatter::PromptFormatter, metrics::GatewayMetrics, proxy::CompletionProxy,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub backend: Arc<BackendHandle>,
    pub proxy: Arc<CompletionProxy>,
    pub metrics: Arc<GatewayMetrics>,
    pub started_at: Instant,
    pub shutdown: CancelToken,
}

impl AppState {
    pub fn new(config: GatewayConfig, backend: Arc<BackendHandle>) -> Self {
        let metrics = Arc::new(GatewayMetrics::new());
        metrics.track_backend(backend.subscribe());

        let shutdown = CancelToken::new();
        let formatter =
            PromptFormatter::new(config.dialect, config.prompt_style, config.context_exchanges);
        let proxy = Arc::new(CompletionProxy::new(
            backend.clone(),
            metrics.clone(),
            formatter,
            config.timeouts,
            shutdown.clone(),
        ));

        Self {
            config: Arc::new(config),
            backend,
            proxy,
            metrics,
            started_at: Instant::now(),
            shutdown,
        }
    }
}
