pub mod backend;
pub mod cancel;
pub mod config;
pub mod errors;
pub mod formatter;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod state;
pub mod supervisor;
pub mod translator;

use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use backend::{handle::BackendHandle, http::HttpEngine};
use config::{BackendKind, GatewayConfig};
use errors::GatewayError;
use supervisor::ProcessSupervisor;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub async fn build_state(config: GatewayConfig) -> Result<state::AppState, GatewayError> {
    let backend = match config.backend {
        BackendKind::Spawned => Arc::new(ProcessSupervisor::new(&config).start().await),
        BackendKind::Remote => {
            let engine = HttpEngine::new(
                &config.remote_base_url,
                config.dialect,
                &config.health_path,
                config.timeouts.probe,
            )
            .map_err(GatewayError::Config)?;
            let handle = Arc::new(BackendHandle::remote(
                Arc::new(engine),
                config.dialect,
                config.remote_base_url.clone(),
                config.timeouts.probe,
            ));
            handle.activate().await;
            handle
        }
    };

    if let Some(reason) = backend.startup_error() {
        warn!(%reason, "serving without a usable backend");
    }
    info!(
        backend = %backend.name(),
        kind = backend.kind().as_str(),
        dialect = %backend.dialect(),
        endpoint = backend.endpoint(),
        state = %backend.state(),
        "backend configured"
    );

    let state = state::AppState::new(config, backend);
    state.backend.clone().spawn_health_checks(
        state.config.timeouts.health_interval,
        state.shutdown.clone(),
    );
    Ok(state)
}

pub fn build_app(state: state::AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let allowed = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    layer.allow_origin(AllowOrigin::list(allowed))
}
