use llm_completion_gateway::{build_app, build_state, cancel::CancelToken, config::GatewayConfig};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,llm_completion_gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env()?;
    let addr = config.listen_addr;
    let state = build_state(config).await?;
    let backend = state.backend.clone();
    let shutdown = state.shutdown.clone();
    let app = build_app(state);

    let served = serve(addr, app, shutdown.clone()).await;
    if let Err(error) = &served {
        error!(%error, "server stopped with an error");
    }

    shutdown.cancel();
    backend.stop().await;
    info!("gateway stopped");
    served
}

async fn serve(
    addr: std::net::SocketAddr,
    app: axum::Router,
    shutdown: CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let reason = shutdown_signal().await;
            info!(signal = reason, "shutting down");
            // Open streams end with an error event so connections can drain.
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            error!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "ctrl-c",
        _ = terminate => "sigterm",
    }
}
