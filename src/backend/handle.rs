use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::{
    sync::{watch, Mutex},
    time::{sleep, timeout, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{BackendDialect, BackendError, FrameStream, InferenceBackend},
    cancel::CancelToken,
    config::BackendKind,
    errors::GatewayError,
    supervisor::EngineProcess,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    NotStarted,
    Starting,
    Ready,
    Degraded,
    Stopped,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::NotStarted => "not_started",
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Degraded => "degraded",
            BackendState::Stopped => "stopped",
        }
    }

    fn allows(&self, next: BackendState) -> bool {
        use BackendState::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (NotStarted, Starting) => true,
            (Starting, Ready | Degraded) => true,
            (Ready, Degraded) | (Degraded, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inference engine instance, spawned or remote, shared by all requests.
///
/// The state is advisory: it can change between a check and the call that
/// follows it. Only `Stopped` short-circuits submissions.
pub struct BackendHandle {
    kind: BackendKind,
    dialect: BackendDialect,
    endpoint: String,
    engine: Arc<dyn InferenceBackend>,
    process: Mutex<Option<EngineProcess>>,
    state: watch::Sender<BackendState>,
    startup_error: OnceLock<String>,
    // Set once a health check passes.
    loaded: AtomicBool,
    probe_timeout: Duration,
    shutdown_grace: Duration,
}

impl BackendHandle {
    pub fn remote(
        engine: Arc<dyn InferenceBackend>,
        dialect: BackendDialect,
        endpoint: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self::build(
            BackendKind::Remote,
            engine,
            dialect,
            endpoint.into(),
            None,
            BackendState::NotStarted,
            probe_timeout,
            Duration::ZERO,
        )
    }

    pub fn spawned(
        engine: Arc<dyn InferenceBackend>,
        dialect: BackendDialect,
        endpoint: impl Into<String>,
        process: EngineProcess,
        probe_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self::build(
            BackendKind::Spawned,
            engine,
            dialect,
            endpoint.into(),
            Some(process),
            BackendState::Starting,
            probe_timeout,
            shutdown_grace,
        )
    }

    pub fn failed(
        kind: BackendKind,
        engine: Arc<dyn InferenceBackend>,
        dialect: BackendDialect,
        endpoint: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let handle = Self::build(
            kind,
            engine,
            dialect,
            endpoint.into(),
            None,
            BackendState::Stopped,
            Duration::ZERO,
            Duration::ZERO,
        );
        handle.record_startup_error(reason);
        handle
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        kind: BackendKind,
        engine: Arc<dyn InferenceBackend>,
        dialect: BackendDialect,
        endpoint: String,
        process: Option<EngineProcess>,
        initial: BackendState,
        probe_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            kind,
            dialect,
            endpoint,
            engine,
            process: Mutex::new(process),
            state,
            startup_error: OnceLock::new(),
            loaded: AtomicBool::new(false),
            probe_timeout,
            shutdown_grace,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn dialect(&self) -> BackendDialect {
        self.dialect
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    pub fn state(&self) -> BackendState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.state.subscribe()
    }

    pub fn model_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst) && self.state() != BackendState::Stopped
    }

    pub fn startup_error(&self) -> Option<&str> {
        self.startup_error.get().map(String::as_str)
    }

    pub fn record_startup_error(&self, reason: impl Into<String>) {
        let _ = self.startup_error.set(reason.into());
    }

    fn transition(&self, next: BackendState) -> bool {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next || !current.allows(next) {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });

        if changed {
            match next {
                BackendState::Ready => info!(backend = %self.name(), from = %previous, "backend ready"),
                BackendState::Stopped => info!(backend = %self.name(), from = %previous, "backend stopped"),
                _ => warn!(backend = %self.name(), from = %previous, to = %next, "backend state changed"),
            }
        }
        changed
    }

    pub async fn activate(&self) -> BackendState {
        self.transition(BackendState::Starting);
        self.check_health().await
    }

    pub async fn wait_until_ready(
        &self,
        limit: Duration,
        poll_interval: Duration,
    ) -> Result<(), GatewayError> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(status) = self.process_exit_status().await {
                return Err(GatewayError::BackendUnavailable(format!(
                    "engine exited during startup with {status}"
                )));
            }

            match timeout(self.probe_timeout, self.engine.probe()).await {
                Ok(Ok(())) => {
                    self.loaded.store(true, Ordering::SeqCst);
                    self.transition(BackendState::Ready);
                    return Ok(());
                }
                Ok(Err(error)) => debug!(backend = %self.name(), %error, "startup probe failed"),
                Err(_) => debug!(backend = %self.name(), "startup probe timed out"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(GatewayError::Timeout(format!(
                    "engine did not become ready within {}s",
                    limit.as_secs_f64()
                )));
            }
            sleep(poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn check_health(&self) -> BackendState {
        match self.state() {
            BackendState::Stopped | BackendState::NotStarted => return self.state(),
            _ => {}
        }

        if let Some(status) = self.process_exit_status().await {
            error!(backend = %self.name(), %status, "engine process exited");
            self.record_startup_error(format!("engine process exited with {status}"));
            self.stop().await;
            return self.state();
        }

        let healthy = match timeout(self.probe_timeout, self.engine.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                debug!(backend = %self.name(), %error, "health probe failed");
                false
            }
            Err(_) => {
                debug!(backend = %self.name(), "health probe timed out");
                false
            }
        };

        if healthy {
            self.loaded.store(true, Ordering::SeqCst);
        }
        self.transition(if healthy {
            BackendState::Ready
        } else {
            BackendState::Degraded
        });
        self.state()
    }

    pub fn mark_degraded(&self, reason: &str) {
        if self.state() == BackendState::Ready {
            debug!(backend = %self.name(), reason, "marking backend degraded");
            self.transition(BackendState::Degraded);
        }
    }

    pub async fn submit(&self, payload: &Value) -> Result<Value, BackendError> {
        self.ensure_not_stopped()?;
        self.engine.submit(payload).await
    }

    pub async fn submit_stream(&self, payload: &Value) -> Result<FrameStream, BackendError> {
        self.ensure_not_stopped()?;
        self.engine.submit_stream(payload).await
    }

    fn ensure_not_stopped(&self) -> Result<(), BackendError> {
        if self.state() == BackendState::Stopped {
            return Err(BackendError::Unavailable(format!(
                "backend {} is stopped",
                self.name()
            )));
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            process.terminate(self.shutdown_grace).await;
        }
        self.transition(BackendState::Stopped);
    }

    async fn process_exit_status(&self) -> Option<String> {
        let mut process = self.process.lock().await;
        process
            .as_mut()
            .and_then(EngineProcess::exit_status)
            .map(|status| status.to_string())
    }

    pub fn spawn_health_checks(self: Arc<Self>, interval: Duration, shutdown: CancelToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                if self.check_health().await == BackendState::Stopped {
                    break;
                }
            }
            debug!(backend = %self.name(), "health checks finished");
        });
    }
}
