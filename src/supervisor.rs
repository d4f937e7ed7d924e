use std::{
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{
        handle::BackendHandle, http::HttpEngine, BackendDialect, BackendError, FrameStream,
        InferenceBackend,
    },
    config::{BackendKind, EngineConfig, GatewayConfig, Timeouts},
    errors::GatewayError,
};

pub struct ProcessSupervisor {
    engine: EngineConfig,
    dialect: BackendDialect,
    health_path: String,
    timeouts: Timeouts,
}

impl ProcessSupervisor {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            engine: config.engine.clone(),
            dialect: config.dialect,
            health_path: config.health_path.clone(),
            timeouts: config.timeouts,
        }
    }

    pub async fn start(&self) -> BackendHandle {
        let base_url = self.engine.base_url();
        let engine: Arc<dyn InferenceBackend> = match HttpEngine::new(
            &base_url,
            self.dialect,
            &self.health_path,
            self.timeouts.probe,
        ) {
            Ok(engine) => Arc::new(engine),
            Err(reason) => return self.failed_without_client(base_url, reason),
        };

        let process = match self.launch() {
            Ok(process) => process,
            Err(error) => {
                error!(%error, "engine launch failed");
                return BackendHandle::failed(
                    BackendKind::Spawned,
                    engine,
                    self.dialect,
                    base_url,
                    error.to_string(),
                );
            }
        };

        info!(
            pid = process.id(),
            binary = %self.engine.binary.display(),
            model = %self.engine.model_path.display(),
            endpoint = %base_url,
            "engine process spawned"
        );

        let handle = BackendHandle::spawned(
            engine,
            self.dialect,
            base_url,
            process,
            self.timeouts.probe,
            self.timeouts.shutdown_grace,
        );

        if let Err(error) = handle
            .wait_until_ready(self.timeouts.startup, self.timeouts.startup_poll)
            .await
        {
            error!(%error, "engine failed to start");
            handle.record_startup_error(error.to_string());
            handle.stop().await;
        }
        handle
    }

    fn failed_without_client(&self, base_url: String, reason: String) -> BackendHandle {
        error!(%reason, "engine client could not be built");
        let placeholder = UnreachableEngine(base_url.clone());
        BackendHandle::failed(
            BackendKind::Spawned,
            Arc::new(placeholder),
            self.dialect,
            base_url,
            reason,
        )
    }

    pub fn launch(&self) -> Result<EngineProcess, GatewayError> {
        if !self.engine.model_path.is_file() {
            return Err(GatewayError::Config(format!(
                "model file {} does not exist",
                self.engine.model_path.display()
            )));
        }

        let mut command = Command::new(&self.engine.binary);
        command
            .arg("-m")
            .arg(&self.engine.model_path)
            .arg("--host")
            .arg(&self.engine.host)
            .arg("--port")
            .arg(self.engine.port.to_string())
            .arg("-t")
            .arg(self.engine.threads.to_string())
            .arg("-c")
            .arg(self.engine.ctx_size.to_string())
            .arg("-ngl")
            .arg(self.engine.gpu_layers.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|error| {
            GatewayError::Config(format!(
                "failed to spawn engine {}: {error}",
                self.engine.binary.display()
            ))
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        Ok(EngineProcess::new(child))
    }
}

fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "engine", stream, "{line}");
        }
    });
}

pub struct EngineProcess {
    child: Child,
    group: Option<i32>,
}

impl EngineProcess {
    fn new(child: Child) -> Self {
        let group = child.id().and_then(|pid| i32::try_from(pid).ok());
        Self { child, group }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(error) => {
                warn!(%error, "could not poll engine process");
                None
            }
        }
    }

    // SIGTERM to the whole group, then SIGKILL once `grace` runs out.
    pub async fn terminate(mut self, grace: Duration) {
        if let Some(status) = self.exit_status() {
            debug!(%status, "engine already exited");
            self.kill_group();
            return;
        }

        self.signal_graceful();
        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "engine exited"),
            Ok(Err(error)) => warn!(%error, "failed waiting for engine exit"),
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "engine ignored shutdown request; killing"
                );
                self.kill_group();
                if let Err(error) = self.child.kill().await {
                    warn!(%error, "failed to kill engine");
                }
            }
        }
        // Reap anything the engine forked into its group.
        self.kill_group();
    }

    #[cfg(unix)]
    fn signal_graceful(&mut self) {
        self.signal_group(nix::sys::signal::Signal::SIGTERM);
    }

    #[cfg(not(unix))]
    fn signal_graceful(&mut self) {
        let _ = self.child.start_kill();
    }

    #[cfg(unix)]
    fn kill_group(&mut self) {
        self.signal_group(nix::sys::signal::Signal::SIGKILL);
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) {
        let _ = self.child.start_kill();
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::{errno::Errno, sys::signal::killpg, unistd::Pid};

        let Some(group) = self.group else {
            return;
        };
        match killpg(Pid::from_raw(group), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(error) => warn!(%error, %signal, group, "failed to signal engine group"),
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if self.exit_status().is_none() {
            self.kill_group();
        }
    }
}

struct UnreachableEngine(String);

#[async_trait]
impl InferenceBackend for UnreachableEngine {
    fn name(&self) -> &str {
        &self.0
    }

    async fn submit(&self, _payload: &Value) -> Result<Value, BackendError> {
        Err(unreachable_engine())
    }

    async fn submit_stream(&self, _payload: &Value) -> Result<FrameStream, BackendError> {
        Err(unreachable_engine())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        Err(unreachable_engine())
    }
}

fn unreachable_engine() -> BackendError {
    BackendError::Unavailable("engine client unavailable".to_owned())
}
