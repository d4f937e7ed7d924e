use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, thread, time::Duration};

use crate::{backend::BackendDialect, errors::GatewayError, formatter::PromptStyle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Spawned,
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Spawned => "spawned",
            BackendKind::Remote => "remote",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "spawned" | "local" => Ok(BackendKind::Spawned),
            "remote" => Ok(BackendKind::Remote),
            other => Err(format!("unknown backend kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub binary: PathBuf,
    pub model_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub threads: usize,
    pub ctx_size: u32,
    pub gpu_layers: u32,
}

impl EngineConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub request: Duration,
    pub chunk: Duration,
    pub probe: Duration,
    pub startup: Duration,
    pub startup_poll: Duration,
    pub shutdown_grace: Duration,
    pub health_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            chunk: Duration::from_secs(30),
            probe: Duration::from_millis(2_000),
            startup: Duration::from_secs(10),
            startup_poll: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(5),
            health_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub backend: BackendKind,
    pub dialect: BackendDialect,
    pub prompt_style: PromptStyle,
    pub model_name: String,
    pub engine: EngineConfig,
    pub remote_base_url: String,
    pub health_path: String,
    pub context_exchanges: usize,
    pub timeouts: Timeouts,
    pub cors_origins: Vec<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let listen_addr: SocketAddr =
            parse_or(&get, "GATEWAY_LISTEN_ADDR", "0.0.0.0:8080".parse().ok())?;
        let backend: BackendKind = parse_or(&get, "GATEWAY_BACKEND", Some(BackendKind::Remote))?;
        let default_dialect = match backend {
            BackendKind::Spawned => BackendDialect::LlamaCpp,
            BackendKind::Remote => BackendDialect::OpenAi,
        };
        let dialect: BackendDialect =
            parse_or(&get, "GATEWAY_BACKEND_DIALECT", Some(default_dialect))?;
        let prompt_style =
            parse_or(&get, "GATEWAY_PROMPT_STYLE", Some(dialect.default_prompt_style()))?;

        let engine = EngineConfig {
            binary: PathBuf::from(
                get("GATEWAY_ENGINE_BINARY").unwrap_or_else(|| "llama-server".to_owned()),
            ),
            model_path: PathBuf::from(
                get("GATEWAY_MODEL_PATH")
                    .unwrap_or_else(|| "models/llama-3.1-8b-instruct.Q4_K_M.gguf".to_owned()),
            ),
            host: get("GATEWAY_ENGINE_HOST").unwrap_or_else(|| "127.0.0.1".to_owned()),
            port: parse_or(&get, "GATEWAY_ENGINE_PORT", Some(8081))?,
            threads: parse_or(
                &get,
                "GATEWAY_ENGINE_THREADS",
                Some(
                    thread::available_parallelism()
                        .map(|count| count.get())
                        .unwrap_or(4),
                ),
            )?,
            ctx_size: parse_or(&get, "GATEWAY_ENGINE_CTX_SIZE", Some(4096))?,
            gpu_layers: parse_or(&get, "GATEWAY_ENGINE_GPU_LAYERS", Some(0))?,
        };

        let remote_base_url = get("OPENAI_COMPAT_BASE_URL")
            .unwrap_or_else(|| "http://llm:8001".to_owned())
            .trim_end_matches('/')
            .to_owned();
        reqwest::Url::parse(&remote_base_url).map_err(|error| {
            GatewayError::Config(format!(
                "invalid value for OPENAI_COMPAT_BASE_URL `{remote_base_url}`: {error}"
            ))
        })?;

        let health_path = get("GATEWAY_BACKEND_HEALTH_PATH")
            .unwrap_or_else(|| dialect.default_health_path().to_owned());
        let health_path = if health_path.starts_with('/') {
            health_path
        } else {
            format!("/{health_path}")
        };

        let context_exchanges: usize = parse_or(&get, "GATEWAY_CONTEXT_EXCHANGES", Some(3))?;
        if context_exchanges == 0 {
            return Err(GatewayError::Config(
                "GATEWAY_CONTEXT_EXCHANGES must be greater than zero".to_owned(),
            ));
        }

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            request: secs(&get, "GATEWAY_REQUEST_TIMEOUT_SECS", defaults.request)?,
            chunk: secs(&get, "GATEWAY_CHUNK_TIMEOUT_SECS", defaults.chunk)?,
            probe: millis(&get, "GATEWAY_PROBE_TIMEOUT_MS", defaults.probe)?,
            startup: secs(&get, "GATEWAY_STARTUP_TIMEOUT_SECS", defaults.startup)?,
            startup_poll: millis(&get, "GATEWAY_STARTUP_POLL_MS", defaults.startup_poll)?,
            shutdown_grace: secs(&get, "GATEWAY_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            health_interval: secs(&get, "GATEWAY_HEALTH_INTERVAL_SECS", defaults.health_interval)?,
        };

        let cors_origins = get("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_owned())
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(ToOwned::to_owned)
            .collect();

        Ok(Self {
            listen_addr,
            backend,
            dialect,
            prompt_style,
            model_name: get("GATEWAY_MODEL_NAME")
                .unwrap_or_else(|| "llama-3.1-8b-instruct".to_owned()),
            engine,
            remote_base_url,
            health_path,
            context_exchanges,
            timeouts,
            cors_origins,
        })
    }
}

fn parse_or<G, T>(get: &G, name: &str, default: Option<T>) -> Result<T, GatewayError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(value) => value.parse::<T>().map_err(|error| {
            GatewayError::Config(format!("invalid value for {name} `{value}`: {error}"))
        }),
        None => default.ok_or_else(|| GatewayError::Config(format!("{name} is required"))),
    }
}

fn secs<G>(get: &G, name: &str, default: Duration) -> Result<Duration, GatewayError>
where
    G: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(get, name, Some(default.as_secs()))?;
    non_zero(name, Duration::from_secs(value))
}

fn millis<G>(get: &G, name: &str, default: Duration) -> Result<Duration, GatewayError>
where
    G: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(get, name, Some(default.as_millis() as u64))?;
    non_zero(name, Duration::from_millis(value))
}

fn non_zero(name: &str, duration: Duration) -> Result<Duration, GatewayError> {
    if duration.is_zero() {
        return Err(GatewayError::Config(format!("{name} must be greater than zero")));
    }
    Ok(duration)
}
