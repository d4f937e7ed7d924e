pub mod handle;
pub mod http;
pub mod mock;

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::formatter::PromptStyle;

pub type FrameStream = BoxStream<'static, Result<Bytes, BackendError>>;

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn submit(&self, payload: &Value) -> Result<Value, BackendError>;
    async fn submit_stream(&self, payload: &Value) -> Result<FrameStream, BackendError>;
    async fn probe(&self) -> Result<(), BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendDialect {
    LlamaCpp,
    Ollama,
    OpenAi,
}

impl BackendDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendDialect::LlamaCpp => "llamacpp",
            BackendDialect::Ollama => "ollama",
            BackendDialect::OpenAi => "openai",
        }
    }

    pub fn completion_path(&self) -> &'static str {
        match self {
            BackendDialect::LlamaCpp => "/completion",
            BackendDialect::Ollama => "/api/generate",
            BackendDialect::OpenAi => "/v1/chat/completions",
        }
    }

    pub fn default_health_path(&self) -> &'static str {
        match self {
            BackendDialect::LlamaCpp => "/health",
            BackendDialect::Ollama => "/api/version",
            BackendDialect::OpenAi => "/healthz",
        }
    }

    pub fn default_prompt_style(&self) -> PromptStyle {
        match self {
            BackendDialect::LlamaCpp | BackendDialect::OpenAi => PromptStyle::Llama3,
            BackendDialect::Ollama => PromptStyle::Plain,
        }
    }
}

impl fmt::Display for BackendDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendDialect {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "llamacpp" | "llama.cpp" | "llama-cpp" => Ok(BackendDialect::LlamaCpp),
            "ollama" => Ok(BackendDialect::Ollama),
            "openai" | "openai-compat" => Ok(BackendDialect::OpenAi),
            other => Err(format!("unknown backend dialect `{other}`")),
        }
    }
}
