use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::backend::{BackendDialect, BackendError, FrameStream, InferenceBackend};

#[derive(Clone)]
pub struct HttpEngine {
    client: reqwest::Client,
    name: String,
    base_url: String,
    dialect: BackendDialect,
    health_path: String,
    probe_timeout: Duration,
}

impl HttpEngine {
    pub fn new(
        base_url: &str,
        dialect: BackendDialect,
        health_path: &str,
        probe_timeout: Duration,
    ) -> Result<Self, String> {
        // Connect timeout only; the proxy bounds each wait.
        let client = reqwest::Client::builder()
            .connect_timeout(probe_timeout)
            .build()
            .map_err(|error| format!("failed to build backend HTTP client: {error}"))?;

        let base_url = base_url.trim_end_matches('/').to_owned();
        Ok(Self {
            client,
            name: format!("{dialect}@{base_url}"),
            base_url,
            dialect,
            health_path: health_path.to_owned(),
            probe_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(self.url(self.dialect.completion_path()))
            .json(payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(map_http_error(
                response.status(),
                response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown backend error".to_owned()),
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl InferenceBackend for HttpEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, payload: &Value) -> Result<Value, BackendError> {
        let response = self.post(payload).await?;
        response
            .json::<Value>()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))
    }

    async fn submit_stream(&self, payload: &Value) -> Result<FrameStream, BackendError> {
        let response = self.post(payload).await?;
        debug!(backend = %self.name, "stream opened");

        let frames = response
            .bytes_stream()
            .map(|next| next.map_err(map_transport_error));
        Ok(frames.boxed())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(self.url(&self.health_path))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(map_transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "health probe returned status {}",
                response.status().as_u16()
            )))
        }
    }
}

fn map_transport_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::Unavailable(error.to_string())
    }
}

fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            BackendError::Unavailable(format!("status {}: {trimmed}", status.as_u16()))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Timeout(format!("upstream timeout: {trimmed}"))
        }
        _ => BackendError::InvalidResponse(format!("status {}: {trimmed}", status.as_u16())),
    }
}
