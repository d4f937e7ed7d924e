use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::backend::BackendError;

pub const UNAVAILABLE_MESSAGE: &str = "inference backend is unavailable";
pub const PROTOCOL_MESSAGE: &str = "inference backend returned an invalid response";
pub const TIMEOUT_MESSAGE: &str = "inference backend timed out";
pub const CANCELLED_MESSAGE: &str = "request cancelled";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend protocol error: {0}")]
    BackendProtocol(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::BadRequest(message) => message.clone(),
            GatewayError::Config(_) | GatewayError::BackendUnavailable(_) => {
                UNAVAILABLE_MESSAGE.to_owned()
            }
            GatewayError::BackendProtocol(_) => PROTOCOL_MESSAGE.to_owned(),
            GatewayError::Timeout(_) => TIMEOUT_MESSAGE.to_owned(),
            GatewayError::Internal(_) => "internal server error".to_owned(),
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::Config(_) | GatewayError::BackendUnavailable(_) => "backend_unavailable",
            GatewayError::BackendProtocol(_) => "backend_error",
            GatewayError::Timeout(_) => "timeout_error",
            GatewayError::Internal(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Config(_) | GatewayError::BackendUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::BackendProtocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn degrades_backend(&self) -> bool {
        matches!(
            self,
            GatewayError::BackendUnavailable(_) | GatewayError::Timeout(_)
        )
    }
}

impl From<BackendError> for GatewayError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Unavailable(detail) => GatewayError::BackendUnavailable(detail),
            BackendError::Timeout(detail) => GatewayError::Timeout(detail),
            BackendError::InvalidResponse(detail) => GatewayError::BackendProtocol(detail),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OpenAiErrorEnvelope {
    pub error: OpenAiError,
}

#[derive(Debug, Serialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl OpenAiErrorEnvelope {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error: OpenAiError {
                message: message.into(),
                error_type: error_type.into(),
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let payload = OpenAiErrorEnvelope::new(self.client_message(), self.error_type());
        (self.status(), Json(payload)).into_response()
    }
}
