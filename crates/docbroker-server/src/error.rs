//! HTTP error mapping for the broker endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use docbroker_core::BrokerError;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Json(_) => (StatusCode::BAD_REQUEST, "INVALID_JSON"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Broker(e) => match e {
                BrokerError::NotFound(_)
                | BrokerError::ContainerMissing(_)
                | BrokerError::ItemMissing(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                BrokerError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
                BrokerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
                BrokerError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
                BrokerError::MissingCoordinate(_) => {
                    (StatusCode::BAD_REQUEST, "MISSING_COORDINATE")
                }
                BrokerError::AlreadyRunning(_) => (StatusCode::CONFLICT, "ALREADY_RUNNING"),
                BrokerError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
                BrokerError::Transport(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
                BrokerError::InvalidToken(_) => (StatusCode::BAD_GATEWAY, "INVALID_CHANGE_TOKEN"),
                BrokerError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
                BrokerError::DataIntegrity(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "DATA_INTEGRITY")
                }
                BrokerError::Serialization(_) | BrokerError::Config(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
            code: &'static str,
        }

        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = ErrorBody {
            error: self.to_string(),
            code,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
