//! Error kinds to HTTP status codes

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use harbor_foundation::Error;
use serde_json::json;
use tracing::error;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::ConfirmationMissing { .. }
            | Error::InvalidInput(_)
            | Error::UnregisteredTaskType(_)
            | Error::NotRetryable { .. }
            | Error::NotReady(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            Error::ConfirmationMissing { .. } => "confirmation_missing",
            Error::InvalidInput(_) => "invalid_input",
            Error::UnregisteredTaskType(_) => "unregistered_task_type",
            Error::NotRetryable { .. } => "not_retryable",
            Error::NotReady(_) => "not_ready",
            Error::NotFound(_) => "not_found",
            Error::Forbidden(_) => "forbidden",
            Error::QueueFull(_) => "queue_full",
            _ => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(json!({ "error": self.kind(), "detail": detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::confirmation_missing("kill"), StatusCode::BAD_REQUEST),
            (Error::NotReady("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (Error::QueueFull(3), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Storage("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
