use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use weft_core::error::WeftError;

/// Error response: a status code and a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<WeftError> for ApiError {
    fn from(e: WeftError) -> Self {
        let status = match &e {
            WeftError::WorkflowNotFound(_) | WeftError::RunNotFound(_) => StatusCode::NOT_FOUND,
            WeftError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            WeftError::Compile(_) | WeftError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(WeftError::RunNotFound("x".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(WeftError::InvalidInput("x".into())).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(WeftError::Database("x".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
