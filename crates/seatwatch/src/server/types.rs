use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::Error;

/// An error body returned by the API.
#[derive(Debug)]
pub struct ApiErrorType {
    status: StatusCode,
    error: String,
    context: Option<String>,
}

impl From<(StatusCode, &str, Option<String>)> for ApiErrorType {
    fn from((status, error, context): (StatusCode, &str, Option<String>)) -> Self {
        Self {
            status,
            error: error.to_string(),
            context,
        }
    }
}

impl From<Error> for ApiErrorType {
    fn from(err: Error) -> Self {
        match err {
            Error::ValidationError { input, message } => Self {
                status: StatusCode::BAD_REQUEST,
                error: message,
                context: Some(input),
            },
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: "Storage unavailable".to_string(),
                context: Some(other.to_string()),
            },
        }
    }
}

impl IntoResponse for ApiErrorType {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": self.error,
                "context": self.context,
            })),
        )
            .into_response()
    }
}
