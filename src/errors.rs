use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::history::HistoryFetchError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    History(#[from] HistoryFetchError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message),
            ApiError::History(history_error) => map_history_error(history_error),
        };

        let body = ErrorBody { code, message };
        (status, Json(body)).into_response()
    }
}

fn map_history_error(error: HistoryFetchError) -> (StatusCode, &'static str, String) {
    match error {
        HistoryFetchError::InvalidRequest(message) => {
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
        }
        HistoryFetchError::Request(message) => {
            (StatusCode::BAD_GATEWAY, "UPSTREAM_REQUEST_FAILED", message)
        }
        HistoryFetchError::Status { status, message } => (
            StatusCode::BAD_GATEWAY,
            "UPSTREAM_REQUEST_FAILED",
            format!("provider returned {status}: {message}"),
        ),
        HistoryFetchError::Decode(message) => {
            (StatusCode::BAD_GATEWAY, "UPSTREAM_DATA_INVALID", message)
        }
    }
}
