//! Mapping from engine errors to HTTP responses.
//!
//! Every error body has the same shape: `{"error": "...", "code": "..."}`.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    extract::FromRequest,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::common::EngineError;

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    Unauthorized,
    BadRequest(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status_and_body(&self) -> (StatusCode, ErrorBody) {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "missing or invalid bearer token".to_string(),
                    code: "unauthorized",
                },
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: message.clone(),
                    code: "validation_error",
                },
            ),
            ApiError::Engine(err) => {
                let status = match err {
                    EngineError::Validation(_) => StatusCode::BAD_REQUEST,
                    EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
                    EngineError::InvalidState(_) => StatusCode::CONFLICT,
                    EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let message = match err {
                    EngineError::Storage(_) => "internal server error".to_string(),
                    other => other.to_string(),
                };
                (
                    status,
                    ErrorBody {
                        error: message,
                        code: err.code(),
                    },
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Engine(EngineError::Storage(e)) = &self {
            error!(error = %e, "request failed with storage error");
        }
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// `Json` whose rejections use the API error body.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::validation("bad"), StatusCode::BAD_REQUEST),
            (EngineError::not_found("site", "x"), StatusCode::NOT_FOUND),
            (EngineError::invalid_state("busy"), StatusCode::CONFLICT),
            (
                EngineError::from(anyhow::anyhow!("connection refused")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let (status, _) = ApiError::from(err).status_and_body();
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn storage_details_are_not_leaked() {
        let (_, body) =
            ApiError::from(EngineError::from(anyhow::anyhow!("password=hunter2"))).status_and_body();
        assert_eq!(body.error, "internal server error");
        assert_eq!(body.code, "internal_error");
    }
}
