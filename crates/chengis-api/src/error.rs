//! API error type.
//!
//! Responses carry a stable numeric code distinct from the HTTP status,
//! so clients can switch on behaviour without parsing messages.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn http_status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable application-level code.
    pub fn code(&self) -> u32 {
        match self {
            ApiError::BadRequest(_) => 1001,
            ApiError::Unauthorized(_) => 1002,
            ApiError::NotFound(_) => 1003,
            ApiError::Conflict(_) => 1004,
            ApiError::Internal(_) => 1500,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code(),
            "error": self.to_string(),
        }));
        (self.http_status(), body).into_response()
    }
}

impl From<chengis_db::DbError> for ApiError {
    fn from(err: chengis_db::DbError) -> Self {
        match err {
            chengis_db::DbError::NotFound(msg) => ApiError::NotFound(msg),
            chengis_db::DbError::Duplicate(msg) => ApiError::Conflict(msg),
            chengis_db::DbError::StaleTransition(msg) => ApiError::Conflict(msg),
            chengis_db::DbError::BadCursor(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<chengis_core::Error> for ApiError {
    fn from(err: chengis_core::Error) -> Self {
        use chengis_core::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            Error::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct_from_http() {
        assert_eq!(ApiError::BadRequest("x".into()).code(), 1001);
        assert_eq!(ApiError::Unauthorized("x".into()).code(), 1002);
        assert_eq!(ApiError::NotFound("x".into()).code(), 1003);
        assert_eq!(ApiError::Conflict("x".into()).code(), 1004);
        assert_eq!(ApiError::Internal("x".into()).code(), 1500);
    }
}
