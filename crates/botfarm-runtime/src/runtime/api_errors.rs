//! HTTP error mapping for the lease API.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::LeaseError;

/// Error returned by every handler. The body is always `{"detail": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

pub(crate) fn status_for(err: &LeaseError) -> StatusCode {
    match err {
        LeaseError::NotFound(_) | LeaseError::ResourceExhausted => StatusCode::NOT_FOUND,
        LeaseError::Conflict(_) => StatusCode::CONFLICT,
        LeaseError::DuplicateLogin(_) => StatusCode::BAD_REQUEST,
        LeaseError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LeaseError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        LeaseError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<LeaseError> for ApiError {
    fn from(err: LeaseError) -> Self {
        if let LeaseError::Store(detail) = &err {
            tracing::warn!(error = %detail, "store failure");
        }
        Self::new(status_for(&err), err.public_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(json!({ "detail": self.detail }))).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
