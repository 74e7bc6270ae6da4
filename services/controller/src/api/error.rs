use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::store::StoreError;

/// RFC 7807 problem body.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://ipruler.io/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(
        status: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::with_status(StatusCode::CONFLICT, code, message);
        err.problem.retryable = true;
        err
    }

    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message);
        err.problem.retryable = true;
        err
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::NotFound { .. } => Self::not_found("not_found", message),
            StoreError::AlreadyExists { .. } => Self::conflict("already_exists", message),
            StoreError::Conflict { .. } => Self::conflict("conflict", message),
            StoreError::Invalid { .. } => Self::bad_request("invalid", message),
            StoreError::Unavailable(_) => Self::unavailable("store_unavailable", message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
