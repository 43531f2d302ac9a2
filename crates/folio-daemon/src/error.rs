// SPDX-License-Identifier: MIT OR Apache-2.0
//! The error boundary: every failure leaving a handler becomes one
//! normalized, logged, client-safe response.

use crate::middleware::RequestId;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use folio_error::{ErrorResponse, Failure, ResponseMode, TypedError, normalize};
use std::fmt;
use tracing::{error, warn};

/// A failure on its way to the client.
#[derive(Debug)]
pub struct ApiError {
    /// The normalized failure.
    pub error: TypedError,
    /// Request the failure belongs to.
    pub request_id: RequestId,
    /// Whether internal detail may be attached.
    pub mode: ResponseMode,
}

impl ApiError {
    /// Normalize `failure` for the response to `request_id`.
    pub fn new(failure: impl Into<Failure>, request_id: RequestId, mode: ResponseMode) -> Self {
        Self {
            error: normalize(failure),
            request_id,
            mode,
        }
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn log(&self, status: StatusCode) {
        let err = &self.error;
        let causes = err.cause_chain();
        if status.is_server_error() {
            error!(
                target: "folio.daemon",
                request_id = %self.request_id,
                code = %err.code(),
                kind = err.kind().as_str(),
                status = status.as_u16(),
                error = %err,
                caused_by = ?causes,
                "request failed"
            );
        } else {
            warn!(
                target: "folio.daemon",
                request_id = %self.request_id,
                code = %err.code(),
                kind = err.kind().as_str(),
                status = status.as_u16(),
                error = %err,
                "request rejected"
            );
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.request_id)
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        self.log(status);
        let body = ErrorResponse::from_error(&self.error, self.request_id.as_str(), self.mode);
        let mut resp = (status, Json(body)).into_response();
        if let Some(secs) = self.error.retry_after_secs() {
            resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_error::{ErrorCode, FieldViolation};

    fn rid() -> RequestId {
        RequestId::from("req-1")
    }

    #[test]
    fn status_follows_the_error() {
        let api = ApiError::new(
            Failure::FieldValidation(vec![FieldViolation::new("email", "required")]),
            rid(),
            ResponseMode::Production,
        );
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);
        assert_eq!(api.error.code(), ErrorCode::ValidationFailed);
    }

    #[test]
    fn retryable_errors_set_retry_after() {
        let api = ApiError::new(
            TypedError::new(ErrorCode::RateLimited, "slow down"),
            rid(),
            ResponseMode::Production,
        );
        let resp = api.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[RETRY_AFTER], "60");
    }

    #[test]
    fn non_retryable_errors_omit_retry_after() {
        let api = ApiError::new(
            TypedError::not_found("page"),
            rid(),
            ResponseMode::Production,
        );
        let resp = api.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().get(RETRY_AFTER).is_none());
    }
}
