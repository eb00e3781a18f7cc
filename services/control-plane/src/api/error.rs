use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_protocol::{ErrorDetail, ErrorReply, ProtocolError};

use crate::db::StoreError;

/// An error reply: `{success: false, error: {code, message, request_id, retryable}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Box<ErrorReply>,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: Box::new(ErrorReply {
                success: false,
                error: ErrorDetail {
                    code: code.into(),
                    message: message.into(),
                    request_id: None,
                    retryable: false,
                },
            }),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message).retryable()
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message).retryable()
    }

    pub fn retryable(mut self) -> Self {
        self.body.error.retryable = true;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.body.error.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> &str {
        &self.body.error.code
    }
}

impl From<&StoreError> for ApiError {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => {
                ApiError::service_unavailable("store_unavailable", "Storage is unavailable")
            }
            StoreError::Conflict { .. } => ApiError::conflict("conflict", err.to_string()),
            StoreError::NotFound { .. } => ApiError::not_found("not_found", err.to_string()),
            StoreError::Serialization(_) | StoreError::Migration(_) => {
                ApiError::internal("internal_error", "Failed to read stored data")
            }
        }
    }
}

impl From<&ProtocolError> for ApiError {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownService(_) => ApiError::not_found(err.code(), err.to_string()),
            _ => ApiError::bad_request(err.code(), err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_is_retryable() {
        let err = ApiError::from(&StoreError::Unavailable("pool timed out".to_string()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.body.error.retryable);
    }

    #[test]
    fn test_request_id_is_attached() {
        let err = ApiError::forbidden("forbidden", "nope").with_request_id("req_1");
        assert_eq!(err.body.error.request_id.as_deref(), Some("req_1"));
        assert!(!err.body.success);
    }
}
