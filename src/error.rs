//! The JSON error envelope returned by every API endpoint.
//!
//! Shape: `{error: {type, code, message, field?}, request_id, timestamp}`.
//! Service and auth errors map onto the envelope's stable kinds; internal
//! detail is suppressed outside debug builds.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AuthError;
use crate::services::ServiceError;

/// Client-visible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    ValidationError,
    AuthenticationError,
    AuthorizationError,
    NotFound,
    Conflict,
    RateLimited,
    InternalError,
}

impl ApiErrorKind {
    fn status(&self) -> StatusCode {
        match self {
            ApiErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ApiErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
            ApiErrorKind::AuthorizationError => StatusCode::FORBIDDEN,
            ApiErrorKind::NotFound => StatusCode::NOT_FOUND,
            ApiErrorKind::Conflict => StatusCode::CONFLICT,
            ApiErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub code: String,
    pub message: String,
    pub field: Option<String>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError {
            kind,
            code: code.into(),
            message: message.into(),
            field: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::ValidationError, "INVALID_INPUT", message)
    }

    pub fn authentication() -> Self {
        Self::new(
            ApiErrorKind::AuthenticationError,
            "INVALID_CREDENTIALS",
            "Missing or invalid credentials",
        )
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Validation(message) => {
                ApiError::new(ApiErrorKind::ValidationError, "INVALID_INPUT", message)
            }
            ServiceError::NotFound(resource) => ApiError::new(
                ApiErrorKind::NotFound,
                "NOT_FOUND",
                format!("{resource} not found"),
            ),
            ServiceError::Conflict(message) => {
                ApiError::new(ApiErrorKind::Conflict, "CONFLICT", message)
            }
            ServiceError::Authentication => ApiError::authentication(),
            // The only service-level authorization failure is resource
            // ownership.
            ServiceError::Authorization(message) => {
                ApiError::new(ApiErrorKind::AuthorizationError, "MERCHANT_MISMATCH", message)
            }
            ServiceError::Internal(detail) => {
                tracing::error!(detail = %detail, "Internal service error");
                ApiError::new(
                    ApiErrorKind::InternalError,
                    "INTERNAL_ERROR",
                    if cfg!(debug_assertions) {
                        detail
                    } else {
                        "Internal error".to_string()
                    },
                )
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::InvalidGrant(grant) => ApiError::new(
                ApiErrorKind::ValidationError,
                "INVALID_GRANT",
                format!("Unsupported grant type: {grant}"),
            )
            .with_field("grant_type"),
            AuthError::Authentication => ApiError::authentication(),
            AuthError::InsufficientPermissions => ApiError::new(
                ApiErrorKind::AuthorizationError,
                "INSUFFICIENT_PERMISSIONS",
                "Requested scope exceeds granted permissions",
            ),
            AuthError::InvalidExpiry => {
                ApiError::validation(error.to_string()).with_field("expires_in")
            }
            AuthError::Encoding(source) => {
                tracing::error!(error = %source, "Token encoding failed");
                ApiError::new(ApiErrorKind::InternalError, "INTERNAL_ERROR", "Internal error")
            }
            AuthError::Service(service_error) => service_error.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    #[serde(rename = "type")]
    error_type: ApiErrorKind,
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'a str>,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
    request_id: String,
    timestamp: chrono::DateTime<Utc>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                error_type: self.kind,
                code: &self.code,
                message: &self.message,
                field: self.field.as_deref(),
            },
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        };
        (self.kind.status(), Json(&envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_status_mapping() {
        assert_eq!(ApiErrorKind::ValidationError.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiErrorKind::AuthenticationError.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiErrorKind::AuthorizationError.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiErrorKind::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiErrorKind::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiErrorKind::InternalError.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_merchant_mismatch_code() {
        let api: ApiError =
            ServiceError::Authorization("Invoice belongs to a different merchant".into()).into();
        assert_eq!(api.kind, ApiErrorKind::AuthorizationError);
        assert_eq!(api.code, "MERCHANT_MISMATCH");
    }

    #[test]
    fn test_scope_error_code() {
        let api: ApiError = AuthError::InsufficientPermissions.into();
        assert_eq!(api.kind, ApiErrorKind::AuthorizationError);
        assert_eq!(api.code, "INSUFFICIENT_PERMISSIONS");
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ApiErrorKind::ValidationError).unwrap(),
            "\"validation_error\""
        );
    }
}
