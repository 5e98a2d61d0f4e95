use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use tenantgate_core::keyspace::KeyspaceError;
use tenantgate_core::permission::DenialRecord;
use tenantgate_storage::traits::{ContextError, StorageError};

use crate::resolver::ResolveError;

#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    #[error("insufficient permissions")]
    Forbidden(Box<DenialRecord>),

    #[error("permission resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    #[error("tenant context error: {0}")]
    Context(#[from] ContextError),

    #[error("cache key error: {0}")]
    Keyspace(#[from] KeyspaceError),

    #[error("cache store error: {0}")]
    Cache(#[from] StorageError),
}

impl AuthzError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthzError::Forbidden(_) => "FORBIDDEN",
            AuthzError::Resolution(_) => "PERMISSION_RESOLUTION_FAILED",
            AuthzError::Context(_) => "TENANT_CONTEXT_ERROR",
            AuthzError::Keyspace(_) => "CACHE_KEY_ERROR",
            AuthzError::Cache(_) => "CACHE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthzError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthzError::Resolution(_) | AuthzError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthzError::Context(_) | AuthzError::Keyspace(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn denial(&self) -> Option<&DenialRecord> {
        match self {
            AuthzError::Forbidden(denial) => Some(&**denial),
            _ => None,
        }
    }

    /// Pairs the error with the deployment mode that decides how much of it
    /// is shown to the caller.
    pub fn with_mode(self, production: bool) -> ErrorResponse {
        ErrorResponse {
            error: self,
            production,
        }
    }

    fn body(&self, production: bool) -> ErrorBody {
        let details = if production {
            None
        } else {
            match self {
                AuthzError::Forbidden(denial) => {
                    serde_json::to_value(denial.public_view(false)).ok()
                }
                other => Some(serde_json::Value::String(other.to_string())),
            }
        };
        let message = match self {
            AuthzError::Forbidden(_) => "insufficient permissions".to_string(),
            _ if production => "internal authorization error".to_string(),
            other => other.to_string(),
        };

        ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message,
                details,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ErrorResponse {
    error: AuthzError,
    production: bool,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        if !matches!(self.error, AuthzError::Forbidden(_)) {
            tracing::error!(code = self.error.code(), error = %self.error, "authorization request failed");
        }
        (self.error.status(), Json(self.error.body(self.production))).into_response()
    }
}

/// Without an explicit mode the redacted production shape is used.
impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        self.with_mode(true).into_response()
    }
}

/// JSON error for failures outside the authorization path (bad input, auth).
pub fn error_json(status: StatusCode, code: &'static str, message: &str) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            code,
            message: message.to_string(),
            details: None,
        },
    };
    (status, Json(body)).into_response()
}
