//! Error taxonomy shared by the HTTP surface, the control plane and the
//! orchestrator.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::runtime::RuntimeError;

/// What a caller should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Transient; the same request may succeed later.
    RetryLater,
    /// The request itself is wrong and must be changed.
    FixRequest,
    /// The caller lacks a session or the rights for this operation.
    NotAuthorized,
}

#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("no valid session")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited, retry after {}s", retry_after_secs(*retry_after))]
    RateLimited { retry_after: Duration },

    #[error("missing or invalid CSRF token")]
    CsrfRejected,

    #[error("conflict: {0}")]
    ResourceConflict(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("container runtime rejected the request: {0}")]
    Runtime(String),

    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LabError {
    /// Stable machine-readable code used in JSON bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::RateLimited { .. } => "rate_limited",
            Self::CsrfRejected => "csrf_rejected",
            Self::ResourceConflict(_) => "resource_conflict",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Runtime(_) => "runtime_rejected",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Unauthenticated | Self::Forbidden(_) | Self::CsrfRejected => {
                Disposition::NotAuthorized
            }
            Self::RateLimited { .. }
            | Self::RuntimeUnavailable(_)
            | Self::Unavailable(_)
            | Self::Internal(_) => Disposition::RetryLater,
            Self::ResourceConflict(_)
            | Self::NotFound(_)
            | Self::InvalidRequest(_)
            | Self::Runtime(_) => Disposition::FixRequest,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::CsrfRejected => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ResourceConflict(_) => StatusCode::CONFLICT,
            Self::RuntimeUnavailable(_) | Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::Runtime(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Whole seconds for a `Retry-After` hint, rounded up and never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl From<RuntimeError> for LabError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Transient(msg) => Self::RuntimeUnavailable(msg),
            RuntimeError::NotFound(what) => Self::NotFound(what),
            RuntimeError::InvalidSpec(msg) => Self::Runtime(format!("invalid lab spec: {msg}")),
            RuntimeError::QuotaExceeded(msg) => Self::Runtime(format!("quota exceeded: {msg}")),
            RuntimeError::Other(msg) => Self::Runtime(msg),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl IntoResponse for LabError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after().map(retry_after_secs);
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            disposition: self.disposition(),
            retry_after,
        };
        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<LabError> for tonic::Status {
    fn from(err: LabError) -> Self {
        let message = err.to_string();
        match err {
            LabError::Unauthenticated | LabError::CsrfRejected => {
                tonic::Status::unauthenticated(message)
            }
            LabError::Forbidden(_) => tonic::Status::permission_denied(message),
            LabError::RateLimited { .. } => tonic::Status::resource_exhausted(message),
            LabError::ResourceConflict(_) => tonic::Status::already_exists(message),
            LabError::RuntimeUnavailable(_) | LabError::Unavailable(_) => {
                tonic::Status::unavailable(message)
            }
            LabError::NotFound(_) => tonic::Status::not_found(message),
            LabError::InvalidRequest(_) | LabError::Runtime(_) => {
                tonic::Status::invalid_argument(message)
            }
            LabError::Internal(_) => tonic::Status::internal(message),
        }
    }
}
