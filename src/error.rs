//! API error types
//!
//! One enum carries the whole HTTP-facing taxonomy: transient upstream
//! failures surface as 502 with `{service, stage, body}`, lifecycle
//! violations as 409, schema and domain validation as 422.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::assistant::{GateError, MeteringError};
use crate::db::StoreError;
use crate::domain::CartError;
use crate::integrations::UpstreamError;
use crate::orders::OrderError;
use crate::promo::ImportError;
use crate::rpc::RpcAuthError;
use crate::sync::SyncError;

/// API errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request that is not a field-level validation problem
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing, expired or ill-formed credentials
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("permission denied: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Lifecycle rule violation
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Network failure, 5xx or rate limit from an upstream
    #[error("{service} failed at {stage}")]
    TransientUpstream { service: &'static str, stage: &'static str, body: String },

    /// 4xx with a business meaning from an upstream
    #[error("{service} rejected the request: {message}")]
    PermanentUpstream { service: &'static str, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::TransientUpstream { .. } => StatusCode::BAD_GATEWAY,
            Self::PermanentUpstream { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "AUTH_FAILED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::TransientUpstream { .. } => "TRANSIENT_UPSTREAM",
            Self::PermanentUpstream { .. } => "PERMANENT_UPSTREAM",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self { Self::Internal(msg.into()) }
    pub fn bad_request(msg: impl Into<String>) -> Self { Self::BadRequest(msg.into()) }

    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} '{}' not found", entity, id))
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation { field: field.to_string(), message: message.into() }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = ErrorResponse { error: self.code(), message: self.to_string(), field: None, service: None, stage: None, body: None };
        match &self {
            Self::Validation { field, .. } => body.field = Some(field.clone()),
            Self::TransientUpstream { service, stage, body: upstream } => {
                body.service = Some(service);
                body.stage = Some(stage);
                body.body = Some(upstream.clone());
            }
            Self::PermanentUpstream { service, .. } => body.service = Some(service),
            _ => {}
        }

        if status.is_server_error() {
            tracing::error!(error_code = body.error, error_message = %body.message, status = %status, "API error");
        } else {
            tracing::warn!(error_code = body.error, error_message = %body.message, status = %status, "API error");
        }

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::not_found(entity, id),
            StoreError::Conflict(msg) => Self::InvalidTransition(msg),
            StoreError::Cart(e) => e.into(),
            StoreError::Invalid { field, message } => Self::Validation { field: field.to_string(), message },
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CartError> for ApiError {
    fn from(err: CartError) -> Self {
        match err {
            CartError::InvalidTransition { .. } | CartError::FlagConflict => Self::InvalidTransition(err.to_string()),
            CartError::NegativeAmount => Self::validation("sum", err.to_string()),
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        if err.is_transient() {
            return Self::TransientUpstream { service: err.service(), stage: err.stage(), body: err.body() };
        }
        match err {
            UpstreamError::Status { service, body, .. } => Self::PermanentUpstream { service, message: body },
            UpstreamError::Decode { service, stage, message } => Self::TransientUpstream { service, stage, body: message },
            other => Self::TransientUpstream { service: other.service(), stage: other.stage(), body: other.to_string() },
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errs: validator::ValidationErrors) -> Self {
        let (field, message) = errs
            .field_errors()
            .into_iter()
            .next()
            .map(|(field, list)| {
                let message = list
                    .first()
                    .map(|e| e.message.as_ref().map(|m| m.to_string()).unwrap_or_else(|| e.code.to_string()))
                    .unwrap_or_else(|| "invalid".to_string());
                (field.to_string(), message)
            })
            .unwrap_or_else(|| ("body".to_string(), errs.to_string()));
        Self::Validation { field, message }
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Store(e) => e.into(),
            OrderError::Upstream(e) => e.into(),
            OrderError::Cart(e) => e.into(),
            OrderError::Validation { field, message } => Self::validation(field, message),
            OrderError::DeliveryBookingFailed { source, .. } => source.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::AlreadyRunning => Self::InvalidTransition(err.to_string()),
            SyncError::Fetch { source, .. } => source.into(),
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Download(e) => e.into(),
            ImportError::Store(e) => e.into(),
            other => Self::PermanentUpstream { service: "promo_sheet", message: other.to_string() },
        }
    }
}

impl From<MeteringError> for ApiError {
    fn from(err: MeteringError) -> Self {
        match err {
            MeteringError::Store(e) => e.into(),
            MeteringError::Upstream(e) => e.into(),
            MeteringError::Rpc { action, message } => Self::PermanentUpstream { service: "rpc", message: format!("{}: {}", action, message) },
        }
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Blocked { .. } => Self::Forbidden(err.to_string()),
            GateError::PhoneRequired | GateError::PremiumExhausted => Self::InvalidTransition(err.to_string()),
            GateError::Metering(e) => e.into(),
            GateError::Backend(e) => e.into(),
        }
    }
}

impl From<RpcAuthError> for ApiError {
    fn from(err: RpcAuthError) -> Self { Self::Unauthorized(err.to_string()) }
}

/// Result type for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::InvalidTransition("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiError::validation("qty", "too small").status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            ApiError::TransientUpstream { service: "cdek", stage: "calculate", body: String::new() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_transient_upstream_maps_to_502() {
        let err = UpstreamError::Status { service: "yookassa", stage: "create_payment", status: 503, body: "busy".into() };
        let api: ApiError = err.into();
        assert!(matches!(api, ApiError::TransientUpstream { service: "yookassa", .. }));
        let err = UpstreamError::Status { service: "cdek", stage: "orders", status: 400, body: "bad tariff".into() };
        assert!(matches!(ApiError::from(err), ApiError::PermanentUpstream { service: "cdek", .. }));
    }

    #[test]
    fn test_domain_errors_map_to_taxonomy() {
        let order = OrderError::Validation { field: "tariff_code", message: "CDEK tariff is required".into() };
        assert!(matches!(ApiError::from(order), ApiError::Validation { ref field, .. } if field == "tariff_code"));
        assert_eq!(ApiError::from(SyncError::AlreadyRunning).status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(RpcAuthError::MissingHeader("X-Bot-Nonce")).status_code(), StatusCode::UNAUTHORIZED);
        let missing = StoreError::not_found("cart", 1234567);
        assert_eq!(ApiError::from(OrderError::Store(missing)).status_code(), StatusCode::NOT_FOUND);
    }
}
