//! Single error taxonomy for the whole gateway.
//!
//! Every fallible operation below the HTTP boundary returns (eventually) a
//! [`GatewayError`]. Conversion to [`HttpError`] happens exactly once, at the
//! dispatch boundary (`api.rs`); `audit_detail` is what gets logged, never
//! what gets sent to the client.

use axum::http::StatusCode;

use crate::http::{HttpError, HttpErrorBuilder};
use crate::jwt::JwtError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Jwt(#[from] JwtError),

    #[error("insufficient permissions to execute {0}")]
    InsufficientPermissions(&'static str),
    #[error("delegation target is not in the allow-list")]
    UnauthorizedDelegationTarget,

    #[error("delegation call failed: {0}")]
    DelegationFailed(String),
    #[error("token exchange response is missing a required claim: {0}")]
    DelegationMissingClaim(&'static str),
    #[error("delegation module not found: {0}")]
    ModuleNotFound(String),
    #[error("delegation module unavailable: {0}")]
    ModuleUnavailable(String),

    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),
    #[error("KDC unreachable: {0}")]
    KdcUnreachable(String),
    #[error("clock skew exceeds tolerance")]
    ClockSkew,

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),
    #[error("secret could not be resolved: {0}")]
    ConfigUnresolvedSecret(String),

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl GatewayError {
    /// Taxonomy code, exactly as named in the error-handling design.
    pub const fn code(&self) -> &'static str {
        match self {
            GatewayError::Jwt(e) => e.code(),
            GatewayError::InsufficientPermissions(_) => "INSUFFICIENT_PERMISSIONS",
            GatewayError::UnauthorizedDelegationTarget => "UNAUTHORIZED_DELEGATION_TARGET",
            GatewayError::DelegationFailed(_) => "DELEGATION_FAILED",
            GatewayError::DelegationMissingClaim(_) => "DELEGATION_MISSING_CLAIM",
            GatewayError::ModuleNotFound(_) => "MODULE_NOT_FOUND",
            GatewayError::ModuleUnavailable(_) => "MODULE_UNAVAILABLE",
            GatewayError::TokenExchangeFailed(_) => "TOKEN_EXCHANGE_FAILED",
            GatewayError::KdcUnreachable(_) => "KDC_UNREACHABLE",
            GatewayError::ClockSkew => "CLOCK_SKEW",
            GatewayError::ConfigInvalid(_) => "CONFIG_INVALID",
            GatewayError::ConfigUnresolvedSecret(_) => "CONFIG_UNRESOLVED_SECRET",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Jwt(_) => StatusCode::UNAUTHORIZED,
            GatewayError::InsufficientPermissions(_) | GatewayError::UnauthorizedDelegationTarget => {
                StatusCode::FORBIDDEN
            }
            GatewayError::DelegationMissingClaim(_) | GatewayError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            GatewayError::DelegationFailed(_)
            | GatewayError::ModuleNotFound(_)
            | GatewayError::ModuleUnavailable(_)
            | GatewayError::TokenExchangeFailed(_)
            | GatewayError::KdcUnreachable(_)
            | GatewayError::ClockSkew => StatusCode::BAD_GATEWAY,
            GatewayError::ConfigUnresolvedSecret(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// User-visible message. Never names required roles, module identifiers,
    /// secret values, or raw upstream error bodies.
    fn sanitized_message(&self) -> String {
        match self {
            GatewayError::Jwt(e) => e.to_string(),
            GatewayError::InsufficientPermissions(kind) => format!("Insufficient permissions to execute {kind}"),
            GatewayError::UnauthorizedDelegationTarget => "delegation target is not allowed".to_owned(),
            GatewayError::DelegationFailed(_) => "delegation call failed".to_owned(),
            GatewayError::DelegationMissingClaim(_) => "upstream identity provider response is incomplete".to_owned(),
            GatewayError::ModuleNotFound(_) => "requested module does not exist".to_owned(),
            GatewayError::ModuleUnavailable(_) => "requested module is currently unavailable".to_owned(),
            GatewayError::TokenExchangeFailed(_) => "token exchange with the identity provider failed".to_owned(),
            GatewayError::KdcUnreachable(_) => "kerberos key distribution center is unreachable".to_owned(),
            GatewayError::ClockSkew => "clock skew against the key distribution center exceeds tolerance".to_owned(),
            GatewayError::ConfigInvalid(_) => "configuration is invalid".to_owned(),
            GatewayError::ConfigUnresolvedSecret(_) | GatewayError::Internal(_) => {
                "an internal error occurred".to_owned()
            }
        }
    }
}

impl From<crate::delegation::DelegationError> for GatewayError {
    fn from(error: crate::delegation::DelegationError) -> Self {
        use crate::delegation::DelegationError as D;
        match error {
            D::InsufficientPermissions(kind) => GatewayError::InsufficientPermissions(kind),
            D::UnauthorizedDelegationTarget => GatewayError::UnauthorizedDelegationTarget,
            D::MissingClaim(claim) => GatewayError::DelegationMissingClaim(claim),
            D::BackendFailed(detail) => GatewayError::DelegationFailed(detail),
            D::ClockSkew => GatewayError::ClockSkew,
            D::Unavailable => GatewayError::ModuleUnavailable("delegation module".to_owned()),
            D::ModuleNotFound(name) => GatewayError::ModuleNotFound(name),
        }
    }
}

impl From<GatewayError> for HttpError {
    #[track_caller]
    fn from(error: GatewayError) -> Self {
        let code = error.code();
        let status = error.status();
        let message = error.sanitized_message();

        HttpErrorBuilder::new(status, code)
            .with_msg(message)
            .err()(anyhow::Error::new(error))
    }
}
