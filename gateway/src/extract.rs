//! `axum` extractors bridging the auth middleware's request extensions to
//! handler function signatures.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;

use crate::jwt::ValidatedToken;
use crate::session::SessionInfo;

/// The requestor JWT, already verified by `middleware::auth::auth_middleware`.
/// Handlers that need the raw claims or audience pull this in directly.
pub struct Validated(pub ValidatedToken);

impl<S> FromRequestParts<S> for Validated
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ValidatedToken>()
            .cloned()
            .map(Validated)
            .ok_or((StatusCode::UNAUTHORIZED, "request was not authenticated"))
    }
}

/// The session resolved for this request's identity, created or touched by
/// the auth middleware before the handler runs.
pub struct CurrentSession(pub SessionInfo);

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionInfo>()
            .cloned()
            .map(CurrentSession)
            .ok_or((StatusCode::UNAUTHORIZED, "request has no associated session"))
    }
}
