//! Requestor-JWT authentication middleware.
//!
//! Every request except the paths in [`AUTH_EXCEPTIONS`] must carry a bearer
//! token that validates against the trusted IDP registry. On success, the
//! [`crate::jwt::ValidatedToken`] and the resolved [`crate::session::SessionInfo`]
//! are inserted into the request's extensions for downstream extractors.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;

use crate::error::GatewayError;
use crate::http::HttpError;
use crate::jwt::decode_claims_unverified;
use crate::GatewayState;

/// Paths that never require authentication.
pub const AUTH_EXCEPTIONS: &[&str] = &["/healthz"];

fn extract_bearer(request: &Request<Body>) -> Option<String> {
    if let Some(header) = request.headers().get(axum::http::header::AUTHORIZATION) {
        let value = header.to_str().ok()?;
        return value.strip_prefix("Bearer ").map(str::to_owned);
    }

    let query = request.uri().query()?;
    let params: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
    params.into_iter().find(|(k, _)| k == "access_token").map(|(_, v)| v)
}

pub async fn auth_middleware(State(state): State<GatewayState>, mut request: Request<Body>, next: Next) -> Result<Response, HttpError> {
    if AUTH_EXCEPTIONS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let Some(raw_token) = extract_bearer(&request) else {
        return Err(HttpError::unauthorized("JWT_INVALID_FORMAT").msg("missing bearer token"));
    };

    let validated = match state.jwt_validator.validate(&raw_token).await {
        Ok(token) => token,
        Err(error) => {
            // Signature/claims aren't trusted yet, but the issuer claim is
            // useful context for the audit trail even unverified.
            let issuer = decode_claims_unverified(&raw_token)
                .ok()
                .and_then(|claims| claims.get("iss").and_then(|v| v.as_str()).map(str::to_owned))
                .unwrap_or_else(|| "unknown".to_owned());
            state.audit.emit(sysevent_codes::authn_failure(issuer, error.code())).await;
            return Err(GatewayError::Jwt(error).into());
        }
    };

    let session = state
        .sessions
        .get_or_create(validated.clone())
        .await
        .map_err(|e| HttpError::internal("INTERNAL_ERROR").err()(e))?;

    state
        .audit
        .emit(sysevent_codes::authn_success(validated.issuer.clone(), validated.audience.clone(), validated.user_id.clone()))
        .await;

    request.extensions_mut().insert(validated);
    request.extensions_mut().insert(session);

    Ok(next.run(request).await)
}
