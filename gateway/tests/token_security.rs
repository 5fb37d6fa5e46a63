#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]

//! End-to-end checks on the error taxonomy at the HTTP boundary: every
//! `GatewayError` (including ones reached only via a `DelegationError`
//! conversion) must carry the right status code, a stable machine-readable
//! code, and a message that never leaks a required role, a module name, or
//! an upstream error body to the client.

use axum::http::StatusCode;
use gateway::delegation::DelegationError;
use gateway::error::GatewayError;
use gateway::http::HttpError;
use gateway::jwt::JwtError;
use rstest::rstest;

fn into_http(error: GatewayError) -> HttpError {
    HttpError::from(error)
}

#[rstest]
#[case::jwt_errors_are_unauthorized(GatewayError::Jwt(JwtError::JwtExpired), StatusCode::UNAUTHORIZED, "JWT_EXPIRED")]
#[case::insufficient_permissions_is_forbidden(
    GatewayError::InsufficientPermissions("sql-write"),
    StatusCode::FORBIDDEN,
    "INSUFFICIENT_PERMISSIONS"
)]
#[case::unauthorized_delegation_target_is_forbidden(
    GatewayError::UnauthorizedDelegationTarget,
    StatusCode::FORBIDDEN,
    "UNAUTHORIZED_DELEGATION_TARGET"
)]
#[case::missing_claim_is_bad_request(
    GatewayError::DelegationMissingClaim("roles"),
    StatusCode::BAD_REQUEST,
    "DELEGATION_MISSING_CLAIM"
)]
#[case::config_invalid_is_bad_request(
    GatewayError::ConfigInvalid("bad config".to_owned()),
    StatusCode::BAD_REQUEST,
    "CONFIG_INVALID"
)]
#[case::delegation_failed_is_bad_gateway(
    GatewayError::DelegationFailed("connection refused".to_owned()),
    StatusCode::BAD_GATEWAY,
    "DELEGATION_FAILED"
)]
#[case::module_not_found_is_bad_gateway(
    GatewayError::ModuleNotFound("warehouse".to_owned()),
    StatusCode::BAD_GATEWAY,
    "MODULE_NOT_FOUND"
)]
#[case::kdc_unreachable_is_bad_gateway(
    GatewayError::KdcUnreachable("no route to host".to_owned()),
    StatusCode::BAD_GATEWAY,
    "KDC_UNREACHABLE"
)]
#[case::clock_skew_is_bad_gateway(GatewayError::ClockSkew, StatusCode::BAD_GATEWAY, "CLOCK_SKEW")]
#[case::unresolved_secret_is_internal(
    GatewayError::ConfigUnresolvedSecret("DB_PASSWORD".to_owned()),
    StatusCode::INTERNAL_SERVER_ERROR,
    "CONFIG_UNRESOLVED_SECRET"
)]
fn maps_to_the_expected_status_and_code(#[case] error: GatewayError, #[case] expected_status: StatusCode, #[case] expected_code: &str) {
    let http_error = into_http(error);

    assert_eq!(http_error.code, expected_status);
    assert_eq!(http_error.kind, expected_code);
}

#[test]
fn insufficient_permissions_message_never_leaks_upstream_role_names() {
    // The error carries what was attempted for logging; the message
    // surfaced to the client must never additionally name the roles that
    // would have been accepted.
    let http_error = into_http(GatewayError::InsufficientPermissions("DROP TABLE"));
    let message = http_error.msg.as_deref().unwrap_or_default();

    assert!(message.contains("DROP TABLE"));
    assert!(!message.to_lowercase().contains("sql-admin"));
}

#[test]
fn backend_failure_detail_is_not_forwarded_to_the_client() {
    let detail = "duplicate key value violates unique constraint \"users_pkey\"";
    let http_error = into_http(GatewayError::DelegationFailed(detail.to_owned()));
    let message = http_error.msg.as_deref().unwrap_or_default();

    assert!(!message.contains(detail));
    assert!(!message.contains("users_pkey"));
}

#[test]
fn unresolved_secret_name_is_not_forwarded_to_the_client() {
    let http_error = into_http(GatewayError::ConfigUnresolvedSecret("DB_PASSWORD".to_owned()));
    let message = http_error.msg.as_deref().unwrap_or_default();

    assert!(!message.contains("DB_PASSWORD"));
}

#[test]
fn module_not_found_name_is_recoverable_for_audit_but_not_in_client_message() {
    let gateway_error: GatewayError = DelegationError::ModuleNotFound("warehouse".to_owned()).into();
    assert_eq!(gateway_error.code(), "MODULE_NOT_FOUND");

    let http_error = into_http(gateway_error);
    let message = http_error.msg.as_deref().unwrap_or_default();
    assert!(!message.contains("warehouse"));
}

#[rstest]
#[case::insufficient_permissions(DelegationError::InsufficientPermissions("sql-write"), StatusCode::FORBIDDEN)]
#[case::unauthorized_target(DelegationError::UnauthorizedDelegationTarget, StatusCode::FORBIDDEN)]
#[case::missing_claim(DelegationError::MissingClaim("roles"), StatusCode::BAD_REQUEST)]
#[case::backend_failed(DelegationError::BackendFailed("boom".to_owned()), StatusCode::BAD_GATEWAY)]
#[case::clock_skew(DelegationError::ClockSkew, StatusCode::BAD_GATEWAY)]
#[case::unavailable(DelegationError::Unavailable, StatusCode::BAD_GATEWAY)]
#[case::module_not_found(DelegationError::ModuleNotFound("warehouse".to_owned()), StatusCode::BAD_GATEWAY)]
fn delegation_errors_convert_through_gateway_error_to_the_expected_status(
    #[case] error: DelegationError,
    #[case] expected_status: StatusCode,
) {
    let gateway_error: GatewayError = error.into();
    let http_error = into_http(gateway_error);

    assert_eq!(http_error.code, expected_status);
}
