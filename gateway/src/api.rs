//! HTTP surface: a single dispatch endpoint plus a liveness probe.
//!
//! The dispatcher hands this gateway a bearer token, a module name, a tool
//! name, and JSON arguments; everything else (session resolution, token
//! exchange, delegation) happens below this boundary.

use axum::extract::State;
use axum::middleware as axum_middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;

use crate::delegation::{CallSpec, DelegationResult};
use crate::error::GatewayError;
use crate::extract::{CurrentSession, Validated};
use crate::http::HttpError;
use crate::middleware::{auth, cors, log};
use crate::GatewayState;

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/tool-call", post(tool_call))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), auth::auth_middleware))
        .route("/healthz", get(healthz))
        .layer(axum_middleware::from_fn(log::log_middleware))
        .layer(cors::make_middleware())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    axum::http::StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    pub module: String,
    #[serde(flatten)]
    pub call: ToolCallSpec,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolCallSpec {
    Sql { statement: String, #[serde(default)] params: Vec<Value> },
    SchemaIntrospection { #[serde(default)] schema: Option<String> },
    /// `kerb_message` is the caller's own S4U2Self/S4U2Proxy request,
    /// base64-encoded — this gateway relays it, it does not build it.
    KerberosTicket { target_spn: String, kerb_message: String },
}

impl TryFrom<ToolCallSpec> for CallSpec {
    type Error = HttpError;

    fn try_from(spec: ToolCallSpec) -> Result<Self, Self::Error> {
        Ok(match spec {
            ToolCallSpec::Sql { statement, params } => CallSpec::Sql { statement, params },
            ToolCallSpec::SchemaIntrospection { schema } => CallSpec::SchemaIntrospection { schema },
            ToolCallSpec::KerberosTicket { target_spn, kerb_message } => {
                let kerb_message = base64::engine::general_purpose::STANDARD
                    .decode(kerb_message)
                    .map_err(|e| HttpError::bad_request("kerb_message_not_base64").err()(e))?;
                CallSpec::KerberosTicket { target_spn, kerb_message }
            }
        })
    }
}

async fn tool_call(
    State(state): State<GatewayState>,
    Validated(token): Validated,
    CurrentSession(session): CurrentSession,
    Json(request): Json<ToolCallRequest>,
) -> Result<Json<DelegationResult>, HttpError> {
    let call = CallSpec::try_from(request.call)?;

    let cancellation = tokio_util::sync::CancellationToken::new();
    let _timeout_guard = {
        let cancellation = cancellation.clone();
        let timeout = std::time::Duration::from_secs(state.dispatch_timeout_sec);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => cancellation.cancel(),
                () = cancellation.cancelled() => {}
            }
        })
    };

    let result = state
        .delegation
        .dispatch(&request.module, &session, &token.raw, call, &cancellation)
        .await
        .map_err(|e| HttpError::from(GatewayError::from(e)))?;

    cancellation.cancel();

    Ok(Json(result))
}
