//! `oidc-delegation-gateway`: a two-stage OAuth 2.1 / OIDC resource-server
//! gateway. Validates a requestor JWT, resolves it to a session, exchanges
//! it (RFC 8693) for a scoped delegation token per backend audience, and
//! dispatches the caller's tool call through a named [`delegation::DelegationModule`].

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate serde;

pub mod api;
pub mod audit;
pub mod claim_path;
pub mod clock;
pub mod config;
pub mod delegation;
pub mod error;
pub mod extract;
pub mod http;
pub mod jwt;
pub mod log;
pub mod middleware;
pub mod service;
pub mod session;
pub mod token_exchange;

use std::sync::Arc;

use gateway_task::ShutdownSignal;

use crate::audit::AuditSink;
use crate::config::ConfHandle;
use crate::delegation::DelegationRegistry;
use crate::jwt::{IdpRegistry, JwtValidator};
use crate::session::SessionMessageSender;

/// Application state threaded through every `axum` handler and the auth
/// middleware, mirroring the teacher's own `DgwState`.
#[derive(Clone)]
pub struct GatewayState {
    pub conf_handle: ConfHandle,
    pub audit: Arc<dyn AuditSink>,
    pub idp_registry: Arc<IdpRegistry>,
    pub jwt_validator: Arc<JwtValidator>,
    pub sessions: SessionMessageSender,
    pub delegation: DelegationRegistry,
    pub shutdown_signal: ShutdownSignal,
    pub dispatch_timeout_sec: u64,
}
