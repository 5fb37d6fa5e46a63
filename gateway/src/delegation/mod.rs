//! Delegation module contract and registry.
//!
//! A module is a backend-specific way of turning a delegation token into a
//! privileged call: role-switching SQL today, Kerberos constrained
//! delegation alongside it. The dispatcher only ever knows module names.

pub mod kerberos;
pub mod relational;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::session::SessionInfo;

#[derive(Debug, Clone)]
pub enum CallSpec {
    Sql {
        statement: String,
        params: Vec<Value>,
    },
    SchemaIntrospection {
        schema: Option<String>,
    },
    KerberosTicket {
        target_spn: String,
        kerb_message: Vec<u8>,
    },
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum DelegationResult {
    Rows(Vec<Value>),
    Command {
        success: bool,
        row_count: u64,
        command: &'static str,
        message: String,
    },
    Ticket {
        target_spn: String,
        #[serde(with = "base64_bytes")]
        kerb_reply: Vec<u8>,
        cache_hit: bool,
    },
}

/// Serializes a raw byte buffer as base64 rather than a JSON array of
/// numbers — the shape a caller's own SSPI/GSS-API stack expects a Kerberos
/// message in when it comes back over JSON.
mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    #[allow(dead_code)]
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("insufficient permissions to execute {0}")]
    InsufficientPermissions(&'static str),
    #[error("delegation target is not in the allow-list")]
    UnauthorizedDelegationTarget,
    #[error("delegation token is missing required claim: {0}")]
    MissingClaim(&'static str),
    #[error("backend call failed: {0}")]
    BackendFailed(String),
    #[error("clock skew against the key distribution center exceeds tolerance")]
    ClockSkew,
    #[error("module is currently unavailable")]
    Unavailable,
    #[error("module not found: {0}")]
    ModuleNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Up,
    Down,
}

#[async_trait]
pub trait DelegationModule: Send + Sync {
    fn name(&self) -> &str;
    async fn initialize(&self) -> Result<(), DelegationError>;
    async fn health(&self) -> HealthState;
    async fn delegate(
        &self,
        session: &SessionInfo,
        requestor_jwt: &str,
        call: CallSpec,
        cancellation: &CancellationToken,
    ) -> Result<DelegationResult, DelegationError>;
    async fn shutdown(&self);
}

#[derive(Clone, Default)]
pub struct DelegationRegistry {
    modules: HashMap<String, Arc<dyn DelegationModule>>,
}

impl DelegationRegistry {
    pub fn new(modules: HashMap<String, Arc<dyn DelegationModule>>) -> Self {
        Self { modules }
    }

    pub async fn dispatch(
        &self,
        module_name: &str,
        session: &SessionInfo,
        requestor_jwt: &str,
        call: CallSpec,
        cancellation: &CancellationToken,
    ) -> Result<DelegationResult, DelegationError> {
        let module = self
            .modules
            .get(module_name)
            .ok_or_else(|| DelegationError::ModuleNotFound(module_name.to_owned()))?;

        if module.health().await == HealthState::Down {
            return Err(DelegationError::Unavailable);
        }

        module.delegate(session, requestor_jwt, call, cancellation).await
    }

    pub async fn shutdown_all(&self) {
        for module in self.modules.values() {
            module.shutdown().await;
        }
    }
}
