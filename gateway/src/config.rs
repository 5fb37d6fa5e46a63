//! Configuration document, secret resolution, and hot reload.
//!
//! Mirrors the teacher's own `config.rs`: a raw, directly-deserialized
//! `ConfFile`, validated into an immutable `Conf` by `Conf::from_conf_file`
//! (fallible, `anyhow::Context` at every step), handed out to the rest of the
//! application behind a `ConfHandle` snapshot so in-flight requests never see
//! a reload tear their view out from under them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::claim_path::ClaimPath;

// ---------------------------------------------------------------------
// Secret resolution
// ---------------------------------------------------------------------

/// A config leaf that is either a literal value or a `{"$secret": NAME}`
/// reference, resolved at load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SecretRef {
    Secret {
        #[serde(rename = "$secret")]
        name: String,
    },
    Literal(String),
}

pub trait SecretProvider: Send + Sync {
    /// Returns `Ok(None)` when this provider simply doesn't have the secret
    /// (try the next one), `Err` on an actual I/O failure.
    fn try_resolve(&self, name: &str) -> anyhow::Result<Option<String>>;
}

/// Reads `{secrets_dir}/{name}`, trimming trailing whitespace.
pub struct FileSecretProvider {
    pub secrets_dir: Utf8PathBuf,
}

impl SecretProvider for FileSecretProvider {
    fn try_resolve(&self, name: &str) -> anyhow::Result<Option<String>> {
        let path = self.secrets_dir.join(name);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents.trim_end().to_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("failed to read secret file {path}"))),
        }
    }
}

pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn try_resolve(&self, name: &str) -> anyhow::Result<Option<String>> {
        match std::env::var(name) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e @ std::env::VarError::NotUnicode(_)) => Err(anyhow::Error::new(e)),
        }
    }
}

/// Chains providers in order; the first one that resolves the name wins.
pub struct SecretResolver {
    providers: Vec<Box<dyn SecretProvider>>,
}

impl SecretResolver {
    pub fn new(providers: Vec<Box<dyn SecretProvider>>) -> Self {
        Self { providers }
    }

    pub fn standard(secrets_dir: Utf8PathBuf) -> Self {
        Self::new(vec![
            Box::new(FileSecretProvider { secrets_dir }),
            Box::new(EnvSecretProvider),
        ])
    }

    pub fn resolve(&self, secret_ref: &SecretRef) -> Result<secrecy::SecretString, ConfigError> {
        match secret_ref {
            SecretRef::Literal(value) => Ok(secrecy::SecretString::from(value.clone())),
            SecretRef::Secret { name } => {
                for provider in &self.providers {
                    if let Some(value) = provider
                        .try_resolve(name)
                        .map_err(|e| ConfigError::UnresolvedSecret(format!("{name}: {e:#}")))?
                    {
                        return Ok(secrecy::SecretString::from(value));
                    }
                }
                Err(ConfigError::UnresolvedSecret(name.clone()))
            }
        }
    }
}

// ---------------------------------------------------------------------
// Raw document (as read from disk)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
    Test,
}

impl Environment {
    pub fn requires_tls(self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrustedIdpFile {
    pub name: String,
    pub issuer: url::Url,
    pub audience: String,
    pub discovery_url: Option<url::Url>,
    pub jwks_uri: Option<url::Url>,
    #[serde(default = "default_algorithms")]
    pub allowed_algorithms: HashSet<String>,
    pub claim_map: ClaimMapFile,
    #[serde(default)]
    pub azp: Option<String>,
    #[serde(default = "default_clock_tolerance")]
    pub clock_tolerance_sec: u64,
    #[serde(default = "default_max_token_age")]
    pub max_token_age_sec: u64,
    #[serde(default)]
    pub require_nbf: bool,
    #[serde(default = "default_jwks_refresh")]
    pub jwks_refresh_sec: u64,
}

fn default_algorithms() -> HashSet<String> {
    ["RS256".to_owned()].into_iter().collect()
}
fn default_clock_tolerance() -> u64 {
    60
}
fn default_max_token_age() -> u64 {
    24 * 3600
}
fn default_jwks_refresh() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimMapFile {
    pub user_id: ClaimPath,
    pub username: ClaimPath,
    pub legacy_username: Option<ClaimPath>,
    pub roles: Option<ClaimPath>,
    pub scopes: Option<ClaimPath>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfigFile {
    pub idps: Vec<TrustedIdpFile>,
    #[serde(default)]
    pub require_idp_reachable: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenExchangeDefaultsFile {
    pub token_endpoint: url::Url,
    pub client_id: String,
    pub client_secret: SecretRef,
    #[serde(default = "default_auth_method")]
    pub auth_method: ClientAuthMethod,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_sec: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_sec: u64,
    #[serde(default = "default_max_entries_per_session")]
    pub max_entries_per_session: usize,
    #[serde(default = "default_max_total_entries")]
    pub max_total_entries: usize,
}

fn default_auth_method() -> ClientAuthMethod {
    ClientAuthMethod::ClientSecretBasic
}
fn default_request_timeout() -> u64 {
    10
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_max_entries_per_session() -> usize {
    32
}
fn default_max_total_entries() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleConfigFile {
    Relational {
        audience: String,
        connection_string: SecretRef,
        #[serde(default)]
        legacy_username_claim: Option<String>,
        #[serde(default)]
        roles_claim: Option<String>,
        #[serde(default = "default_schema")]
        default_schema: String,
    },
    Kerberos {
        audience: Option<String>,
        realm: String,
        /// KDC address as a `tcp://host:port` or `udp://host:port` URL —
        /// the scheme selects the relay transport, mirroring the teacher's
        /// own KDC-proxy target resolution.
        kdc_address: url::Url,
        allowed_delegation_targets: HashSet<String>,
        #[serde(default = "default_ticket_ttl")]
        ticket_cache_ttl_sec: u64,
        #[serde(default = "default_renew_threshold")]
        renew_threshold_sec: u64,
    },
}

fn default_schema() -> String {
    "public".to_owned()
}
fn default_ticket_ttl() -> u64 {
    3600
}
fn default_renew_threshold() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionConfigFile {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_sec: u64,
    #[serde(default = "default_absolute_timeout")]
    pub absolute_timeout_sec: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_sec: u64,
}

fn default_idle_timeout() -> u64 {
    900
}
fn default_absolute_timeout() -> u64 {
    8 * 3600
}
fn default_sweep_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegationConfigFile {
    pub token_exchange: TokenExchangeDefaultsFile,
    #[serde(default)]
    pub modules: HashMap<String, ModuleConfigFile>,
    #[serde(default)]
    pub session: SessionConfigFile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfFile {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub id: Option<Uuid>,
    pub auth: AuthConfigFile,
    pub delegation: DelegationConfigFile,
    /// Enabled tool set. Interface boundary; not interpreted by the core.
    #[serde(default)]
    pub mcp: serde_json::Value,
    #[serde(default = "default_log_directive")]
    pub log_directive: Option<String>,
    /// Upper bound on one dispatched tool call, from the moment a session is
    /// resolved to the moment the delegation module returns. Drives the
    /// per-request `CancellationToken` handed to `DelegationRegistry::dispatch`.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_sec: u64,
}

fn default_log_directive() -> Option<String> {
    None
}

fn default_dispatch_timeout() -> u64 {
    30
}

impl ConfFile {
    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file at {path}"))?;
        serde_json::from_str(&raw).context("failed to parse configuration file")
    }
}

use anyhow::Context as _;

// ---------------------------------------------------------------------
// Validated document
// ---------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration is invalid: {0}")]
    Invalid(String),
    #[error("secret could not be resolved: {0}")]
    UnresolvedSecret(String),
    #[error("duplicate (issuer, audience) pair in IDP registry: {0}")]
    DuplicateIdp(String),
}

#[derive(Debug, Clone)]
pub struct TrustedIdp {
    pub name: String,
    pub issuer: url::Url,
    pub audience: String,
    pub discovery_url: Option<url::Url>,
    pub jwks_uri: Option<url::Url>,
    pub allowed_algorithms: HashSet<String>,
    pub claim_map: ClaimMapFile,
    pub azp: Option<String>,
    pub clock_tolerance_sec: u64,
    pub max_token_age_sec: u64,
    pub require_nbf: bool,
    pub jwks_refresh_sec: u64,
}

#[derive(Clone)]
pub struct TokenExchangeDefaults {
    pub token_endpoint: url::Url,
    pub client_id: String,
    pub client_secret: secrecy::SecretString,
    pub auth_method: ClientAuthMethod,
    pub request_timeout_sec: u64,
    pub cache_ttl_sec: u64,
    pub max_entries_per_session: usize,
    pub max_total_entries: usize,
}

#[derive(Clone)]
pub enum ModuleConfig {
    Relational {
        audience: String,
        connection_string: secrecy::SecretString,
        legacy_username_claim: String,
        roles_claim: String,
        default_schema: String,
    },
    Kerberos {
        audience: Option<String>,
        realm: String,
        kdc_address: url::Url,
        allowed_delegation_targets: HashSet<String>,
        ticket_cache_ttl_sec: u64,
        renew_threshold_sec: u64,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub idle_timeout_sec: u64,
    pub absolute_timeout_sec: u64,
    pub sweep_interval_sec: u64,
}

/// The validated, immutable configuration document. Handed out as
/// `Arc<Conf>` so a reload never invalidates a snapshot an in-flight request
/// already holds.
pub struct Conf {
    pub id: Uuid,
    pub environment: Environment,
    pub idps: Vec<TrustedIdp>,
    pub require_idp_reachable: bool,
    pub token_exchange: TokenExchangeDefaults,
    pub modules: HashMap<String, ModuleConfig>,
    pub session: SessionPolicy,
    pub log_directive: Option<String>,
    pub dispatch_timeout_sec: u64,
}

impl Conf {
    pub fn from_conf_file(file: ConfFile, secrets: &SecretResolver) -> Result<Self, ConfigError> {
        let environment = file.environment;

        let mut seen = HashSet::new();
        let mut idps = Vec::with_capacity(file.auth.idps.len());
        for idp in file.auth.idps {
            let key = (idp.issuer.to_string(), idp.audience.clone());
            if !seen.insert(key.clone()) {
                return Err(ConfigError::DuplicateIdp(format!("{}, {}", key.0, key.1)));
            }

            if environment.requires_tls() && idp.jwks_uri.as_ref().is_some_and(|u| u.scheme() != "https") {
                return Err(ConfigError::Invalid(format!(
                    "IDP '{}' uses a non-HTTPS JWKS URI outside development/test",
                    idp.name
                )));
            }

            idps.push(TrustedIdp {
                name: idp.name,
                issuer: idp.issuer,
                audience: idp.audience,
                discovery_url: idp.discovery_url,
                jwks_uri: idp.jwks_uri,
                allowed_algorithms: idp.allowed_algorithms,
                claim_map: idp.claim_map,
                azp: idp.azp,
                clock_tolerance_sec: idp.clock_tolerance_sec,
                max_token_age_sec: idp.max_token_age_sec,
                require_nbf: idp.require_nbf,
                jwks_refresh_sec: idp.jwks_refresh_sec,
            });
        }

        if environment.requires_tls() && file.delegation.token_exchange.token_endpoint.scheme() != "https" {
            return Err(ConfigError::Invalid(
                "token exchange endpoint must use TLS outside development/test".to_owned(),
            ));
        }

        let token_exchange = TokenExchangeDefaults {
            token_endpoint: file.delegation.token_exchange.token_endpoint,
            client_id: file.delegation.token_exchange.client_id,
            client_secret: secrets.resolve(&file.delegation.token_exchange.client_secret)?,
            auth_method: file.delegation.token_exchange.auth_method,
            request_timeout_sec: file.delegation.token_exchange.request_timeout_sec,
            cache_ttl_sec: file.delegation.token_exchange.cache_ttl_sec,
            max_entries_per_session: file.delegation.token_exchange.max_entries_per_session,
            max_total_entries: file.delegation.token_exchange.max_total_entries,
        };

        let mut modules = HashMap::with_capacity(file.delegation.modules.len());
        for (name, module) in file.delegation.modules {
            let resolved = match module {
                ModuleConfigFile::Relational {
                    audience,
                    connection_string,
                    legacy_username_claim,
                    roles_claim,
                    default_schema,
                } => ModuleConfig::Relational {
                    audience,
                    connection_string: secrets.resolve(&connection_string)?,
                    legacy_username_claim: legacy_username_claim.unwrap_or_else(|| "legacy_name".to_owned()),
                    roles_claim: roles_claim.unwrap_or_else(|| "roles".to_owned()),
                    default_schema,
                },
                ModuleConfigFile::Kerberos {
                    audience,
                    realm,
                    kdc_address,
                    allowed_delegation_targets,
                    ticket_cache_ttl_sec,
                    renew_threshold_sec,
                } => ModuleConfig::Kerberos {
                    audience,
                    realm,
                    kdc_address,
                    allowed_delegation_targets,
                    ticket_cache_ttl_sec,
                    renew_threshold_sec,
                },
            };
            modules.insert(name, resolved);
        }

        Ok(Conf {
            id: file.id.unwrap_or_else(Uuid::new_v4),
            environment,
            idps,
            require_idp_reachable: file.auth.require_idp_reachable,
            token_exchange,
            modules,
            session: SessionPolicy {
                idle_timeout_sec: file.delegation.session.idle_timeout_sec,
                absolute_timeout_sec: file.delegation.session.absolute_timeout_sec,
                sweep_interval_sec: file.delegation.session.sweep_interval_sec,
            },
            log_directive: file.log_directive,
            dispatch_timeout_sec: file.dispatch_timeout_sec,
        })
    }
}

/// Atomic snapshot handle. Swapped wholesale on a successful hot reload;
/// readers never observe a partially-updated document.
#[derive(Clone)]
pub struct ConfHandle(Arc<RwLock<Arc<Conf>>>);

impl ConfHandle {
    pub fn new(conf: Conf) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(conf))))
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        self.0.read().clone()
    }

    pub fn swap(&self, conf: Conf) {
        *self.0.write() = Arc::new(conf);
    }
}
