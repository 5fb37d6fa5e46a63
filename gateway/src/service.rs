//! Task registry and HTTP server bring-up, mirroring the teacher's own
//! `GatewayService`/`Tasks` pattern: every long-running piece of the process
//! is a [`gateway_task::Task`], spawned once at startup and torn down
//! together on shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use gateway_task::{ChildTask, ShutdownSignal, Task};

use crate::audit::TracingAuditSink;
use crate::clock::SystemClock;
use crate::config::{Conf, ConfHandle, ModuleConfig};
use crate::delegation::kerberos::KerberosModule;
use crate::delegation::relational::RelationalModule;
use crate::delegation::{DelegationModule, DelegationRegistry};
use crate::jwt::{IdpRegistry, JwksCache, JwtValidator};
use crate::session::{SessionManagerTask, SessionPolicy};
use crate::token_exchange::{HttpTokenExchangeClient, TokenExchangeCache, TokenExchangeClient};

pub struct Tasks {
    children: Vec<ChildTask<anyhow::Result<()>>>,
}

impl Tasks {
    pub fn new() -> Self {
        Self { children: Vec::new() }
    }

    pub fn register<T>(&mut self, task: T, shutdown_signal: ShutdownSignal)
    where
        T: Task<Output = anyhow::Result<()>> + 'static,
    {
        self.children.push(gateway_task::spawn_task(task, shutdown_signal));
    }
}

/// Bounds any request issued over the shared client (JWKS fetch, in
/// particular, which has no per-call timeout of its own — unlike the
/// token-exchange client, which sets one from its own config).
const DEFAULT_HTTP_TIMEOUT_SEC: u64 = 15;

async fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SEC))
        .build()
        .expect("reqwest client with the default TLS backend always builds")
}

#[allow(clippy::too_many_arguments)]
async fn build_delegation_registry(
    conf: &Conf,
    http: reqwest::Client,
    token_exchange_client: Arc<dyn TokenExchangeClient>,
    token_cache: Arc<TokenExchangeCache>,
    sessions: crate::session::SessionMessageSender,
    clock: Arc<dyn crate::clock::Clock>,
    audit: Arc<dyn crate::audit::AuditSink>,
) -> anyhow::Result<DelegationRegistry> {
    let mut modules: HashMap<String, Arc<dyn DelegationModule>> = HashMap::new();

    for (name, module_config) in &conf.modules {
        let module: Arc<dyn DelegationModule> = match module_config {
            ModuleConfig::Relational {
                audience,
                connection_string,
                legacy_username_claim,
                roles_claim,
                default_schema,
            } => {
                use secrecy::ExposeSecret as _;
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(10)
                    .connect(connection_string.expose_secret())
                    .await
                    .with_context(|| format!("failed to connect relational module '{name}'"))?;

                Arc::new(RelationalModule::new(
                    name.clone(),
                    audience.clone(),
                    pool,
                    legacy_username_claim.clone(),
                    roles_claim.clone(),
                    default_schema.clone(),
                    token_exchange_client.clone(),
                    token_cache.clone(),
                    sessions.clone(),
                    audit.clone(),
                ))
            }
            ModuleConfig::Kerberos {
                audience,
                realm,
                kdc_address,
                allowed_delegation_targets,
                ticket_cache_ttl_sec,
                renew_threshold_sec,
            } => Arc::new(KerberosModule::new(
                name.clone(),
                audience.clone(),
                realm.clone(),
                kdc_address.clone(),
                allowed_delegation_targets.clone(),
                *ticket_cache_ttl_sec,
                *renew_threshold_sec,
                clock.clone(),
                audience.as_ref().map(|_| token_exchange_client.clone()),
                audience.as_ref().map(|_| token_cache.clone()),
                sessions.clone(),
                audit.clone(),
            )),
        };

        module.initialize().await.with_context(|| format!("failed to initialize module '{name}'"))?;
        modules.insert(name.clone(), module);
    }

    Ok(DelegationRegistry::new(modules))
}

/// Assembles every long-running task and the `axum::Router`, and runs the
/// HTTP server until shutdown is signaled.
pub async fn run(conf_handle: ConfHandle, shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    let conf = conf_handle.get_conf();
    let clock: Arc<dyn crate::clock::Clock> = Arc::new(SystemClock);
    let audit: Arc<dyn crate::audit::AuditSink> = Arc::new(TracingAuditSink);
    let http = build_http_client().await;

    let idp_registry = Arc::new(IdpRegistry::new(&conf.idps));
    let jwks_cache = Arc::new(JwksCache::new(http.clone()));
    let jwt_validator = Arc::new(JwtValidator::new(idp_registry.clone(), jwks_cache, clock.clone()));

    let token_exchange_client: Arc<dyn TokenExchangeClient> =
        Arc::new(HttpTokenExchangeClient::new(http.clone(), conf.token_exchange.clone()));
    let token_cache = Arc::new(TokenExchangeCache::new(
        conf.token_exchange.max_total_entries,
        conf.token_exchange.max_entries_per_session,
        conf.token_exchange.cache_ttl_sec,
        clock.clone(),
    ));

    let session_policy = SessionPolicy {
        idle_timeout_sec: conf.session.idle_timeout_sec,
        absolute_timeout_sec: conf.session.absolute_timeout_sec,
        sweep_interval_sec: conf.session.sweep_interval_sec,
    };
    let session_manager = SessionManagerTask::init(session_policy, clock.clone(), audit.clone(), token_cache.clone());
    let sessions = session_manager.handle();

    let delegation = build_delegation_registry(
        &conf,
        http,
        token_exchange_client,
        token_cache,
        sessions.clone(),
        clock.clone(),
        audit.clone(),
    )
    .await?;

    let state = crate::GatewayState {
        conf_handle: conf_handle.clone(),
        audit,
        idp_registry,
        jwt_validator,
        sessions,
        delegation,
        shutdown_signal: shutdown_signal.clone(),
        dispatch_timeout_sec: conf.dispatch_timeout_sec,
    };

    let mut tasks = Tasks::new();
    tasks.register(session_manager, shutdown_signal.clone());
    tasks.register(
        gateway_log::LogDeleterTask::<crate::log::GatewayLog>::new(camino::Utf8PathBuf::from("/var/log/gateway")),
        shutdown_signal.clone(),
    );

    let router = crate::api::router(state.clone());

    let addr: SocketAddr = "0.0.0.0:8443".parse().expect("static address always parses");
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind HTTP listener")?;

    info!(%addr, "HTTP server listening");

    let mut shutdown_signal_for_server = shutdown_signal.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal_for_server.wait().await;
        })
        .await
        .context("HTTP server terminated unexpectedly")?;

    state.delegation.shutdown_all().await;

    Ok(())
}
