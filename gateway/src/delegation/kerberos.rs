//! Kerberos constrained-delegation relay, MS-KKDCP-style.
//!
//! No crate in this workspace exposes a verified high-level S4U2Self/S4U2Proxy
//! client, and the teacher's own Kerberos integration
//! (`http/controllers/kdc_proxy.rs`) doesn't build one either — it proxies an
//! already-built, opaque Kerberos message to a real KDC over a bare
//! `TcpStream`/`UdpSocket` and hands the reply straight back. This module
//! does the same thing: the caller's own SSPI/GSS-API stack builds the
//! S4U2Self or S4U2Proxy request, this module checks the requested SPN
//! against the allow-list *before* any network round trip, then relays the
//! message bytes to the configured KDC and returns the raw reply.
//!
//! Repeated relays of the same message are deduplicated for
//! `ticket_cache_ttl_sec` (less `renew_threshold_sec`, to force a fresh relay
//! before the cached reply is likely stale) — this module cannot decrypt a
//! KDC reply to read its real expiry, so the cache window is a configured
//! bound on how long an identical request is trusted, not a read of ticket
//! lifetime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::clock::Clock;
use crate::delegation::{CallSpec, DelegationError, DelegationModule, DelegationResult, HealthState};
use crate::jwt::decode_claims_unverified;
use crate::session::{SessionInfo, SessionMessageSender};
use crate::token_exchange::{TokenExchangeCache, TokenExchangeClient};

#[derive(Debug, Clone)]
struct CachedReply {
    message: Vec<u8>,
    cached_at: time::OffsetDateTime,
}

type RelayCacheKey = (Uuid, String, [u8; 32]);

pub struct KerberosModule {
    name: String,
    audience: Option<String>,
    realm: String,
    kdc_address: url::Url,
    allowed_delegation_targets: HashSet<String>,
    ticket_cache_ttl_sec: u64,
    renew_threshold_sec: u64,
    clock: Arc<dyn Clock>,
    token_exchange_client: Option<Arc<dyn TokenExchangeClient>>,
    token_cache: Option<Arc<TokenExchangeCache>>,
    sessions: SessionMessageSender,
    audit: Arc<dyn AuditSink>,

    replies: SyncMutex<HashMap<RelayCacheKey, CachedReply>>,
    call_locks: SyncMutex<HashMap<RelayCacheKey, Arc<AsyncMutex<()>>>>,
}

impl KerberosModule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        audience: Option<String>,
        realm: String,
        kdc_address: url::Url,
        allowed_delegation_targets: HashSet<String>,
        ticket_cache_ttl_sec: u64,
        renew_threshold_sec: u64,
        clock: Arc<dyn Clock>,
        token_exchange_client: Option<Arc<dyn TokenExchangeClient>>,
        token_cache: Option<Arc<TokenExchangeCache>>,
        sessions: SessionMessageSender,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            name,
            audience,
            realm,
            kdc_address,
            allowed_delegation_targets,
            ticket_cache_ttl_sec,
            renew_threshold_sec,
            clock,
            token_exchange_client,
            token_cache,
            sessions,
            audit,
            replies: SyncMutex::new(HashMap::new()),
            call_locks: SyncMutex::new(HashMap::new()),
        }
    }

    async fn probe(&self) -> bool {
        let host = self.kdc_address.host_str().unwrap_or_default();
        let port = self.kdc_address.port_or_known_default().unwrap_or(88);
        tokio::time::timeout(std::time::Duration::from_secs(2), TcpStream::connect((host, port))).await.is_ok_and(|r| r.is_ok())
    }

    fn call_lock(&self, key: &RelayCacheKey) -> Arc<AsyncMutex<()>> {
        self.call_locks.lock().entry(*key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Resolves the legacy identity for the caller and, when `audience` is
    /// configured, does so through token exchange first — this is the
    /// authorization gate for the module: a session that cannot exchange
    /// into this module's audience has no business relaying a Kerberos
    /// message through it, even though the resolved name itself isn't
    /// embedded in the relayed message.
    async fn legacy_username(
        &self,
        session: &SessionInfo,
        requestor_jwt: &str,
        cancellation: &CancellationToken,
    ) -> Result<String, DelegationError> {
        if let (Some(audience), Some(client), Some(cache)) = (&self.audience, &self.token_exchange_client, &self.token_cache) {
            let session_key = self
                .sessions
                .get_key(session.id)
                .await
                .map_err(|e| DelegationError::BackendFailed(e.to_string()))?
                .ok_or(DelegationError::Unavailable)?;

            let delegation_token = tokio::select! {
                biased;
                () = cancellation.cancelled() => return Err(DelegationError::BackendFailed("dispatch cancelled".to_owned())),
                result = cache.get_or_exchange(session.id, &session_key, audience, requestor_jwt, client.clone()) => {
                    result.map_err(|e| DelegationError::BackendFailed(e.to_string()))?
                }
            };

            let claims = decode_claims_unverified(&delegation_token)
                .map_err(|_| DelegationError::BackendFailed("malformed delegation token".to_owned()))?;

            return claims
                .get("legacy_username")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
                .ok_or(DelegationError::MissingClaim("legacyUsername"));
        }

        let claims = decode_claims_unverified(requestor_jwt).map_err(|_| DelegationError::BackendFailed("malformed requestor JWT".to_owned()))?;
        claims
            .get("legacy_username")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .or_else(|| Some(session.username.clone()))
            .ok_or(DelegationError::MissingClaim("legacyUsername"))
    }

    /// Relays a raw Kerberos message to the configured KDC and returns the
    /// raw reply, mirroring `kdc_proxy.rs`'s TCP/UDP framing exactly: TCP
    /// carries a 4-byte big-endian length prefix per message; UDP strips it
    /// on the way out (a datagram doesn't need one) and the prefix is
    /// rebuilt on the reply so callers see the same wire shape either way.
    async fn relay(&self, message: &[u8], cancellation: &CancellationToken) -> Result<Vec<u8>, DelegationError> {
        let host = self.kdc_address.host_str().ok_or(DelegationError::Unavailable)?;
        let port = self.kdc_address.port_or_known_default().unwrap_or(88);

        let relay = match self.kdc_address.scheme() {
            "udp" => self.relay_udp(host, port, message),
            _ => self.relay_tcp(host, port, message),
        };

        tokio::select! {
            biased;
            () = cancellation.cancelled() => Err(DelegationError::BackendFailed("dispatch cancelled".to_owned())),
            result = relay => result,
        }
    }

    async fn relay_tcp(&self, host: &str, port: u16, message: &[u8]) -> Result<Vec<u8>, DelegationError> {
        let mut connection = match TcpStream::connect((host, port)).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, module = %self.name, "KDC unreachable");
                self.audit.emit(sysevent_codes::kdc_unreachable(&e)).await;
                return Err(DelegationError::Unavailable);
            }
        };

        connection
            .write_all(message)
            .await
            .map_err(|e| DelegationError::BackendFailed(format!("failed to write Kerberos message to KDC: {e}")))?;

        let len = connection
            .read_u32()
            .await
            .map_err(|e| DelegationError::BackendFailed(format!("failed to read KDC reply length: {e}")))?;

        let mut buf = vec![0u8; 4 + len as usize];
        buf[0..4].copy_from_slice(&len.to_be_bytes());
        connection
            .read_exact(&mut buf[4..])
            .await
            .map_err(|e| DelegationError::BackendFailed(format!("failed to read KDC reply body: {e}")))?;

        Ok(buf)
    }

    async fn relay_udp(&self, host: &str, port: u16, message: &[u8]) -> Result<Vec<u8>, DelegationError> {
        let payload = message.get(4..).ok_or_else(|| DelegationError::BackendFailed("Kerberos message missing length prefix".to_owned()))?;

        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(|e| DelegationError::BackendFailed(format!("failed to bind UDP socket: {e}")))?;
        if let Err(e) = socket.connect((host, port)).await {
            error!(error = %e, module = %self.name, "KDC unreachable");
            self.audit.emit(sysevent_codes::kdc_unreachable(&e)).await;
            return Err(DelegationError::Unavailable);
        }

        socket
            .send(payload)
            .await
            .map_err(|e| DelegationError::BackendFailed(format!("failed to send Kerberos message to KDC: {e}")))?;

        let mut datagram = vec![0u8; 2048];
        let received = socket.recv(&mut datagram).await.map_err(|e| DelegationError::BackendFailed(format!("failed to receive KDC reply: {e}")))?;
        datagram.truncate(received);

        let len = u32::try_from(datagram.len()).map_err(|_| DelegationError::BackendFailed("KDC reply too large".to_owned()))?;
        let mut buf = Vec::with_capacity(4 + datagram.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&datagram);

        Ok(buf)
    }
}

#[async_trait]
impl DelegationModule for KerberosModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), DelegationError> {
        // There is no persistent KDC connection to open — every relay dials
        // the KDC fresh, exactly like `kdc_proxy.rs` does per request. This
        // only confirms the configured address is reachable before the
        // module is registered.
        if self.probe().await {
            Ok(())
        } else {
            error!(module = %self.name, realm = %self.realm, kdc = %self.kdc_address, "KDC unreachable at initialize");
            Err(DelegationError::Unavailable)
        }
    }

    async fn health(&self) -> HealthState {
        if self.probe().await {
            HealthState::Up
        } else {
            HealthState::Down
        }
    }

    async fn delegate(
        &self,
        session: &SessionInfo,
        requestor_jwt: &str,
        call: CallSpec,
        cancellation: &CancellationToken,
    ) -> Result<DelegationResult, DelegationError> {
        let CallSpec::KerberosTicket { target_spn, kerb_message } = call else {
            return Err(DelegationError::BackendFailed("Kerberos module only services ticket requests".to_owned()));
        };

        // Allow-list check happens before any KDC round trip. SPNs are
        // conventionally case-insensitive in the host/realm portion, so the
        // comparison is too rather than requiring operators to enumerate
        // every casing a client might send.
        let target_allowed = self
            .allowed_delegation_targets
            .iter()
            .any(|allowed| focaccia::unicode_case_eq(allowed, &target_spn));
        if !target_allowed {
            self.audit.emit(sysevent_codes::kerberos_target_denied(target_spn.clone())).await;
            return Err(DelegationError::UnauthorizedDelegationTarget);
        }

        let _legacy_username = self.legacy_username(session, requestor_jwt, cancellation).await?;

        let digest: [u8; 32] = Sha256::digest(&kerb_message).into();
        let key: RelayCacheKey = (session.id, target_spn.clone(), digest);

        let lock = self.call_lock(&key);
        let _guard = lock.lock().await;

        let now = self.clock.now();

        if let Some(cached) = self.replies.lock().get(&key) {
            let age = now - cached.cached_at;
            let ttl = time::Duration::seconds(self.ticket_cache_ttl_sec as i64) - time::Duration::seconds(self.renew_threshold_sec as i64);
            if age < ttl {
                return Ok(DelegationResult::Ticket {
                    target_spn,
                    kerb_reply: cached.message.clone(),
                    cache_hit: true,
                });
            }
        }

        let reply = self.relay(&kerb_message, cancellation).await?;
        self.audit.emit(sysevent_codes::kerberos_tgt_acquired(target_spn.clone())).await;

        self.replies.lock().insert(
            key,
            CachedReply {
                message: reply.clone(),
                cached_at: now,
            },
        );

        Ok(DelegationResult::Ticket {
            target_spn,
            kerb_reply: reply,
            cache_hit: false,
        })
    }

    async fn shutdown(&self) {
        self.replies.lock().clear();
    }
}
