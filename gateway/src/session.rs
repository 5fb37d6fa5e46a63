//! Session lifecycle, as a single-task actor.
//!
//! A session is created once the requestor JWT first validates and lives
//! until it is explicitly destroyed, goes idle past its timeout, or reaches
//! its absolute lifetime. Each session owns a random AEAD key, used only to
//! encrypt that session's slice of the [`crate::token_exchange::cache::TokenExchangeCache`];
//! the key never leaves this process and is zeroized on removal.
//!
//! Mirrors the teacher's own session manager: one `mpsc` channel, one task
//! owning all mutable state, everyone else talks to it through a cheaply
//! cloneable [`SessionMessageSender`] handle.

use std::cmp;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use chacha20poly1305::Key as AeadKey;
use gateway_task::{ShutdownSignal, Task};
use rand::RngCore as _;
use secure_memory::{SecureBox, SecureMemoryError};
use sha2::Digest as _;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::audit::AuditSink;
use crate::clock::Clock;
use crate::jwt::ValidatedToken;
use crate::token_exchange::TokenExchangeCache;

fn session_age_sec(clock: &dyn Clock, info: &SessionInfo) -> u64 {
    (clock.now() - info.created_at).whole_seconds().max(0) as u64
}

#[derive(Clone, Copy, Debug)]
pub struct SessionPolicy {
    pub idle_timeout_sec: u64,
    pub absolute_timeout_sec: u64,
    pub sweep_interval_sec: u64,
}

#[derive(Clone, Copy, Default, Zeroize)]
struct SessionKeyBytes([u8; 32]);

/// Backed by [`secure_memory::SecureBox`]: the key's pages are locked against
/// swapping for the lifetime of the session and zeroized on drop. `Clone` is
/// intentionally not implemented so a session's key never gets duplicated
/// outside the manager task; [`SessionKey::share`] produces an independent,
/// equally-locked copy for the one short-lived cache operation that needs it.
pub struct SessionKey(SecureBox<SessionKeyBytes>);

impl SessionKey {
    fn generate() -> Self {
        let secure = SecureBox::try_new(|bytes: &mut SessionKeyBytes| {
            rand::rngs::OsRng.fill_bytes(&mut bytes.0);
            Ok::<_, SecureMemoryError>(())
        })
        .expect("locking session key memory should not fail");
        Self(secure)
    }

    /// Builds a new, independently-locked `SessionKey` holding the same bytes.
    /// Used only by [`SessionManagerMessage::GetKey`] to hand a caller a
    /// short-lived `Arc` it can hold across one cache operation without
    /// giving it a reference into the manager's own session table.
    fn share(&self) -> Self {
        let bytes = *self.0.borrow();
        let secure = SecureBox::try_new(|slot: &mut SessionKeyBytes| {
            *slot = bytes;
            Ok::<_, SecureMemoryError>(())
        })
        .expect("locking session key memory should not fail");
        Self(secure)
    }

    pub fn as_aead_key(&self) -> AeadKey {
        AeadKey::clone_from_slice(&self.0.borrow().0)
    }
}

/// The durable, cloneable view of a session handed back to callers. Does
/// not carry the AEAD key.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub user_id: String,
    pub username: String,
    pub idp_name: String,
    pub created_at: OffsetDateTime,
    pub last_touched_at: OffsetDateTime,
}

struct Session {
    info: SessionInfo,
    key: SessionKey,
    identity: IdentityKey,
}

enum SessionManagerMessage {
    Create {
        token: ValidatedToken,
        channel: oneshot::Sender<SessionInfo>,
    },
    Touch {
        id: Uuid,
        channel: oneshot::Sender<bool>,
    },
    Get {
        id: Uuid,
        channel: oneshot::Sender<Option<SessionInfo>>,
    },
    /// Only the manager task ever reads the key; callers never see it.
    GetKey {
        id: Uuid,
        channel: oneshot::Sender<Option<Arc<SessionKey>>>,
    },
    Destroy {
        id: Uuid,
        channel: oneshot::Sender<bool>,
    },
    GetCount {
        channel: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct SessionMessageSender(mpsc::Sender<SessionManagerMessage>);

impl SessionMessageSender {
    /// Finds the existing session for this token's `(idp_name, user_id)`
    /// and touches it, or creates a new one. A validated request always
    /// maps to exactly one session.
    pub async fn get_or_create(&self, token: ValidatedToken) -> anyhow::Result<SessionInfo> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::Create { token, channel: tx })
            .await
            .ok()
            .context("couldn't send Create message")?;
        rx.await.context("couldn't receive created session")
    }

    /// Resets the idle-timeout clock; returns `false` if the session no
    /// longer exists (caller should treat this like an expired session).
    pub async fn touch(&self, id: Uuid) -> anyhow::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::Touch { id, channel: tx })
            .await
            .ok()
            .context("couldn't send Touch message")?;
        rx.await.context("couldn't receive touch result")
    }

    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<SessionInfo>> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::Get { id, channel: tx })
            .await
            .ok()
            .context("couldn't send Get message")?;
        rx.await.context("couldn't receive session info")
    }

    pub async fn get_key(&self, id: Uuid) -> anyhow::Result<Option<Arc<SessionKey>>> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::GetKey { id, channel: tx })
            .await
            .ok()
            .context("couldn't send GetKey message")?;
        rx.await.context("couldn't receive session key")
    }

    pub async fn destroy(&self, id: Uuid) -> anyhow::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::Destroy { id, channel: tx })
            .await
            .ok()
            .context("couldn't send Destroy message")?;
        rx.await.context("couldn't receive destroy result")
    }

    pub async fn count(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::GetCount { channel: tx })
            .await
            .ok()
            .context("couldn't send GetCount message")?;
        rx.await.context("couldn't receive session count")
    }
}

pub struct SessionMessageReceiver(mpsc::Receiver<SessionManagerMessage>);

pub fn session_manager_channel() -> (SessionMessageSender, SessionMessageReceiver) {
    let (tx, rx) = mpsc::channel(64);
    (SessionMessageSender(tx), SessionMessageReceiver(rx))
}

struct Deadline {
    at: tokio::time::Instant,
    session_id: Uuid,
    /// Generation at creation time; if the session has since been touched
    /// or recreated, this deadline is stale and should be ignored.
    generation: u64,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.session_id == other.session_id
    }
}
impl Eq for Deadline {}
impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other.at.cmp(&self.at).then_with(|| self.session_id.cmp(&other.session_id))
    }
}

/// `(idp_name, user_id, SHA-256(raw JWT)[:16])` — binding the raw token into
/// the key (not just the identity it asserts) means a rotated or refreshed
/// JWT for the same user mints a new session rather than reusing one keyed
/// to a token that may since have been revoked.
type IdentityKey = (String, String, [u8; 16]);

fn token_fingerprint(raw: &str) -> [u8; 16] {
    let digest = sha2::Sha256::digest(raw.as_bytes());
    let mut fingerprint = [0u8; 16];
    fingerprint.copy_from_slice(&digest[..16]);
    fingerprint
}

pub struct SessionManagerTask {
    tx: SessionMessageSender,
    rx: SessionMessageReceiver,
    sessions: HashMap<Uuid, Session>,
    by_identity: HashMap<IdentityKey, Uuid>,
    generations: HashMap<Uuid, u64>,
    policy: SessionPolicy,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    token_cache: Arc<TokenExchangeCache>,
}

impl SessionManagerTask {
    pub fn init(
        policy: SessionPolicy,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        token_cache: Arc<TokenExchangeCache>,
    ) -> Self {
        let (tx, rx) = session_manager_channel();
        Self {
            tx,
            rx,
            sessions: HashMap::new(),
            by_identity: HashMap::new(),
            generations: HashMap::new(),
            policy,
            clock,
            audit,
            token_cache,
        }
    }

    pub fn handle(&self) -> SessionMessageSender {
        self.tx.clone()
    }

    /// Reuses the session already registered for this exact
    /// `(idp_name, user_id, token fingerprint)` triple, touching it, or
    /// creates a fresh one. A different raw JWT for the same user — a
    /// refresh, a re-login — always mints a new session rather than
    /// reusing the old one.
    fn handle_create(&mut self, token: ValidatedToken) -> (SessionInfo, tokio::time::Instant) {
        let identity = (token.idp_name.clone(), token.user_id.clone(), token_fingerprint(&token.raw));

        if let Some(&id) = self.by_identity.get(&identity) {
            if let Some(deadline) = self.handle_touch(id) {
                let info = self.sessions[&id].info.clone();
                return (info, deadline);
            }
            // Stale index entry (session was destroyed without cleanup); fall through to create.
            self.by_identity.remove(&identity);
        }

        let id = Uuid::new_v4();
        let now = self.clock.now();

        let info = SessionInfo {
            id,
            user_id: token.user_id,
            username: token.username,
            idp_name: token.idp_name,
            created_at: now,
            last_touched_at: now,
        };

        self.sessions.insert(
            id,
            Session {
                info: info.clone(),
                key: SessionKey::generate(),
                identity: identity.clone(),
            },
        );
        self.by_identity.insert(identity, id);
        let generation = self.generations.entry(id).or_insert(0);
        *generation += 1;

        let idle_deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(self.policy.idle_timeout_sec);

        (info, idle_deadline)
    }

    fn handle_touch(&mut self, id: Uuid) -> Option<tokio::time::Instant> {
        let session = self.sessions.get_mut(&id)?;
        session.info.last_touched_at = self.clock.now();
        let generation = self.generations.entry(id).or_insert(0);
        *generation += 1;
        Some(tokio::time::Instant::now() + std::time::Duration::from_secs(self.policy.idle_timeout_sec))
    }

    /// Removes the session and purges its slice of the token-exchange cache
    /// so no ciphertext outlives the key that could decrypt it.
    fn handle_destroy(&mut self, id: Uuid) -> Option<SessionInfo> {
        self.generations.remove(&id);
        if let Some(session) = self.sessions.remove(&id) {
            self.by_identity.remove(&session.identity);
            self.token_cache.purge_session(id);
            Some(session.info)
        } else {
            None
        }
    }

    fn is_past_absolute_timeout(&self, id: Uuid) -> bool {
        let Some(session) = self.sessions.get(&id) else { return false };
        let age = self.clock.now() - session.info.created_at;
        age.whole_seconds() as u64 >= self.policy.absolute_timeout_sec
    }
}

#[cfg(test)]
pub(crate) fn test_key() -> SessionKey {
    SessionKey::generate()
}

#[async_trait]
impl Task for SessionManagerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "session manager";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        session_manager_task(self, shutdown_signal).await
    }
}

async fn session_manager_task(mut manager: SessionManagerTask, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    debug!("Task started");

    let mut idle_deadlines = BinaryHeap::<Deadline>::new();
    let mut absolute_interval = tokio::time::interval(std::time::Duration::from_secs(manager.policy.sweep_interval_sec.max(1)));

    let idle_sleep = tokio::time::sleep(std::time::Duration::from_secs(manager.policy.idle_timeout_sec.max(1)));
    tokio::pin!(idle_sleep);

    loop {
        tokio::select! {
            () = &mut idle_sleep, if !idle_deadlines.is_empty() => {
                while let Some(next) = idle_deadlines.peek() {
                    if next.at > tokio::time::Instant::now() {
                        break;
                    }
                    let deadline = idle_deadlines.pop().expect("checked non-empty above");
                    let current_generation = manager.generations.get(&deadline.session_id).copied().unwrap_or(0);
                    if current_generation == deadline.generation {
                        if let Some(info) = manager.handle_destroy(deadline.session_id) {
                            let age_sec = session_age_sec(manager.clock.as_ref(), &info);
                            manager
                                .audit
                                .emit(sysevent_codes::session_expired(info.id, age_sec).field("reason", "idle_timeout"))
                                .await;
                        }
                    }
                }
                if let Some(next) = idle_deadlines.peek() {
                    idle_sleep.as_mut().reset(next.at);
                }
            }
            msg = manager.rx.0.recv() => {
                let Some(msg) = msg else {
                    warn!("All senders are dead");
                    break;
                };

                match msg {
                    SessionManagerMessage::Create { token, channel } => {
                        let (info, deadline) = manager.handle_create(token);
                        let generation = manager.generations.get(&info.id).copied().unwrap_or(1);
                        idle_deadlines.push(Deadline { at: deadline, session_id: info.id, generation });
                        if idle_sleep.is_elapsed() || deadline < idle_sleep.deadline() {
                            idle_sleep.as_mut().reset(deadline);
                        }
                        manager.audit.emit(sysevent_codes::session_created(info.id, info.user_id.clone())).await;
                        let _ = channel.send(info);
                    }
                    SessionManagerMessage::Touch { id, channel } => {
                        if manager.is_past_absolute_timeout(id) {
                            if let Some(info) = manager.handle_destroy(id) {
                                let age_sec = session_age_sec(manager.clock.as_ref(), &info);
                                manager
                                    .audit
                                    .emit(sysevent_codes::session_expired(info.id, age_sec).field("reason", "absolute_timeout"))
                                    .await;
                            }
                            let _ = channel.send(false);
                            continue;
                        }

                        match manager.handle_touch(id) {
                            Some(deadline) => {
                                let generation = manager.generations.get(&id).copied().unwrap_or(0);
                                idle_deadlines.push(Deadline { at: deadline, session_id: id, generation });
                                if idle_sleep.is_elapsed() || deadline < idle_sleep.deadline() {
                                    idle_sleep.as_mut().reset(deadline);
                                }
                                let _ = channel.send(true);
                            }
                            None => {
                                let _ = channel.send(false);
                            }
                        }
                    }
                    SessionManagerMessage::Get { id, channel } => {
                        let info = manager.sessions.get(&id).map(|s| s.info.clone());
                        let _ = channel.send(info);
                    }
                    SessionManagerMessage::GetKey { id, channel } => {
                        // Keys are not individually Arc-shared by the manager;
                        // callers borrow through a short-lived Arc clone of the
                        // session's key material for the duration of one cache
                        // operation, keeping the original zeroize-on-drop in place.
                        let key = manager.sessions.get(&id).map(|s| Arc::new(s.key.share()));
                        let _ = channel.send(key);
                    }
                    SessionManagerMessage::Destroy { id, channel } => {
                        let destroyed = manager.handle_destroy(id);
                        if destroyed.is_some() {
                            manager.audit.emit(sysevent_codes::session_destroyed(id, "explicit")).await;
                        }
                        let _ = channel.send(destroyed.is_some());
                    }
                    SessionManagerMessage::GetCount { channel } => {
                        let _ = channel.send(manager.sessions.len());
                    }
                }
            }
            _ = absolute_interval.tick() => {
                let expired: Vec<Uuid> = manager.sessions.keys().copied().filter(|id| manager.is_past_absolute_timeout(*id)).collect();
                for id in expired {
                    if let Some(info) = manager.handle_destroy(id) {
                        let age_sec = session_age_sec(manager.clock.as_ref(), &info);
                        manager
                            .audit
                            .emit(sysevent_codes::session_expired(info.id, age_sec).field("reason", "absolute_timeout"))
                            .await;
                    }
                }
            }
            () = shutdown_signal.wait() => {
                break;
            }
        }
    }

    debug!("Task terminated");

    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::audit::NullAuditSink;
    use crate::clock::FixedClock;
    use crate::token_exchange::{DelegationTokenResponse, TokenExchangeClient, TokenExchangeClientError};

    fn token(idp_name: &str, user_id: &str) -> ValidatedToken {
        token_with_raw(idp_name, user_id, "header.payload.signature")
    }

    fn token_with_raw(idp_name: &str, user_id: &str, raw: &str) -> ValidatedToken {
        ValidatedToken {
            idp_name: idp_name.to_owned(),
            issuer: "https://idp.example.com".to_owned(),
            audience: "gateway".to_owned(),
            user_id: user_id.to_owned(),
            username: format!("{user_id}@example.com"),
            legacy_username: None,
            roles: vec!["sql-read".to_owned()],
            scopes: vec![],
            expires_at: OffsetDateTime::now_utc() + time::Duration::minutes(5),
            raw_claims: serde_json::json!({}),
            raw: raw.to_owned(),
        }
    }

    fn manager(policy: SessionPolicy) -> SessionManagerTask {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(OffsetDateTime::now_utc()));
        let audit: Arc<dyn AuditSink> = Arc::new(NullAuditSink);
        let token_cache = Arc::new(TokenExchangeCache::new(100, 10, 300, clock.clone()));
        SessionManagerTask::init(policy, clock, audit, token_cache)
    }

    fn default_policy() -> SessionPolicy {
        SessionPolicy {
            idle_timeout_sec: 900,
            absolute_timeout_sec: 8 * 3600,
            sweep_interval_sec: 60,
        }
    }

    #[test]
    fn create_twice_with_same_raw_token_reuses_session() {
        let mut mgr = manager(default_policy());

        let (first, _) = mgr.handle_create(token("keycloak", "alice"));
        let (second, _) = mgr.handle_create(token("keycloak", "alice"));

        assert_eq!(first.id, second.id);
        assert_eq!(mgr.sessions.len(), 1);
    }

    #[test]
    fn create_with_different_raw_token_for_same_identity_makes_new_session() {
        let mut mgr = manager(default_policy());

        let (first, _) = mgr.handle_create(token_with_raw("keycloak", "alice", "header.payload.signature-v1"));
        let (second, _) = mgr.handle_create(token_with_raw("keycloak", "alice", "header.payload.signature-v2"));

        assert_ne!(first.id, second.id);
        assert_eq!(mgr.sessions.len(), 2);
    }

    #[test]
    fn create_for_distinct_identities_makes_distinct_sessions() {
        let mut mgr = manager(default_policy());

        let (alice, _) = mgr.handle_create(token("keycloak", "alice"));
        let (bob, _) = mgr.handle_create(token("keycloak", "bob"));

        assert_ne!(alice.id, bob.id);
        assert_eq!(mgr.sessions.len(), 2);
    }

    #[test]
    fn touch_advances_last_touched_at_and_generation() {
        let mut mgr = manager(default_policy());
        let (info, _) = mgr.handle_create(token("keycloak", "alice"));
        let generation_before = mgr.generations[&info.id];

        assert!(mgr.handle_touch(info.id).is_some());

        assert_eq!(mgr.generations[&info.id], generation_before + 1);
    }

    #[test]
    fn touch_unknown_session_returns_none() {
        let mut mgr = manager(default_policy());
        assert!(mgr.handle_touch(Uuid::new_v4()).is_none());
    }

    #[test]
    fn destroy_removes_identity_index_entry() {
        let mut mgr = manager(default_policy());
        let (info, _) = mgr.handle_create(token("keycloak", "alice"));

        assert!(mgr.handle_destroy(info.id).is_some());
        assert!(!mgr.by_identity.contains_key(&("keycloak".to_owned(), "alice".to_owned(), token_fingerprint("header.payload.signature"))));
        assert!(mgr.handle_destroy(info.id).is_none());
    }

    #[test]
    fn is_past_absolute_timeout_honors_fixed_clock() {
        let clock = Arc::new(FixedClock::new(OffsetDateTime::now_utc()));
        let audit: Arc<dyn AuditSink> = Arc::new(NullAuditSink);
        let policy = SessionPolicy {
            idle_timeout_sec: 900,
            absolute_timeout_sec: 60,
            sweep_interval_sec: 60,
        };
        let token_cache = Arc::new(TokenExchangeCache::new(100, 10, 300, clock.clone() as Arc<dyn Clock>));
        let mut mgr = SessionManagerTask::init(policy, clock.clone() as Arc<dyn Clock>, audit, token_cache);

        let (info, _) = mgr.handle_create(token("keycloak", "alice"));
        assert!(!mgr.is_past_absolute_timeout(info.id));

        clock.advance(time::Duration::seconds(61));
        assert!(mgr.is_past_absolute_timeout(info.id));
    }

    struct CountingClient {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TokenExchangeClient for CountingClient {
        async fn exchange(&self, _requestor_jwt: &str, _audience: &str) -> Result<DelegationTokenResponse, TokenExchangeClientError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(DelegationTokenResponse {
                access_token: "delegated-token".to_owned(),
                expires_in_sec: Some(300),
                issued_token_type: "urn:ietf:params:oauth:token-type:access_token".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn destroying_a_session_purges_its_token_cache_entries() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(OffsetDateTime::now_utc()));
        let token_cache = Arc::new(TokenExchangeCache::new(100, 10, 300, clock.clone()));
        let counting = Arc::new(CountingClient { calls: std::sync::atomic::AtomicUsize::new(0) });
        let client = counting.clone() as Arc<dyn TokenExchangeClient>;

        let session_id = Uuid::new_v4();
        let key = test_key();

        let first = token_cache
            .get_or_exchange(session_id, &key, "warehouse-db", "requestor-jwt", client.clone())
            .await
            .unwrap();
        assert_eq!(first, "delegated-token");

        // Still cached: a second call must not hit the client again.
        token_cache.get_or_exchange(session_id, &key, "warehouse-db", "requestor-jwt", client.clone()).await.unwrap();

        token_cache.purge_session(session_id);

        // Purged: the next call must exchange again rather than serve stale ciphertext.
        token_cache.get_or_exchange(session_id, &key, "warehouse-db", "requestor-jwt", client).await.unwrap();

        assert_eq!(counting.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
