//! Encrypted, session-scoped token-exchange cache.
//!
//! Each entry is keyed by `fingerprint = SHA-256(sessionId ∥ audience ∥
//! SHA-256(requestorJWT))` and encrypted at rest with the owning session's
//! AEAD key, so a heap dump or a bug elsewhere in the process can't recover
//! a delegation token for a session it doesn't hold the key for. Concurrent
//! callers asking for the same (session, audience, requestor JWT) within the
//! same tick coalesce onto a single upstream exchange (singleflight);
//! eviction is a single global LRU bounded by `max_total_entries`, with a
//! per-session cap enforced on insert.

use std::collections::HashMap;
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit as _, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use futures::future::Shared;
use futures::FutureExt as _;
use lru::LruCache;
use parking_lot::Mutex as SyncMutex;
use rand::RngCore as _;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::session::SessionKey;
use crate::token_exchange::client::{TokenExchangeClient, TokenExchangeClientError};

pub type Fingerprint = [u8; 32];

fn fingerprint(session_id: Uuid, audience: &str, requestor_jwt: &str) -> Fingerprint {
    let mut jwt_digest = Sha256::new();
    jwt_digest.update(requestor_jwt.as_bytes());
    let jwt_hash = jwt_digest.finalize();

    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(audience.as_bytes());
    hasher.update(jwt_hash);
    hasher.finalize().into()
}

struct CachedEntry {
    session_id: Uuid,
    ciphertext: Vec<u8>,
    nonce: [u8; 12],
    expires_at: OffsetDateTime,
    issued_token_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenExchangeError {
    #[error(transparent)]
    Client(#[from] TokenExchangeClientError),
    #[error("failed to decrypt cached delegation token")]
    DecryptionFailed,
}

type ExchangeHandle = Shared<futures::future::BoxFuture<'static, Result<(String, Option<u64>, String), String>>>;

pub struct TokenExchangeCache {
    entries: SyncMutex<LruCache<Fingerprint, CachedEntry>>,
    per_session_counts: SyncMutex<HashMap<Uuid, usize>>,
    max_entries_per_session: usize,
    default_ttl_sec: u64,
    inflight: SyncMutex<HashMap<Fingerprint, ExchangeHandle>>,
    clock: Arc<dyn Clock>,
}

impl TokenExchangeCache {
    pub fn new(max_total_entries: usize, max_entries_per_session: usize, default_ttl_sec: u64, clock: Arc<dyn Clock>) -> Self {
        let capacity = std::num::NonZeroUsize::new(max_total_entries.max(1)).expect("max(1) is never zero");
        Self {
            entries: SyncMutex::new(LruCache::new(capacity)),
            per_session_counts: SyncMutex::new(HashMap::new()),
            max_entries_per_session,
            default_ttl_sec,
            inflight: SyncMutex::new(HashMap::new()),
            clock,
        }
    }

    /// Returns a valid delegation token for `audience`, from cache if a
    /// fresh entry exists, otherwise by calling `client.exchange` (with
    /// in-flight coalescing across concurrent callers) and caching the
    /// result under the session's key.
    pub async fn get_or_exchange(
        &self,
        session_id: Uuid,
        session_key: &SessionKey,
        audience: &str,
        requestor_jwt: &str,
        client: Arc<dyn TokenExchangeClient>,
    ) -> Result<String, TokenExchangeError> {
        let key = fingerprint(session_id, audience, requestor_jwt);

        if let Some(token) = self.lookup(&key, session_key) {
            return Ok(token);
        }

        let handle = {
            let mut inflight = self.inflight.lock();
            inflight
                .entry(key)
                .or_insert_with(|| {
                    let requestor_jwt = requestor_jwt.to_owned();
                    let audience = audience.to_owned();
                    let client = client.clone();
                    async move {
                        client
                            .exchange(&requestor_jwt, &audience)
                            .await
                            .map(|r| (r.access_token, r.expires_in_sec, r.issued_token_type))
                            .map_err(|e| e.to_string())
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        let result = handle.await;
        self.inflight.lock().remove(&key);

        let (access_token, expires_in_sec, issued_token_type) =
            result.map_err(|e| TokenExchangeError::Client(TokenExchangeClientError::Transport(e)))?;

        let ttl = expires_in_sec.unwrap_or(self.default_ttl_sec).min(self.default_ttl_sec);
        self.insert(key, session_id, session_key, &access_token, ttl, issued_token_type);

        Ok(access_token)
    }

    fn lookup(&self, key: &Fingerprint, session_key: &SessionKey) -> Option<String> {
        let mut entries = self.entries.lock();
        let entry = entries.get(key)?;
        if self.clock.now() >= entry.expires_at {
            let session_id = entry.session_id;
            entries.pop(key);
            drop(entries);
            self.decrement_session_count(session_id);
            return None;
        }

        decrypt(session_key, key, &entry.nonce, &entry.ciphertext)
    }

    fn insert(
        &self,
        key: Fingerprint,
        session_id: Uuid,
        session_key: &SessionKey,
        access_token: &str,
        ttl_sec: u64,
        issued_token_type: String,
    ) {
        {
            let mut counts = self.per_session_counts.lock();
            let count = counts.entry(session_id).or_insert(0);
            if *count >= self.max_entries_per_session {
                // Per-session cap reached: evict this session's oldest entry
                // before inserting, rather than refusing the new one.
                let victim = {
                    let entries = self.entries.lock();
                    entries
                        .iter()
                        .rev()
                        .find(|(_, e)| e.session_id == session_id)
                        .map(|(k, _)| *k)
                };
                if let Some(victim) = victim {
                    self.entries.lock().pop(&victim);
                    *count = count.saturating_sub(1);
                }
            }
            *count += 1;
        }

        let (nonce, ciphertext) = encrypt(session_key, &key, access_token.as_bytes());
        let expires_at = self.clock.now() + time::Duration::seconds(ttl_sec as i64);

        let evicted = self.entries.lock().push(
            key,
            CachedEntry {
                session_id,
                ciphertext,
                nonce,
                expires_at,
                issued_token_type,
            },
        );
        if let Some((_, evicted_entry)) = evicted {
            self.decrement_session_count(evicted_entry.session_id);
        }
    }

    fn decrement_session_count(&self, session_id: Uuid) {
        let mut counts = self.per_session_counts.lock();
        if let Some(count) = counts.get_mut(&session_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&session_id);
            }
        }
    }

    /// Purges every entry belonging to `session_id`; called when a session
    /// is destroyed so no ciphertext outlives the key that could decrypt it.
    pub fn purge_session(&self, session_id: Uuid) {
        let victims: Vec<Fingerprint> = {
            let entries = self.entries.lock();
            entries.iter().filter(|(_, e)| e.session_id == session_id).map(|(k, _)| *k).collect()
        };
        let mut entries = self.entries.lock();
        for key in victims {
            entries.pop(&key);
        }
        drop(entries);
        self.per_session_counts.lock().remove(&session_id);
    }
}

/// Binds the ciphertext to `fingerprint` as associated data, so it cannot be
/// decrypted (or swapped onto a different cache entry) under the same
/// session key once detached from the fingerprint it was stored under.
fn encrypt(session_key: &SessionKey, fingerprint: &Fingerprint, plaintext: &[u8]) -> ([u8; 12], Vec<u8>) {
    let cipher = ChaCha20Poly1305::new(&session_key.as_aead_key());
    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let payload = Payload { msg: plaintext, aad: fingerprint.as_slice() };
    let ciphertext = cipher.encrypt(nonce, payload).expect("encryption over a bounded in-memory buffer does not fail");
    (nonce_bytes, ciphertext)
}

fn decrypt(session_key: &SessionKey, fingerprint: &Fingerprint, nonce: &[u8; 12], ciphertext: &[u8]) -> Option<String> {
    let cipher = ChaCha20Poly1305::new(&session_key.as_aead_key());
    let payload = Payload { msg: ciphertext, aad: fingerprint.as_slice() };
    let plaintext = cipher.decrypt(Nonce::from_slice(nonce), payload).ok()?;
    String::from_utf8(plaintext).ok()
}
