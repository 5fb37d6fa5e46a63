//! Trusted-IDP registry, JWKS cache, and the requestor-JWT validator.
//!
//! This is the gate every request passes through first: [`JwtValidator::validate`]
//! implements the eight-step check (shape, issuer lookup, algorithm allow-list,
//! key fetch, signature, time window, audience, azp) and maps claims into a
//! [`ValidatedToken`] via the caller-supplied [`crate::claim_path::ClaimPath`]
//! rules. Nothing downstream re-parses the raw token; everything else takes a
//! `&ValidatedToken`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::Shared;
use futures::FutureExt as _;
use parking_lot::Mutex as SyncMutex;
use picky::jose::jwk::Jwk;
use picky::jose::jws::JwsAlg;
use picky::jose::jwt::{JwtDate, JwtSig, JwtValidator as PickyJwtValidator};
use picky::key::PublicKey;
use serde_json::Value;

use crate::clock::Clock;
use crate::config::TrustedIdp;

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("token is not a well-formed JWT")]
    JwtInvalidFormat,
    #[error("token signature does not verify")]
    JwtBadSignature,
    #[error("token has expired")]
    JwtExpired,
    #[error("token is not yet valid")]
    JwtNotYetValid,
    #[error("token audience does not match the expected audience")]
    JwtBadAudience,
    #[error("token issuer is not recognized")]
    JwtBadIssuer,
    #[error("token algorithm is not in the trusted identity provider's allow-list")]
    JwtBadAlgorithm,
    #[error("token is missing required claim: {0}")]
    JwtMissingClaim(&'static str),
    #[error("no trusted identity provider matches this token's (issuer, audience)")]
    UnknownIdp,
    #[error("could not fetch signing keys from the identity provider: {0}")]
    JwksUnavailable(String),
}

impl JwtError {
    pub const fn code(&self) -> &'static str {
        match self {
            JwtError::JwtInvalidFormat => "JWT_INVALID_FORMAT",
            JwtError::JwtBadSignature => "JWT_BAD_SIGNATURE",
            JwtError::JwtExpired => "JWT_EXPIRED",
            JwtError::JwtNotYetValid => "JWT_NOT_YET_VALID",
            JwtError::JwtBadAudience => "JWT_BAD_AUDIENCE",
            JwtError::JwtBadIssuer => "JWT_BAD_ISSUER",
            JwtError::JwtBadAlgorithm => "JWT_BAD_ALGORITHM",
            JwtError::JwtMissingClaim(_) => "JWT_MISSING_CLAIM",
            JwtError::UnknownIdp => "UNKNOWN_IDP",
            JwtError::JwksUnavailable(_) => "JWKS_UNAVAILABLE",
        }
    }
}

/// Claims mapped out of a validated requestor JWT, per the owning IDP's
/// `claim_map`. `raw_claims` is kept around for delegation modules that need
/// a claim the registry doesn't know to name ahead of time.
#[derive(Debug, Clone)]
pub struct ValidatedToken {
    pub idp_name: String,
    pub issuer: String,
    pub audience: String,
    pub user_id: String,
    pub username: String,
    pub legacy_username: Option<String>,
    pub roles: Vec<String>,
    pub scopes: Vec<String>,
    pub expires_at: time::OffsetDateTime,
    pub raw_claims: Value,
    /// The original compact JWT, forwarded as `subject_token` in token
    /// exchange calls. Never logged or included in audit metadata.
    pub raw: String,
}

/// (issuer, audience) -> `TrustedIdp`, enforced unique at construction per
/// the configuration loader's own check; this is a second, cheap guard.
pub struct IdpRegistry {
    by_issuer_audience: HashMap<(String, String), TrustedIdp>,
}

impl IdpRegistry {
    pub fn new(idps: &[TrustedIdp]) -> Self {
        let mut by_issuer_audience = HashMap::with_capacity(idps.len());
        for idp in idps {
            by_issuer_audience.insert((idp.issuer.to_string(), idp.audience.clone()), idp.clone());
        }
        Self { by_issuer_audience }
    }

    fn find(&self, issuer: &str, audience: &str) -> Option<&TrustedIdp> {
        self.by_issuer_audience.get(&(issuer.to_owned(), audience.to_owned()))
    }

    /// An issuer can be paired with more than one audience (different
    /// clients trusting the same IDP); this scans for any entry with a
    /// matching issuer so the validator can report `JwtBadAudience` instead
    /// of the less precise `UnknownIdp` when the issuer is known.
    fn issuer_known(&self, issuer: &str) -> bool {
        self.by_issuer_audience.keys().any(|(iss, _)| iss == issuer)
    }
}

type FetchHandle = Shared<futures::future::BoxFuture<'static, Result<Arc<HashMap<String, Jwk>>, String>>>;

/// Per-issuer JWKS document, fetched at most once concurrently
/// (singleflight) and refreshed on the IDP's configured cadence or on a
/// cache miss for an unrecognized `kid` (key rotation).
pub struct JwksCache {
    http: reqwest::Client,
    entries: SyncMutex<HashMap<String, (Arc<HashMap<String, Jwk>>, time::OffsetDateTime)>>,
    inflight: SyncMutex<HashMap<String, FetchHandle>>,
}

impl JwksCache {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            entries: SyncMutex::new(HashMap::new()),
            inflight: SyncMutex::new(HashMap::new()),
        }
    }

    async fn fetch(http: reqwest::Client, jwks_uri: url::Url) -> Result<Arc<HashMap<String, Jwk>>, String> {
        #[derive(serde::Deserialize)]
        struct JwkSet {
            keys: Vec<Jwk>,
        }

        let response = http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;

        let set: JwkSet = response.json().await.map_err(|e| e.to_string())?;
        let by_kid = set
            .keys
            .into_iter()
            .filter_map(|jwk| jwk.key_id().map(|kid| (kid.to_owned(), jwk)))
            .collect();

        Ok(Arc::new(by_kid))
    }

    /// Returns the `kid -> Jwk` map for `idp`, fetching (once, even under
    /// concurrent callers) if absent or past `jwks_refresh_sec`.
    pub async fn get(&self, idp: &TrustedIdp, clock: &dyn Clock) -> Result<Arc<HashMap<String, Jwk>>, JwtError> {
        let Some(jwks_uri) = idp.jwks_uri.clone() else {
            return Err(JwtError::JwksUnavailable(format!("IDP '{}' has no jwks_uri configured", idp.name)));
        };

        let fresh_until = |fetched_at: time::OffsetDateTime| {
            fetched_at + time::Duration::seconds(idp.jwks_refresh_sec as i64)
        };

        if let Some((keys, fetched_at)) = self.entries.lock().get(&idp.name).cloned() {
            if clock.now() < fresh_until(fetched_at) {
                return Ok(keys);
            }
        }

        let handle = {
            let mut inflight = self.inflight.lock();
            inflight
                .entry(idp.name.clone())
                .or_insert_with(|| {
                    let http = self.http.clone();
                    Self::fetch(http, jwks_uri).boxed().shared()
                })
                .clone()
        };

        let result = handle.await;
        self.inflight.lock().remove(&idp.name);

        let keys = result.map_err(JwtError::JwksUnavailable)?;
        self.entries.lock().insert(idp.name.clone(), (keys.clone(), clock.now()));
        Ok(keys)
    }

    /// Drops the cached document so the next `get` fetches unconditionally;
    /// used when signature verification fails with an unrecognized `kid`.
    pub fn invalidate(&self, idp_name: &str) {
        self.entries.lock().remove(idp_name);
    }
}

/// `aud` may be a scalar string or an array of strings (RFC 7519 §4.1.3);
/// this yields every candidate value so a caller can try each one against
/// the IDP registry rather than assuming a single string.
fn audience_candidates(claims: &Value) -> Vec<&str> {
    match claims.get("aud") {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

pub struct JwtValidator {
    registry: Arc<IdpRegistry>,
    jwks: Arc<JwksCache>,
    clock: Arc<dyn Clock>,
}

impl JwtValidator {
    pub fn new(registry: Arc<IdpRegistry>, jwks: Arc<JwksCache>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, jwks, clock }
    }

    /// Implements the requestor-JWT validation algorithm: shape, issuer
    /// lookup, algorithm allow-list, key fetch (with one retry on
    /// unrecognized `kid`), signature and time-window check, audience, and
    /// `azp` (when configured).
    pub async fn validate(&self, raw_token: &str) -> Result<ValidatedToken, JwtError> {
        let unverified_claims = decode_claims_unverified(raw_token)?;

        let issuer = unverified_claims
            .get("iss")
            .and_then(Value::as_str)
            .ok_or(JwtError::JwtMissingClaim("iss"))?;
        let candidates = audience_candidates(&unverified_claims);
        if candidates.is_empty() {
            return Err(JwtError::JwtMissingClaim("aud"));
        }

        let idp = candidates
            .iter()
            .find_map(|&audience| self.registry.find(issuer, audience))
            .ok_or_else(|| {
                if self.registry.issuer_known(issuer) {
                    JwtError::JwtBadAudience
                } else {
                    JwtError::UnknownIdp
                }
            })?;

        let header = decode_header_unverified(raw_token)?;
        if !idp.allowed_algorithms.contains(&header.alg) {
            return Err(JwtError::JwtBadAlgorithm);
        }

        let mut keys = self.jwks.get(idp, self.clock.as_ref()).await?;
        let mut jwk = keys.get(&header.kid);
        if jwk.is_none() {
            self.jwks.invalidate(&idp.name);
            keys = self.jwks.get(idp, self.clock.as_ref()).await?;
            jwk = keys.get(&header.kid);
        }
        let jwk = jwk.ok_or(JwtError::JwtBadSignature)?;

        let public_key: PublicKey = jwk.to_public_key().map_err(|_| JwtError::JwtBadSignature)?.into();

        let now = self.clock.now();
        let validator = PickyJwtValidator::strict(&JwtDate::new_with_leeway(
            now.unix_timestamp(),
            idp.clock_tolerance_sec as i64,
        ));

        let checked = JwtSig::<Value>::decode(raw_token, &public_key, &validator).map_err(|e| classify_picky_error(&e))?;
        let claims = checked.view_claims();

        if !audience_candidates(claims).iter().any(|audience| *audience == idp.audience.as_str()) {
            return Err(JwtError::JwtBadAudience);
        }

        if let Some(expected_azp) = &idp.azp {
            let azp = claims.get("azp").and_then(Value::as_str);
            if azp != Some(expected_azp.as_str()) {
                return Err(JwtError::JwtBadAudience);
            }
        }

        let issued_at = claims.get("iat").and_then(Value::as_i64).ok_or(JwtError::JwtMissingClaim("iat"))?;
        if now.unix_timestamp() - issued_at > idp.max_token_age_sec as i64 {
            return Err(JwtError::JwtExpired);
        }
        if idp.require_nbf && claims.get("nbf").is_none() {
            return Err(JwtError::JwtMissingClaim("nbf"));
        }

        let expires_at_ts = claims.get("exp").and_then(Value::as_i64).ok_or(JwtError::JwtMissingClaim("exp"))?;
        let expires_at = time::OffsetDateTime::from_unix_timestamp(expires_at_ts).map_err(|_| JwtError::JwtInvalidFormat)?;

        let user_id = idp
            .claim_map
            .user_id
            .resolve_str(claims)
            .ok_or(JwtError::JwtMissingClaim("user_id"))?
            .to_owned();
        let username = idp
            .claim_map
            .username
            .resolve_str(claims)
            .ok_or(JwtError::JwtMissingClaim("username"))?
            .to_owned();
        let legacy_username = idp.claim_map.legacy_username.as_ref().and_then(|p| p.resolve_str(claims)).map(str::to_owned);
        let roles = idp.claim_map.roles.as_ref().map(|p| p.resolve_str_set(claims)).unwrap_or_default();
        let scopes = idp.claim_map.scopes.as_ref().map(|p| p.resolve_str_set(claims)).unwrap_or_default();

        Ok(ValidatedToken {
            idp_name: idp.name.clone(),
            issuer: issuer.to_owned(),
            audience: audience.to_owned(),
            user_id,
            username,
            legacy_username,
            roles,
            scopes,
            expires_at,
            raw_claims: claims.clone(),
            raw: raw_token.to_owned(),
        })
    }
}

fn classify_picky_error(error: &picky::jose::jwt::JwtError) -> JwtError {
    use picky::jose::jwt::JwtError as PickyErr;
    match error {
        PickyErr::Expired { .. } => JwtError::JwtExpired,
        PickyErr::NotYetValid { .. } => JwtError::JwtNotYetValid,
        PickyErr::InvalidSignature { .. } => JwtError::JwtBadSignature,
        _ => JwtError::JwtInvalidFormat,
    }
}

struct UnverifiedHeader {
    alg: String,
    kid: String,
}

fn decode_header_unverified(raw_token: &str) -> Result<UnverifiedHeader, JwtError> {
    let header_segment = raw_token.split('.').next().ok_or(JwtError::JwtInvalidFormat)?;
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, header_segment)
        .map_err(|_| JwtError::JwtInvalidFormat)?;
    let header: Value = serde_json::from_slice(&bytes).map_err(|_| JwtError::JwtInvalidFormat)?;

    let alg = header.get("alg").and_then(Value::as_str).ok_or(JwtError::JwtInvalidFormat)?.to_owned();
    let kid = header.get("kid").and_then(Value::as_str).ok_or(JwtError::JwtInvalidFormat)?.to_owned();

    Ok(UnverifiedHeader { alg, kid })
}

/// Decodes the payload of any JWT without verifying its signature. Used
/// only for the gateway's own previously-validated tokens (the requestor
/// JWT's issuer/audience, to pick the right [`TrustedIdp`] before the
/// signature is checked) or for delegation tokens the gateway itself just
/// received over TLS from its own configured token endpoint.
pub(crate) fn decode_claims_unverified(raw_token: &str) -> Result<Value, JwtError> {
    let mut segments = raw_token.split('.');
    let _header = segments.next().ok_or(JwtError::JwtInvalidFormat)?;
    let payload_segment = segments.next().ok_or(JwtError::JwtInvalidFormat)?;
    if segments.next().is_none() {
        return Err(JwtError::JwtInvalidFormat);
    }

    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload_segment)
        .map_err(|_| JwtError::JwtInvalidFormat)?;
    serde_json::from_slice(&bytes).map_err(|_| JwtError::JwtInvalidFormat)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::claim_path::ClaimPath;
    use crate::config::ClaimMapFile;

    fn b64(segment: &serde_json::Value) -> String {
        base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, serde_json::to_vec(segment).unwrap())
    }

    fn compact(header: &serde_json::Value, payload: &serde_json::Value) -> String {
        format!("{}.{}.{}", b64(header), b64(payload), "unverified-signature")
    }

    #[test]
    fn decode_claims_unverified_reads_payload_without_checking_signature() {
        let header = serde_json::json!({"alg": "RS256", "kid": "key-1"});
        let payload = serde_json::json!({"sub": "alice", "iss": "https://idp.example.com"});
        let token = compact(&header, &payload);

        let claims = decode_claims_unverified(&token).unwrap();
        assert_eq!(claims["sub"], "alice");
    }

    #[test]
    fn decode_claims_unverified_rejects_wrong_segment_count() {
        assert!(matches!(decode_claims_unverified("only.two"), Err(JwtError::JwtInvalidFormat)));
        assert!(matches!(decode_claims_unverified("a.b.c.d"), Err(JwtError::JwtInvalidFormat)));
    }

    #[test]
    fn decode_header_unverified_reads_alg_and_kid() {
        let header = serde_json::json!({"alg": "RS256", "kid": "key-1"});
        let payload = serde_json::json!({});
        let token = compact(&header, &payload);

        let header = decode_header_unverified(&token).unwrap();
        assert_eq!(header.alg, "RS256");
        assert_eq!(header.kid, "key-1");
    }

    #[test]
    fn decode_header_unverified_requires_alg_and_kid() {
        let missing_kid = compact(&serde_json::json!({"alg": "RS256"}), &serde_json::json!({}));
        assert!(matches!(decode_header_unverified(&missing_kid), Err(JwtError::JwtInvalidFormat)));
    }

    fn idp(name: &str, issuer: &str, audience: &str) -> TrustedIdp {
        TrustedIdp {
            name: name.to_owned(),
            issuer: url::Url::parse(issuer).unwrap(),
            audience: audience.to_owned(),
            discovery_url: None,
            jwks_uri: None,
            allowed_algorithms: ["RS256".to_owned()].into_iter().collect::<HashSet<_>>(),
            claim_map: ClaimMapFile {
                user_id: ClaimPath::parse("sub").unwrap(),
                username: ClaimPath::parse("preferred_username").unwrap(),
                legacy_username: None,
                roles: None,
                scopes: None,
            },
            azp: None,
            clock_tolerance_sec: 60,
            max_token_age_sec: 3600,
            require_nbf: false,
            jwks_refresh_sec: 3600,
        }
    }

    #[test]
    fn audience_candidates_reads_scalar_aud() {
        let claims = serde_json::json!({"aud": "gateway"});
        assert_eq!(audience_candidates(&claims), vec!["gateway"]);
    }

    #[test]
    fn audience_candidates_reads_array_aud() {
        let claims = serde_json::json!({"aud": ["other-api", "gateway"]});
        assert_eq!(audience_candidates(&claims), vec!["other-api", "gateway"]);
    }

    #[test]
    fn audience_candidates_empty_when_aud_missing_or_wrong_type() {
        assert!(audience_candidates(&serde_json::json!({})).is_empty());
        assert!(audience_candidates(&serde_json::json!({"aud": 5})).is_empty());
    }

    #[test]
    fn registry_finds_exact_issuer_audience_pair() {
        let registry = IdpRegistry::new(&[idp("primary", "https://idp.example.com/", "gateway")]);

        assert!(registry.find("https://idp.example.com/", "gateway").is_some());
        assert!(registry.find("https://idp.example.com/", "other-audience").is_none());
        assert!(registry.find("https://unknown.example.com/", "gateway").is_none());
    }

    #[test]
    fn registry_distinguishes_known_issuer_from_unknown_issuer() {
        let registry = IdpRegistry::new(&[idp("primary", "https://idp.example.com/", "gateway")]);

        assert!(registry.issuer_known("https://idp.example.com/"));
        assert!(!registry.issuer_known("https://unknown.example.com/"));
    }

    #[test]
    fn error_codes_are_stable_and_distinct() {
        let errors = [
            JwtError::JwtInvalidFormat,
            JwtError::JwtBadSignature,
            JwtError::JwtExpired,
            JwtError::JwtNotYetValid,
            JwtError::JwtBadAudience,
            JwtError::JwtBadIssuer,
            JwtError::JwtBadAlgorithm,
            JwtError::JwtMissingClaim("sub"),
            JwtError::UnknownIdp,
            JwtError::JwksUnavailable("down".to_owned()),
        ];

        let codes: HashSet<&'static str> = errors.iter().map(JwtError::code).collect();
        assert_eq!(codes.len(), errors.len(), "every JwtError variant must have a distinct code");
    }
}
