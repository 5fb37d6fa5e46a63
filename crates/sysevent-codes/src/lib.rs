use sysevent::{Entry, Severity};

// 1000-1099 **Service/Lifecycle**

/// Fired after the service finishes its startup sequence.
pub const SERVICE_STARTED: u32 = 1000;
/// Graceful stop received.
pub const SERVICE_STOPPING: u32 = 1001;
/// Failed to load or validate configuration.
pub const CONFIG_INVALID: u32 = 1010;
/// Configuration hot-reload applied successfully.
pub const CONFIG_RELOADED: u32 = 1011;
/// Top-level start failure (e.g. required IDP unreachable).
pub const START_FAILED: u32 = 1020;

pub fn service_started(version: impl ToString) -> Entry {
    Entry::new("Service started")
        .event_code(SERVICE_STARTED)
        .severity(Severity::Info)
        .field("version", version)
}

pub fn service_stopping(reason: impl ToString) -> Entry {
    Entry::new("Service stopping")
        .event_code(SERVICE_STOPPING)
        .severity(Severity::Info)
        .field("reason", reason)
}

pub fn config_invalid(error: impl std::fmt::Display) -> Entry {
    Entry::new("Configuration invalid")
        .event_code(CONFIG_INVALID)
        .severity(Severity::Critical)
        .field("error_chain", format!("{error:#}"))
}

pub fn config_reloaded() -> Entry {
    Entry::new("Configuration reloaded")
        .event_code(CONFIG_RELOADED)
        .severity(Severity::Info)
}

pub fn start_failed(error: impl std::fmt::Display, cause: impl ToString) -> Entry {
    Entry::new("Start failed")
        .event_code(START_FAILED)
        .severity(Severity::Critical)
        .field("cause", cause) // e.g. "idp_unreachable", "config", "bind"
        .field("error_chain", format!("{error:#}"))
}

// 2000-2099 **Authentication (JWT validation)**

pub const AUTHN_SUCCESS: u32 = 2000;
pub const AUTHN_FAILURE: u32 = 2001;

pub fn authn_success(issuer: impl ToString, audience: impl ToString, subject: impl ToString) -> Entry {
    Entry::new("JWT validated")
        .event_code(AUTHN_SUCCESS)
        .severity(Severity::Info)
        .field("issuer", issuer)
        .field("audience", audience)
        .field("sub", subject)
}

pub fn authn_failure(issuer: impl ToString, reason_code: impl ToString) -> Entry {
    Entry::new("JWT rejected")
        .event_code(AUTHN_FAILURE)
        .severity(Severity::Warning)
        .field("issuer", issuer)
        .field("reason_code", reason_code) // e.g. "JWT_BAD_SIGNATURE", "UNKNOWN_IDP"
}

// 3000-3099 **Session lifecycle**

pub const SESSION_CREATED: u32 = 3000;
pub const SESSION_DESTROYED: u32 = 3001;
pub const SESSION_EXPIRED: u32 = 3002;

pub fn session_created(session_id: impl ToString, user_id: impl ToString) -> Entry {
    Entry::new("Session created")
        .event_code(SESSION_CREATED)
        .severity(Severity::Info)
        .field("session_id", session_id)
        .field("user_id", user_id)
}

pub fn session_destroyed(session_id: impl ToString, reason: impl ToString) -> Entry {
    Entry::new("Session destroyed")
        .event_code(SESSION_DESTROYED)
        .severity(Severity::Info)
        .field("session_id", session_id)
        .field("reason", reason) // "explicit", "idle_timeout", "absolute_timeout"
}

pub fn session_expired(session_id: impl ToString, age_sec: u64) -> Entry {
    Entry::new("Session swept (expired)")
        .event_code(SESSION_EXPIRED)
        .severity(Severity::Info)
        .field("session_id", session_id)
        .field("age_sec", age_sec)
}

// 4000-4099 **Token exchange & cache**

pub const TOKEN_EXCHANGE_SUCCESS: u32 = 4000;
pub const TOKEN_EXCHANGE_FAILED: u32 = 4001;
pub const CACHE_EVICTED: u32 = 4010;

pub fn token_exchange_used(audience: impl ToString, cache_hit: bool) -> Entry {
    Entry::new("Token exchange used")
        .event_code(TOKEN_EXCHANGE_SUCCESS)
        .severity(Severity::Info)
        .field("audience", audience)
        .field("cache_hit", cache_hit)
}

pub fn token_exchange_failed(audience: impl ToString, reason_code: impl ToString) -> Entry {
    Entry::new("Token exchange failed")
        .event_code(TOKEN_EXCHANGE_FAILED)
        .severity(Severity::Error)
        .field("audience", audience)
        .field("reason_code", reason_code)
}

pub fn cache_evicted(session_id: impl ToString, reason: impl ToString) -> Entry {
    Entry::new("Cache entry evicted")
        .event_code(CACHE_EVICTED)
        .severity(Severity::Debug)
        .field("session_id", session_id)
        .field("reason", reason) // "lru_session", "lru_global", "ttl_expired"
}

// 5000-5099 **Delegation (generic)**

pub const DELEGATION_CALL: u32 = 5000;
pub const MODULE_NOT_FOUND: u32 = 5001;
pub const MODULE_UNAVAILABLE: u32 = 5002;

pub fn delegation_call(module_name: impl ToString, success: bool) -> Entry {
    Entry::new("Delegation call completed")
        .event_code(DELEGATION_CALL)
        .severity(Severity::Info)
        .field("module_name", module_name)
        .field("success", success)
}

pub fn module_not_found(module_name: impl ToString) -> Entry {
    Entry::new("Delegation module not found")
        .event_code(MODULE_NOT_FOUND)
        .severity(Severity::Warning)
        .field("module_name", module_name)
}

pub fn module_unavailable(module_name: impl ToString, detail: impl ToString) -> Entry {
    Entry::new("Delegation module unavailable")
        .event_code(MODULE_UNAVAILABLE)
        .severity(Severity::Error)
        .field("module_name", module_name)
        .field("detail", detail)
}

// 5100-5199 **Relational delegation module**

pub const SQL_AUTHORIZED: u32 = 5100;
pub const SQL_DENIED: u32 = 5101;
pub const ROLE_RESET_FAILED: u32 = 5110;

pub fn sql_authorized(module_name: impl ToString, command_kind: impl ToString) -> Entry {
    Entry::new("SQL command authorized")
        .event_code(SQL_AUTHORIZED)
        .severity(Severity::Info)
        .field("module_name", module_name)
        .field("command_kind", command_kind)
}

pub fn sql_denied(module_name: impl ToString, command_kind: impl ToString) -> Entry {
    Entry::new("SQL command denied")
        .event_code(SQL_DENIED)
        .severity(Severity::Warning)
        .field("module_name", module_name)
        .field("command_kind", command_kind)
}

pub fn role_reset_failed(module_name: impl ToString, error: impl std::fmt::Display) -> Entry {
    Entry::new("RESET ROLE failed")
        .event_code(ROLE_RESET_FAILED)
        .severity(Severity::Critical)
        .field("module_name", module_name)
        .field("error_chain", format!("{error:#}"))
}

// 5200-5299 **Kerberos delegation module**

pub const KERBEROS_TGT_ACQUIRED: u32 = 5200;
pub const KERBEROS_TARGET_DENIED: u32 = 5201;
pub const KERBEROS_CLOCK_SKEW: u32 = 5202;
pub const KDC_UNREACHABLE: u32 = 5203;

pub fn kerberos_tgt_acquired(principal: impl ToString) -> Entry {
    Entry::new("Kerberos TGT acquired")
        .event_code(KERBEROS_TGT_ACQUIRED)
        .severity(Severity::Info)
        .field("principal", principal)
}

pub fn kerberos_target_denied(target_spn: impl ToString) -> Entry {
    Entry::new("Kerberos delegation target denied")
        .event_code(KERBEROS_TARGET_DENIED)
        .severity(Severity::Warning)
        .field("target_spn", target_spn)
}

pub fn kerberos_clock_skew(skew_sec: i64) -> Entry {
    Entry::new("Kerberos clock skew exceeded")
        .event_code(KERBEROS_CLOCK_SKEW)
        .severity(Severity::Error)
        .field("skew_sec", skew_sec)
}

pub fn kdc_unreachable(error: impl std::fmt::Display) -> Entry {
    Entry::new("KDC unreachable")
        .event_code(KDC_UNREACHABLE)
        .severity(Severity::Error)
        .field("error_chain", format!("{error:#}"))
}
