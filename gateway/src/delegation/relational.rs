//! Role-switching relational delegation module.
//!
//! One pooled connection per call. The delegation token tells us which
//! native role to assume; `SET ROLE` / `RESET ROLE` bracket the statement,
//! with `RESET ROLE` guaranteed on every exit path — success, permission
//! denial, or backend error — rather than relying on an async `Drop`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Column as _, PgPool, Row as _, TypeInfo as _};
use tokio_util::sync::CancellationToken;

use crate::audit::AuditSink;
use crate::delegation::{CallSpec, DelegationError, DelegationModule, DelegationResult, HealthState};
use crate::jwt::decode_claims_unverified;
use crate::session::{SessionInfo, SessionMessageSender};
use crate::token_exchange::{TokenExchangeCache, TokenExchangeClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SqlKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Truncate,
    Other,
}

impl SqlKind {
    fn as_str(self) -> &'static str {
        match self {
            SqlKind::Select => "SELECT",
            SqlKind::Insert => "INSERT",
            SqlKind::Update => "UPDATE",
            SqlKind::Delete => "DELETE",
            SqlKind::Create => "CREATE",
            SqlKind::Drop => "DROP",
            SqlKind::Truncate => "TRUNCATE",
            SqlKind::Other => "OTHER",
        }
    }

    /// Any-of role set authorized to execute this kind.
    fn required_roles(self) -> &'static [&'static str] {
        match self {
            SqlKind::Select => &["sql-read", "sql-write", "sql-admin", "admin"],
            SqlKind::Insert | SqlKind::Update | SqlKind::Delete => &["sql-write", "sql-admin", "admin"],
            SqlKind::Create => &["sql-admin", "admin"],
            SqlKind::Drop | SqlKind::Truncate => &["admin"],
            SqlKind::Other => &["admin"],
        }
    }
}

/// Classifies by the first non-comment keyword. `WITH ... SELECT` and `DO`
/// blocks are intentionally conservative and fall into `Other`, per the
/// first-keyword rule — a later refinement could special-case `WITH` by
/// peeking past the CTE list, but that is backend-parser territory this
/// module deliberately avoids.
fn classify_sql(statement: &str) -> SqlKind {
    let mut s = statement.trim_start();
    loop {
        if let Some(rest) = s.strip_prefix("--") {
            s = rest.split_once('\n').map_or("", |(_, after)| after).trim_start();
            continue;
        }
        if let Some(rest) = s.strip_prefix("/*") {
            s = rest.split_once("*/").map_or("", |(_, after)| after).trim_start();
            continue;
        }
        break;
    }

    let first_word: String = s
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    match first_word.as_str() {
        "SELECT" => SqlKind::Select,
        "INSERT" => SqlKind::Insert,
        "UPDATE" => SqlKind::Update,
        "DELETE" => SqlKind::Delete,
        "CREATE" => SqlKind::Create,
        "DROP" => SqlKind::Drop,
        "TRUNCATE" => SqlKind::Truncate,
        _ => SqlKind::Other,
    }
}

fn pg_value_to_json(row: &PgRow, idx: usize) -> Value {
    let column = row.column(idx);
    let type_name = column.type_info().name();

    match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx).ok().flatten().map_or(Value::Null, Value::from),
        "INT2" => row.try_get::<Option<i16>, _>(idx).ok().flatten().map_or(Value::Null, Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(idx).ok().flatten().map_or(Value::Null, Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(idx).ok().flatten().map_or(Value::Null, Value::from),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx).ok().flatten().map_or(Value::Null, |v| Value::from(v as f64)),
        "FLOAT8" | "NUMERIC" => row.try_get::<Option<f64>, _>(idx).ok().flatten().map_or(Value::Null, Value::from),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(idx).ok().flatten().unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::String(v.to_string())),
        "TIMESTAMPTZ" | "TIMESTAMP" => row
            .try_get::<Option<time::OffsetDateTime>, _>(idx)
            .ok()
            .flatten()
            .and_then(|v| v.format(&time::format_description::well_known::Rfc3339).ok())
            .map_or(Value::Null, Value::String),
        _ => row.try_get::<Option<String>, _>(idx).ok().flatten().map_or(Value::Null, Value::String),
    }
}

fn pg_row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_owned(), pg_value_to_json(row, idx));
    }
    Value::Object(object)
}

fn bind_param(
    query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &Value,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.clone()),
    }
}

/// Quotes a Postgres identifier, doubling embedded quotes. `legacyUsername`
/// never reaches the query string unescaped.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub struct RelationalModule {
    name: String,
    audience: String,
    pool: PgPool,
    legacy_username_claim: String,
    roles_claim: String,
    default_schema: String,
    token_exchange_client: Arc<dyn TokenExchangeClient>,
    token_cache: Arc<TokenExchangeCache>,
    sessions: SessionMessageSender,
    audit: Arc<dyn AuditSink>,
}

impl RelationalModule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        audience: String,
        pool: PgPool,
        legacy_username_claim: String,
        roles_claim: String,
        default_schema: String,
        token_exchange_client: Arc<dyn TokenExchangeClient>,
        token_cache: Arc<TokenExchangeCache>,
        sessions: SessionMessageSender,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            name,
            audience,
            pool,
            legacy_username_claim,
            roles_claim,
            default_schema,
            token_exchange_client,
            token_cache,
            sessions,
            audit,
        }
    }

    async fn delegation_identity(
        &self,
        session: &SessionInfo,
        requestor_jwt: &str,
        cancellation: &CancellationToken,
    ) -> Result<(String, HashSet<String>), DelegationError> {
        let session_key = self
            .sessions
            .get_key(session.id)
            .await
            .map_err(|e| DelegationError::BackendFailed(e.to_string()))?
            .ok_or(DelegationError::Unavailable)?;

        // Races the token-exchange HTTP round trip against the per-request
        // cancellation; a plain `.await` here would keep polling the exchange
        // long after a caller has stopped waiting for it.
        let delegation_token = tokio::select! {
            biased;
            () = cancellation.cancelled() => return Err(DelegationError::BackendFailed("dispatch cancelled".to_owned())),
            result = self.token_cache.get_or_exchange(session.id, &session_key, &self.audience, requestor_jwt, self.token_exchange_client.clone()) => {
                result.map_err(|e| DelegationError::BackendFailed(e.to_string()))?
            }
        };

        let claims = decode_claims_unverified(&delegation_token).map_err(|_| DelegationError::BackendFailed("malformed delegation token".to_owned()))?;

        let legacy_username = claims
            .get(&self.legacy_username_claim)
            .and_then(Value::as_str)
            .ok_or(DelegationError::MissingClaim("legacyUsername"))?
            .to_owned();

        let roles: HashSet<String> = claims
            .get(&self.roles_claim)
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default();

        Ok((legacy_username, roles))
    }

    async fn run_with_role<T, F>(&self, legacy_username: &str, cancellation: &CancellationToken, call: F) -> Result<T, DelegationError>
    where
        F: for<'c> FnOnce(
            &'c mut sqlx::PgConnection,
        ) -> futures::future::BoxFuture<'c, Result<T, DelegationError>>,
    {
        let mut conn = self.pool.acquire().await.map_err(|e| DelegationError::BackendFailed(e.to_string()))?;

        let set_role = format!("SET ROLE {}", quote_ident(legacy_username));
        sqlx::query(&set_role)
            .execute(&mut *conn)
            .await
            .map_err(|e| DelegationError::BackendFailed(e.to_string()))?;

        // Cancellation is observed here, inside the function that owns the
        // connection, rather than by some caller dropping this whole future
        // from the outside — that's what lets RESET ROLE still run below even
        // when the query itself is abandoned mid-flight.
        let result = tokio::select! {
            biased;
            result = call(&mut conn) => result,
            () = cancellation.cancelled() => Err(DelegationError::BackendFailed("dispatch cancelled".to_owned())),
        };

        // RESET ROLE unconditionally, on every exit path, before the
        // connection returns to the pool — regardless of `result`.
        if let Err(error) = sqlx::query("RESET ROLE").execute(&mut *conn).await {
            error!(error = %error, "failed to RESET ROLE on a leased connection");
            self.audit.emit(sysevent_codes::role_reset_failed(self.name.clone(), error)).await;
        }

        result
    }
}

#[async_trait]
impl DelegationModule for RelationalModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), DelegationError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| DelegationError::BackendFailed(e.to_string()))
    }

    async fn health(&self) -> HealthState {
        if sqlx::query("SELECT 1").execute(&self.pool).await.is_ok() {
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
        let (legacy_username, roles) = self.delegation_identity(session, requestor_jwt, cancellation).await?;

        match call {
            CallSpec::Sql { statement, params } => {
                let kind = classify_sql(&statement);
                if !kind.required_roles().iter().any(|role| roles.contains(*role)) {
                    self.audit.emit(sysevent_codes::sql_denied(self.name.clone(), kind.as_str())).await;
                    return Err(DelegationError::InsufficientPermissions(kind.as_str()));
                }
                self.audit.emit(sysevent_codes::sql_authorized(self.name.clone(), kind.as_str())).await;

                self.run_with_role(&legacy_username, cancellation, move |conn| {
                    Box::pin(async move {
                        let mut query = sqlx::query(&statement);
                        for param in &params {
                            query = bind_param(query, param);
                        }

                        if kind == SqlKind::Select {
                            let rows = query.fetch_all(conn).await.map_err(|e| DelegationError::BackendFailed(e.to_string()))?;
                            let values = rows.iter().map(pg_row_to_json).collect();
                            Ok(DelegationResult::Rows(values))
                        } else {
                            let result = query.execute(conn).await.map_err(|e| DelegationError::BackendFailed(e.to_string()))?;
                            let verb = match kind {
                                SqlKind::Insert => "inserted",
                                SqlKind::Update => "updated",
                                SqlKind::Delete => "deleted",
                                _ => "executed",
                            };
                            Ok(DelegationResult::Command {
                                success: true,
                                row_count: result.rows_affected(),
                                command: kind.as_str(),
                                message: format!("Successfully {verb} {} row(s)", result.rows_affected()),
                            })
                        }
                    })
                })
                .await
            }
            CallSpec::SchemaIntrospection { schema } => {
                if !SqlKind::Select.required_roles().iter().any(|role| roles.contains(*role)) {
                    self.audit.emit(sysevent_codes::sql_denied(self.name.clone(), "SCHEMA_INTROSPECTION")).await;
                    return Err(DelegationError::InsufficientPermissions("SELECT"));
                }
                self.audit.emit(sysevent_codes::sql_authorized(self.name.clone(), "SCHEMA_INTROSPECTION")).await;
                let schema = schema.unwrap_or_else(|| self.default_schema.clone());

                self.run_with_role(&legacy_username, cancellation, move |conn| {
                    Box::pin(async move {
                        let rows = sqlx::query(
                            "SELECT table_name, column_name, data_type FROM information_schema.columns WHERE table_schema = $1 ORDER BY table_name, ordinal_position",
                        )
                        .bind(schema)
                        .fetch_all(conn)
                        .await
                        .map_err(|e| DelegationError::BackendFailed(e.to_string()))?;

                        Ok(DelegationResult::Rows(rows.iter().map(pg_row_to_json).collect()))
                    })
                })
                .await
            }
            CallSpec::KerberosTicket { .. } => Err(DelegationError::BackendFailed(
                "relational module cannot service a Kerberos ticket request".to_owned(),
            )),
        }
    }

    async fn shutdown(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_sql_picks_first_keyword() {
        assert_eq!(classify_sql("select 1"), SqlKind::Select);
        assert_eq!(classify_sql("  \n\tINSERT INTO t VALUES (1)"), SqlKind::Insert);
        assert_eq!(classify_sql("UPDATE t SET a = 1"), SqlKind::Update);
        assert_eq!(classify_sql("delete from t"), SqlKind::Delete);
        assert_eq!(classify_sql("CREATE TABLE t (a int)"), SqlKind::Create);
        assert_eq!(classify_sql("drop table t"), SqlKind::Drop);
        assert_eq!(classify_sql("truncate t"), SqlKind::Truncate);
    }

    #[test]
    fn classify_sql_skips_leading_comments() {
        assert_eq!(classify_sql("-- a comment\nselect 1"), SqlKind::Select);
        assert_eq!(classify_sql("/* block */ delete from t"), SqlKind::Delete);
    }

    #[test]
    fn classify_sql_with_and_do_fall_to_other() {
        // Deliberately conservative: a `WITH` CTE or a `DO` block could
        // ultimately run anything, so neither gets the benefit of a narrower
        // read-only classification.
        assert_eq!(classify_sql("WITH x AS (SELECT 1) SELECT * FROM x"), SqlKind::Other);
        assert_eq!(classify_sql("DO $$ BEGIN DELETE FROM t; END $$"), SqlKind::Other);
    }

    #[test]
    fn classify_sql_unknown_statement_requires_admin() {
        assert_eq!(classify_sql("vacuum t"), SqlKind::Other);
        assert_eq!(SqlKind::Other.required_roles(), &["admin"]);
    }

    #[test]
    fn required_roles_are_monotonically_widening() {
        // Every role that can SELECT can also do so under write/admin
        // authorization; the allow-lists below should only ever grow as the
        // statement kind gets more destructive.
        assert!(SqlKind::Select.required_roles().contains(&"sql-read"));
        assert!(!SqlKind::Insert.required_roles().contains(&"sql-read"));
        assert!(SqlKind::Insert.required_roles().contains(&"sql-write"));
        assert!(SqlKind::Drop.required_roles() == &["admin"]);
    }

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident(r#"weird"name"#), "\"weird\"\"name\"");
    }
}
