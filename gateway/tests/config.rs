#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]

use gateway::config::{Conf, ConfFile, ConfigError, SecretProvider, SecretResolver};
use rstest::*;

fn minimal_json(environment: &str, jwks_scheme: &str, token_endpoint_scheme: &str) -> String {
    format!(
        r#"{{
            "environment": "{environment}",
            "auth": {{
                "idps": [
                    {{
                        "name": "primary",
                        "issuer": "https://idp.example.com/realms/main",
                        "audience": "gateway",
                        "jwks_uri": "{jwks_scheme}://idp.example.com/realms/main/jwks",
                        "claim_map": {{
                            "user_id": "sub",
                            "username": "preferred_username"
                        }}
                    }}
                ]
            }},
            "delegation": {{
                "token_exchange": {{
                    "token_endpoint": "{token_endpoint_scheme}://idp.example.com/realms/main/token",
                    "client_id": "gateway",
                    "client_secret": {{"$secret": "TOKEN_EXCHANGE_CLIENT_SECRET"}}
                }}
            }}
        }}"#
    )
}

struct StaticSecretProvider(Option<&'static str>);

impl SecretProvider for StaticSecretProvider {
    fn try_resolve(&self, _name: &str) -> anyhow::Result<Option<String>> {
        Ok(self.0.map(str::to_owned))
    }
}

fn resolver_with(value: Option<&'static str>) -> SecretResolver {
    SecretResolver::new(vec![Box::new(StaticSecretProvider(value))])
}

#[rstest]
fn parses_minimal_document() {
    let json = minimal_json("production", "https", "https");
    let conf_file: ConfFile = serde_json::from_str(&json).unwrap();
    assert_eq!(conf_file.auth.idps.len(), 1);
    assert_eq!(conf_file.auth.idps[0].name, "primary");
}

#[rstest]
fn resolves_secret_from_provider() {
    let conf_file: ConfFile = serde_json::from_str(&minimal_json("production", "https", "https")).unwrap();
    let secrets = resolver_with(Some("s3cr3t"));

    let conf = Conf::from_conf_file(conf_file, &secrets).unwrap();

    assert_eq!(conf.idps.len(), 1);
    assert_eq!(conf.idps[0].name, "primary");
}

#[rstest]
fn missing_secret_is_unresolved_error() {
    let conf_file: ConfFile = serde_json::from_str(&minimal_json("production", "https", "https")).unwrap();
    let secrets = resolver_with(None);

    let error = Conf::from_conf_file(conf_file, &secrets).unwrap_err();

    assert!(matches!(error, ConfigError::UnresolvedSecret(_)));
}

#[rstest]
fn duplicate_issuer_audience_pair_is_rejected() {
    let json = r#"{
        "auth": {
            "idps": [
                {
                    "name": "primary",
                    "issuer": "https://idp.example.com/realms/main",
                    "audience": "gateway",
                    "jwks_uri": "https://idp.example.com/realms/main/jwks",
                    "claim_map": {"user_id": "sub", "username": "preferred_username"}
                },
                {
                    "name": "duplicate",
                    "issuer": "https://idp.example.com/realms/main",
                    "audience": "gateway",
                    "jwks_uri": "https://idp.example.com/realms/main/jwks",
                    "claim_map": {"user_id": "sub", "username": "preferred_username"}
                }
            ]
        },
        "delegation": {
            "token_exchange": {
                "token_endpoint": "https://idp.example.com/realms/main/token",
                "client_id": "gateway",
                "client_secret": {"$secret": "X"}
            }
        }
    }"#;

    let conf_file: ConfFile = serde_json::from_str(json).unwrap();
    let secrets = resolver_with(Some("s3cr3t"));

    let error = Conf::from_conf_file(conf_file, &secrets).unwrap_err();

    assert!(matches!(error, ConfigError::DuplicateIdp(_)));
}

#[rstest]
#[case::production_rejects_plaintext_jwks("production", "http", "https")]
#[case::production_rejects_plaintext_token_endpoint("production", "https", "http")]
fn production_requires_tls(#[case] environment: &str, #[case] jwks_scheme: &str, #[case] token_endpoint_scheme: &str) {
    let conf_file: ConfFile = serde_json::from_str(&minimal_json(environment, jwks_scheme, token_endpoint_scheme)).unwrap();
    let secrets = resolver_with(Some("s3cr3t"));

    let error = Conf::from_conf_file(conf_file, &secrets).unwrap_err();

    assert!(matches!(error, ConfigError::Invalid(_)));
}

#[rstest]
fn development_allows_plaintext_endpoints() {
    let conf_file: ConfFile = serde_json::from_str(&minimal_json("development", "http", "http")).unwrap();
    let secrets = resolver_with(Some("s3cr3t"));

    let conf = Conf::from_conf_file(conf_file, &secrets).unwrap();

    assert_eq!(conf.idps[0].jwks_uri.as_ref().unwrap().scheme(), "http");
}

#[rstest]
fn relational_module_defaults_are_applied() {
    let json = r#"{
        "auth": {
            "idps": [
                {
                    "name": "primary",
                    "issuer": "https://idp.example.com/realms/main",
                    "audience": "gateway",
                    "jwks_uri": "https://idp.example.com/realms/main/jwks",
                    "claim_map": {"user_id": "sub", "username": "preferred_username"}
                }
            ]
        },
        "delegation": {
            "token_exchange": {
                "token_endpoint": "https://idp.example.com/realms/main/token",
                "client_id": "gateway",
                "client_secret": {"$secret": "X"}
            },
            "modules": {
                "warehouse": {
                    "kind": "relational",
                    "audience": "warehouse-db",
                    "connection_string": {"$secret": "DB_URL"}
                }
            }
        }
    }"#;

    let conf_file: ConfFile = serde_json::from_str(json).unwrap();
    let secrets = resolver_with(Some("postgres://localhost/db"));

    let conf = Conf::from_conf_file(conf_file, &secrets).unwrap();

    match &conf.modules["warehouse"] {
        gateway::config::ModuleConfig::Relational {
            legacy_username_claim,
            roles_claim,
            default_schema,
            ..
        } => {
            assert_eq!(legacy_username_claim, "legacy_name");
            assert_eq!(roles_claim, "roles");
            assert_eq!(default_schema, "public");
        }
        _ => panic!("expected a relational module"),
    }
}

#[rstest]
fn literal_client_secret_needs_no_provider() {
    let json = r#"{
        "auth": {
            "idps": [
                {
                    "name": "primary",
                    "issuer": "https://idp.example.com/realms/main",
                    "audience": "gateway",
                    "jwks_uri": "https://idp.example.com/realms/main/jwks",
                    "claim_map": {"user_id": "sub", "username": "preferred_username"}
                }
            ]
        },
        "delegation": {
            "token_exchange": {
                "token_endpoint": "https://idp.example.com/realms/main/token",
                "client_id": "gateway",
                "client_secret": "inline-secret-value"
            }
        }
    }"#;

    let conf_file: ConfFile = serde_json::from_str(json).unwrap();
    let secrets = SecretResolver::new(Vec::new());

    let conf = Conf::from_conf_file(conf_file, &secrets).unwrap();
    assert_eq!(conf.token_exchange.client_id, "gateway");
}
