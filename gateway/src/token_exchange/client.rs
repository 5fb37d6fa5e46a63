//! RFC 8693 token-exchange client.
//!
//! One HTTP round trip to the configured token endpoint per (session,
//! audience, requestor-JWT) combination that isn't already cached. Retries
//! transient failures with backoff; never retries a 4xx (the IDP has made a
//! decision, retrying won't change it).

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;

use crate::config::{ClientAuthMethod, TokenExchangeDefaults};

#[derive(Debug, Clone)]
pub struct DelegationTokenResponse {
    pub access_token: String,
    pub expires_in_sec: Option<u64>,
    pub issued_token_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenExchangeClientError {
    #[error("request to the token endpoint failed: {0}")]
    Transport(String),
    #[error("token endpoint rejected the exchange: {status} {body}")]
    Rejected { status: u16, body: String },
    #[error("token endpoint response could not be parsed")]
    MalformedResponse,
}

#[async_trait]
pub trait TokenExchangeClient: Send + Sync {
    async fn exchange(
        &self,
        requestor_jwt: &str,
        audience: &str,
    ) -> Result<DelegationTokenResponse, TokenExchangeClientError>;
}

pub struct HttpTokenExchangeClient {
    http: reqwest::Client,
    defaults: TokenExchangeDefaults,
}

impl HttpTokenExchangeClient {
    pub fn new(http: reqwest::Client, defaults: TokenExchangeDefaults) -> Self {
        Self { http, defaults }
    }

    fn client_secret(&self) -> &SecretString {
        &self.defaults.client_secret
    }
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: Option<u64>,
    #[serde(default = "default_issued_token_type")]
    issued_token_type: String,
}

fn default_issued_token_type() -> String {
    "urn:ietf:params:oauth:token-type:access_token".to_owned()
}

#[async_trait]
impl TokenExchangeClient for HttpTokenExchangeClient {
    async fn exchange(
        &self,
        requestor_jwt: &str,
        audience: &str,
    ) -> Result<DelegationTokenResponse, TokenExchangeClientError> {
        let client_id = self.defaults.client_id.as_str();
        let client_secret = self.client_secret().expose_secret();

        let mut params = vec![
            ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
            ("subject_token", requestor_jwt),
            ("subject_token_type", "urn:ietf:params:oauth:token-type:access_token"),
            ("audience", audience),
            ("requested_token_type", "urn:ietf:params:oauth:token-type:access_token"),
        ];
        if matches!(self.defaults.auth_method, ClientAuthMethod::ClientSecretPost) {
            params.push(("client_id", client_id));
            params.push(("client_secret", client_secret));
        }

        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(Duration::from_secs(10)))
            .build();

        // `with_max_elapsed_time` alone bounds the retry loop's total
        // duration, not its count — it would happily retry several times
        // inside the window. Spec calls for exactly one retry, so the first
        // attempt (`attempt == 0`) is the only one allowed to come back as
        // `transient`; anything from the second attempt onward is reported
        // as-is, permanent, win or lose.
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let response = backoff::future::retry(backoff, || async {
            let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let retryable = attempt == 0;

            let mut request = self
                .http
                .post(self.defaults.token_endpoint.clone())
                .timeout(Duration::from_secs(self.defaults.request_timeout_sec))
                .form(&params);

            if let ClientAuthMethod::ClientSecretBasic = self.defaults.auth_method {
                request = request.basic_auth(&self.defaults.client_id, Some(client_secret));
            }

            let response = request.send().await.map_err(|e| {
                if retryable && (e.is_timeout() || e.is_connect()) {
                    backoff::Error::transient(TokenExchangeClientError::Transport(e.to_string()))
                } else {
                    backoff::Error::permanent(TokenExchangeClientError::Transport(e.to_string()))
                }
            })?;

            let status = response.status();
            if status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                let error = TokenExchangeClientError::Rejected { status: status.as_u16(), body };
                return Err(if retryable {
                    backoff::Error::transient(error)
                } else {
                    backoff::Error::permanent(error)
                });
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(TokenExchangeClientError::Rejected {
                    status: status.as_u16(),
                    body,
                }));
            }

            response
                .json::<TokenEndpointResponse>()
                .await
                .map_err(|_| backoff::Error::permanent(TokenExchangeClientError::MalformedResponse))
        })
        .await?;

        Ok(DelegationTokenResponse {
            access_token: response.access_token,
            expires_in_sec: response.expires_in,
            issued_token_type: response.issued_token_type,
        })
    }
}
