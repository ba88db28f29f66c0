//! Short-lived speech-service credentials.
//!
//! The chat server hands out cloud speech tokens on request. Tokens are
//! issued per purpose (recognition and synthesis use separate ones) and
//! cached here for slightly less than their lifetime.

use crate::config::ManagedConfig;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// A speech-service authorization token and the region it is valid for.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct SpeechCredential {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    pub region: String,
}

impl std::fmt::Debug for SpeechCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechCredential")
            .field("access_token", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialPurpose {
    Recognition,
    Synthesis,
}

impl CredentialPurpose {
    /// Prefix the server files this purpose's token under.
    #[must_use]
    pub fn cookie_prefix(self) -> &'static str {
        match self {
            Self::Recognition => "re-",
            Self::Synthesis => "sy-",
        }
    }
}

/// Issues speech credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`ChatError::Credential`] if no usable credential could be
    /// obtained.
    async fn credential(&self, purpose: CredentialPurpose) -> Result<SpeechCredential>;
}

/// [`CredentialSource`] backed by the chat server's token endpoint.
pub struct TokenClient {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
    ttl: Duration,
    cache: Mutex<HashMap<CredentialPurpose, (SpeechCredential, Instant)>>,
}

impl TokenClient {
    #[must_use]
    pub fn new(config: &ManagedConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.token_endpoint.clone(),
            api_token: config.api_token.clone(),
            ttl: config.token_ttl(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch(&self, purpose: CredentialPurpose) -> Result<SpeechCredential> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "set_cookie_prefix": purpose.cookie_prefix() }));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChatError::Credential(format!("token request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Credential(format!(
                "token endpoint returned {status}"
            )));
        }

        let credential: SpeechCredential = response
            .json()
            .await
            .map_err(|e| ChatError::Credential(format!("invalid token response: {e}")))?;
        if credential.access_token.is_empty() || credential.region.is_empty() {
            return Err(ChatError::Credential("token response was empty".into()));
        }
        Ok(credential)
    }
}

#[async_trait]
impl CredentialSource for TokenClient {
    async fn credential(&self, purpose: CredentialPurpose) -> Result<SpeechCredential> {
        let mut cache = self.cache.lock().await;
        if let Some((credential, issued)) = cache.get(&purpose)
            && issued.elapsed() < self.ttl
        {
            return Ok(credential.clone());
        }

        let credential = self.fetch(purpose).await?;
        debug!(?purpose, region = %credential.region, "speech credential issued");
        cache.insert(purpose, (credential.clone(), Instant::now()));
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, api_token: Option<&str>) -> ManagedConfig {
        ManagedConfig {
            token_endpoint: format!("{}/speech/token/", server.uri()),
            api_token: api_token.map(str::to_owned),
            ..ManagedConfig::default()
        }
    }

    #[tokio::test]
    async fn requests_token_with_purpose_prefix_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/speech/token/"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({"set_cookie_prefix": "sy-"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok", "region": "japaneast"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = TokenClient::new(&config(&server, Some("secret")));
        let credential = client.credential(CredentialPurpose::Synthesis).await.unwrap();
        assert_eq!(credential.access_token, "tok");
        assert_eq!(credential.region, "japaneast");
    }

    #[tokio::test]
    async fn credentials_are_cached_per_purpose() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"accessToken": "tok", "region": "japaneast"})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let client = TokenClient::new(&config(&server, None));
        client.credential(CredentialPurpose::Recognition).await.unwrap();
        client.credential(CredentialPurpose::Recognition).await.unwrap();
        client.credential(CredentialPurpose::Synthesis).await.unwrap();
    }

    #[tokio::test]
    async fn server_failure_is_a_credential_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(json!({"message": "Get Token failed"})),
            )
            .mount(&server)
            .await;

        let client = TokenClient::new(&config(&server, None));
        let err = client
            .credential(CredentialPurpose::Recognition)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Credential(_)));
        assert_eq!(err.user_message(), "Could not authorize the speech service");
    }

    #[tokio::test]
    async fn empty_token_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "", "region": "japaneast"})),
            )
            .mount(&server)
            .await;

        let client = TokenClient::new(&config(&server, None));
        assert!(client.credential(CredentialPurpose::Synthesis).await.is_err());
    }
}
