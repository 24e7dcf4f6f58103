//! Connect credentials for the live endpoint
//!
//! A fresh credential is fetched before every connection attempt, including
//! resumptions. Short-lived tokens come from an issuance endpoint; a static
//! API key is supported for local use.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::CredentialSource;
use crate::{Error, Result};

/// How the credential authenticates against the live endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Short-lived token passed as `access_token`
    Ephemeral,
    /// Long-lived key passed as `key`
    ApiKey,
}

/// A credential for one connection attempt
#[derive(Clone)]
pub struct Credential {
    token: SecretString,
    kind: CredentialKind,
    /// Expiry reported by the issuer, if any
    pub expire_time: Option<String>,
}

impl Credential {
    #[must_use]
    pub fn new(token: impl Into<String>, kind: CredentialKind) -> Self {
        Self {
            token: SecretString::from(token.into()),
            kind,
            expire_time: None,
        }
    }

    /// The raw token
    #[must_use]
    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    #[must_use]
    pub const fn kind(&self) -> CredentialKind {
        self.kind
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("expire_time", &self.expire_time)
            .finish_non_exhaustive()
    }
}

/// Source of connect credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Obtain a credential for a new connection attempt
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credential`] if no credential can be obtained
    async fn fetch(&self) -> Result<Credential>;
}

/// Response from the token issuance endpoint
#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expire_time: Option<String>,
}

/// Upper bound on one credential request
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches short-lived tokens from an HTTP issuance endpoint
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpCredentialProvider {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn fetch(&self) -> Result<Credential> {
        tracing::debug!(url = %self.url, "requesting ephemeral token");

        let response = self
            .client
            .post(&self.url)
            .send()
            .await
            .map_err(|e| Error::Credential(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "token endpoint error");
            return Err(Error::Credential(format!(
                "token endpoint returned {status}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Credential(format!("invalid token response: {e}")))?;

        let token = parsed
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Credential("token response missing token".to_string()))?;

        let mut credential = Credential::new(token, CredentialKind::Ephemeral);
        credential.expire_time = parsed.expire_time;
        Ok(credential)
    }
}

/// Static API key
pub struct ApiKeyCredentials {
    key: SecretString,
}

impl ApiKeyCredentials {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: SecretString::from(key.into()),
        }
    }
}

#[async_trait]
impl CredentialProvider for ApiKeyCredentials {
    async fn fetch(&self) -> Result<Credential> {
        Ok(Credential::new(
            self.key.expose_secret(),
            CredentialKind::ApiKey,
        ))
    }
}

/// Build the provider for a configured credential source
///
/// # Errors
///
/// Returns error if no credential source is configured
pub fn from_source(source: &CredentialSource) -> Result<Box<dyn CredentialProvider>> {
    match source {
        CredentialSource::Endpoint(url) => Ok(Box::new(HttpCredentialProvider::new(url.clone()))),
        CredentialSource::ApiKey(key) => Ok(Box::new(ApiKeyCredentials::new(key.clone()))),
        CredentialSource::Missing => Err(Error::Config(
            "no credentials configured; set LIVE_CREDENTIAL_URL or GEMINI_API_KEY".to_string(),
        )),
    }
}
