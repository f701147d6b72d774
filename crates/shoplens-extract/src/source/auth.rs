//! Google OAuth bearer tokens
//!
//! Either a pre-minted access token is used as-is, or a service account key
//! is exchanged for one through the JWT bearer grant. Exchanged tokens are
//! cached until a minute before they expire.

use crate::config::CredentialsConfig;
use crate::error::{ExtractError, SourceError};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 60;

/// Fields of a service account JSON key the exchange needs
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_after: DateTime<Utc>,
}

enum Credentials {
    AccessToken(String),
    ServiceAccount {
        key: ServiceAccountKey,
        encoding_key: EncodingKey,
    },
}

/// Supplies bearer tokens for one OAuth scope
pub struct TokenProvider {
    credentials: Credentials,
    scope: String,
    client: Client,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    /// Build a provider from configuration.
    ///
    /// Reads and parses the key file eagerly so that bad credentials fail
    /// before any planning starts.
    pub fn from_config(
        config: &CredentialsConfig,
        scope: &str,
        client: Client,
    ) -> Result<Self, ExtractError> {
        config.validate().map_err(ExtractError::Setup)?;

        if let Some(token) = &config.access_token {
            return Ok(Self::static_token(token.clone()));
        }

        let path = config
            .service_account_key_path
            .as_ref()
            .ok_or_else(|| ExtractError::setup("No service account key configured"))?;
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ExtractError::setup(format!("Failed to read credentials {}: {}", path.display(), e))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&raw).map_err(|e| {
            ExtractError::setup(format!("Invalid service account key {}: {}", path.display(), e))
        })?;

        Self::service_account(key, scope, client)
    }

    pub fn static_token(token: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::AccessToken(token.into()),
            scope: String::new(),
            client: Client::new(),
            cache: Mutex::new(None),
        }
    }

    pub fn service_account(
        key: ServiceAccountKey,
        scope: &str,
        client: Client,
    ) -> Result<Self, ExtractError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| ExtractError::setup(format!("Invalid service account private key: {}", e)))?;

        Ok(Self {
            credentials: Credentials::ServiceAccount { key, encoding_key },
            scope: scope.to_string(),
            client,
            cache: Mutex::new(None),
        })
    }

    /// Current bearer token, exchanging a fresh one when needed
    pub async fn bearer(&self) -> Result<String, SourceError> {
        let (key, encoding_key) = match &self.credentials {
            Credentials::AccessToken(token) => return Ok(token.clone()),
            Credentials::ServiceAccount { key, encoding_key } => (key, encoding_key),
        };

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if Utc::now() < cached.refresh_after {
                return Ok(cached.token.clone());
            }
        }

        let fresh = self.exchange(key, encoding_key).await?;
        let token = fresh.token.clone();
        *cache = Some(fresh);
        Ok(token)
    }

    async fn exchange(
        &self,
        key: &ServiceAccountKey,
        encoding_key: &EncodingKey,
    ) -> Result<CachedToken, SourceError> {
        let now = Utc::now();
        let claims = Claims {
            iss: &key.client_email,
            scope: &self.scope,
            aud: &key.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + TOKEN_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = key.private_key_id.clone();

        let assertion = encode(&header, &claims, encoding_key)
            .map_err(|e| SourceError::Auth(format!("Failed to sign assertion: {}", e)))?;

        debug!(token_uri = %key.token_uri, "Exchanging service account assertion");

        let response = self
            .client
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Auth(format!("Token exchange returned {}: {}", status, body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Auth(format!("Malformed token response: {}", e)))?;

        let lifetime = token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS);
        Ok(CachedToken {
            token: token.access_token,
            refresh_after: now + Duration::seconds((lifetime - REFRESH_MARGIN_SECS).max(0)),
        })
    }
}
