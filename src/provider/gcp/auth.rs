//! OAuth2 access tokens for the Google Cloud APIs
//!
//! A service account key signs an RS256 assertion which is exchanged at the
//! key's token endpoint for a short-lived bearer token. Tokens are cached
//! until shortly before they expire.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Scopes requested for every token
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/iam",
];

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Assertion lifetime accepted by the token endpoint (1 hour)
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Refresh tokens this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Service account key file contents
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Project the key belongs to
    #[serde(default)]
    pub project_id: Option<String>,
    /// Key id, sent as the assertion `kid`
    #[serde(default)]
    pub private_key_id: Option<String>,
    /// PEM-encoded RSA private key
    pub private_key: String,
    /// Service account email, the assertion issuer
    pub client_email: String,
    /// OAuth2 token endpoint
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"[REDACTED]")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccountKey {
    /// Parse a key from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::credentials(format!("invalid service account key: {}", e)))
    }

    /// Read and parse a key file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::credentials(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }
}

/// Source of bearer tokens for API requests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A currently valid access token
    async fn access_token(&self) -> Result<String>;
}

/// Fixed token, for callers that obtained one elsewhere
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    /// Wrap an existing token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// Exchanges signed service account assertions for access tokens
pub struct ServiceAccountTokenSource {
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    client: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
}

/// Throttling and server-side failures may clear up; anything else means the
/// key or the assertion was rejected.
fn classify_token_failure(status: StatusCode, body: &str) -> Error {
    let message = format!("token endpoint returned HTTP {}: {}", status, body);
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Error::token_unavailable(message)
        }
        s if s.is_server_error() => Error::token_unavailable(message),
        _ => Error::credentials(message),
    }
}

impl ServiceAccountTokenSource {
    /// Create a token source. Fails if the private key is not a valid RSA key.
    pub fn new(key: ServiceAccountKey, client: reqwest::Client) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| Error::credentials(format!("invalid private key: {}", e)))?;
        Ok(Self {
            key,
            signing_key,
            client,
            cached: RwLock::new(None),
        })
    }

    fn assertion(&self) -> Result<String> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: SCOPES.join(" "),
            aud: &self.key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();

        jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .map_err(|e| Error::credentials(format!("failed to sign assertion: {}", e)))
    }

    async fn fetch(&self) -> Result<CachedToken> {
        debug!(
            client_email = %self.key.client_email,
            token_uri = %self.key.token_uri,
            "Exchanging service account assertion"
        );

        let assertion = self.assertion()?;
        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout("token exchange")
                } else {
                    Error::token_unavailable(format!("token request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_token_failure(status, body.trim()));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::credentials(format!("invalid token response: {}", e)))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        info!(
            client_email = %self.key.client_email,
            expires_in_secs = lifetime.as_secs(),
            "Obtained access token"
        );

        Ok(CachedToken {
            token: token.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn access_token(&self) -> Result<String> {
        {
            let cached = self.cached.read();
            if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
                return Ok(token.token.clone());
            }
        }

        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *self.cached.write() = Some(fresh);
        Ok(token)
    }
}
