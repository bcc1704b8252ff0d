//! Service-account credentials and two-legged OAuth token source.
//!
//! The compute API is authenticated with a self-signed RS256 grant
//! exchanged for a bearer token. Tokens are cached per provider and
//! refreshed shortly before they expire.

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::error::{ConfigError, GceError};
use super::settings::read_ambient;

const TOKEN_URL: &str = "https://accounts.google.com/o/oauth2/token";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const SCOPES: &str = "https://www.googleapis.com/auth/devstorage.full_control \
                      https://www.googleapis.com/auth/compute";
const GRANT_LIFETIME: Duration = Duration::from_secs(3600);
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Credentials extracted from a service account JSON document.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct ServiceAccountKey {
    /// Email identity the grant is issued for.
    pub client_email: String,
    /// PEM-encoded RSA private key used to sign grants.
    pub private_key: String,
}

/// Loads account credentials from inline JSON or a file path.
///
/// A value whose first non-blank character is `{` is treated as the JSON
/// document itself; anything else is a path to one.
///
/// # Errors
///
/// Returns [`ConfigError::FileRead`] when the path cannot be read and
/// [`ConfigError::AccountJson`] when the document does not parse.
pub fn load_account_json(source: &str) -> Result<ServiceAccountKey, ConfigError> {
    let document = if source.trim_start().starts_with('{') {
        source.to_owned()
    } else {
        read_ambient(source)?
    };

    serde_json::from_str(&document).map_err(|err| ConfigError::AccountJson(err.to_string()))
}

#[derive(Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

fn grant_claims<'a>(email: &'a str, issued_at: u64) -> GrantClaims<'a> {
    GrantClaims {
        iss: email,
        scope: SCOPES,
        aud: TOKEN_URL,
        iat: issued_at,
        exp: issued_at + GRANT_LIFETIME.as_secs(),
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Issues and caches bearer tokens for one service account.
pub struct TokenSource {
    http: reqwest::Client,
    email: String,
    key: EncodingKey,
    cached: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSource")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl TokenSource {
    /// Builds a token source for `account` using the given HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AccountJson`] when the private key cannot be
    /// parsed for RS256 signing.
    pub fn new(account: &ServiceAccountKey, http: reqwest::Client) -> Result<Self, ConfigError> {
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|err| ConfigError::AccountJson(format!("private_key: {err}")))?;
        Ok(Self {
            http,
            email: account.client_email.clone(),
            key,
            cached: Mutex::new(None),
        })
    }

    /// Returns a bearer token, reusing the cached one while it is fresh.
    ///
    /// # Errors
    ///
    /// Returns [`GceError::Transport`] when the token exchange fails.
    pub async fn bearer(&self) -> Result<String, GceError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() + REFRESH_MARGIN < token.expires_at
        {
            return Ok(token.value.clone());
        }

        let token = self.exchange().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn exchange(&self) -> Result<CachedToken, GceError> {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| GceError::Transport(err.to_string()))?
            .as_secs();
        let claims = grant_claims(&self.email, issued_at);
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|err| GceError::Transport(format!("grant signing: {err}")))?;

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| GceError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| GceError::Transport(err.to_string()))?;

        Ok(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}
