//! Service account credentials
//!
//! Mints self-signed JWT access tokens from a service account key, so no token
//! exchange round-trip is needed before talking to the control-plane.

use super::{AccessToken, AuthError, TokenSource};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Lifetime of a minted token
const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Service account key as downloaded from the cloud console
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Always `service_account`
    #[serde(rename = "type")]
    pub key_type: String,
    /// Project the account belongs to
    #[serde(default)]
    pub project_id: Option<String>,
    /// Key ID, placed in the JWT header
    #[serde(default)]
    pub private_key_id: Option<String>,
    /// PEM-encoded RSA private key
    pub private_key: String,
    /// Account email, the JWT issuer and subject
    pub client_email: String,
    /// OAuth token endpoint
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    /// Parse a key from its JSON representation
    pub fn from_json(json: &[u8]) -> Result<Self, AuthError> {
        let key: ServiceAccountKey = serde_json::from_slice(json)
            .map_err(|e| AuthError::InvalidCredentials(format!("malformed key JSON: {}", e)))?;
        if key.key_type != "service_account" {
            return Err(AuthError::InvalidCredentials(format!(
                "unsupported credentials type '{}': expected service_account",
                key.key_type
            )));
        }
        if key.client_email.is_empty() {
            return Err(AuthError::InvalidCredentials(
                "client_email must not be empty".into(),
            ));
        }
        Ok(key)
    }

    /// Read and parse a key file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            AuthError::InvalidCredentials(format!(
                "failed to read credentials file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&data)
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"<redacted>")
            .field("client_email", &self.client_email)
            .finish()
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    scope: String,
    iat: u64,
    exp: u64,
}

/// Token source minting self-signed JWTs for a service account
#[derive(Debug, Clone)]
pub struct ServiceAccountTokenSource {
    key: ServiceAccountKey,
    scopes: Vec<String>,
}

impl ServiceAccountTokenSource {
    /// Create a token source for `key` limited to `scopes`
    pub fn new<I, S>(key: ServiceAccountKey, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key,
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }

    /// Scopes requested in every token
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    fn mint(&self, now: SystemTime) -> Result<AccessToken, AuthError> {
        let iat = now
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AuthError::Signing(format!("clock before epoch: {}", e)))?
            .as_secs();
        let exp = iat + TOKEN_LIFETIME.as_secs();

        let claims = Claims {
            iss: &self.key.client_email,
            sub: &self.key.client_email,
            scope: self.scopes.join(" "),
            iat,
            exp,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();

        // Parsing is deferred to here so a dialer can be built before the key is used
        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| AuthError::InvalidCredentials(format!("invalid private key: {}", e)))?;
        let jwt = jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        Ok(AccessToken::with_expiry(
            jwt,
            UNIX_EPOCH + Duration::from_secs(exp),
        ))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn token(&self) -> Result<AccessToken, AuthError> {
        self.mint(SystemTime::now())
    }
}
