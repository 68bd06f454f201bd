//! Access tokens for control-plane calls
//!
//! The core never looks inside a token source; it only asks for a token at the
//! start of each refresh.

mod service_account;

pub use service_account::{ServiceAccountKey, ServiceAccountTokenSource};

use async_trait::async_trait;
use std::fmt;
use std::time::SystemTime;

/// Scope authorizing control-plane calls
pub const ADMIN_SCOPE: &str = "https://www.googleapis.com/auth/sqlservice.admin";
/// Scope authorizing IAM database logins
pub const LOGIN_SCOPE: &str = "https://www.googleapis.com/auth/sqlservice.login";

/// Failure to produce an access token
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// Credentials could not be parsed
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    /// Signing the token failed
    #[error("failed to sign token: {0}")]
    Signing(String),
    /// The token supplier failed
    #[error("token source failed: {0}")]
    Source(String),
}

/// Bearer credential
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Raw token value
    pub value: String,
    /// When the token stops being valid (None = unknown)
    pub expiry: Option<SystemTime>,
}

impl AccessToken {
    /// Create a token without a known expiry
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expiry: None,
        }
    }

    /// Create a token that expires at `expiry`
    pub fn with_expiry(value: impl Into<String>, expiry: SystemTime) -> Self {
        Self {
            value: value.into(),
            expiry: Some(expiry),
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Supplier of bearer credentials
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// Return a currently valid token
    async fn token(&self) -> Result<AccessToken, AuthError>;
}

/// Token source that always returns the same token
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: AccessToken,
}

impl StaticTokenSource {
    /// Wrap a raw token value
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            token: AccessToken::new(value),
        }
    }

    /// Wrap an existing token
    pub fn from_token(token: AccessToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<AccessToken, AuthError> {
        Ok(self.token.clone())
    }
}
