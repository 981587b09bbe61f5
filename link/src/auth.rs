//! Credentials collaborator.
//!
//! The realtime client never stores a token across connect attempts: every
//! attempt asks the [`CredentialsProvider`] for a fresh one, and an
//! authentication failure triggers [`CredentialsProvider::refresh`] before
//! the next attempt.
//!
//! ```rust,no_run
//! use mercury_link::{CredentialsProvider, Result};
//!
//! struct OAuthStore { /* ... */ }
//!
//! #[async_trait::async_trait]
//! impl CredentialsProvider for OAuthStore {
//!     async fn get_access_token(&self) -> Result<String> {
//!         Ok("Bearer fresh-token".to_string())
//!     }
//!
//!     async fn refresh(&self) -> Result<()> {
//!         // exchange the refresh token here
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::{MercuryError, Result};

/// Supplies access tokens to the realtime client and the HTTP client.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Current access token, sent verbatim in the authorization frame.
    async fn get_access_token(&self) -> Result<String>;

    /// Obtain a new token after the server rejected the current one.
    async fn refresh(&self) -> Result<()>;
}

/// A fixed token. Refreshing is not possible.
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken").field("token", &"***").finish()
    }
}

#[async_trait]
impl CredentialsProvider for StaticToken {
    async fn get_access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<()> {
        Err(MercuryError::AuthenticationError(
            "static token cannot be refreshed".to_string(),
        ))
    }
}
