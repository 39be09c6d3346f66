//! The identity-provider boundary.
//!
//! The refresh-token exchange with the OIDC provider happens outside this
//! crate. The service only sees the [`IdentityProvider`] trait; tests use a
//! scripted implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configured OIDC provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Issuer URL.
    pub issuer: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Scopes requested when neither the request nor a restriction names any.
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ProviderConfig {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            name: String::new(),
            scopes: Vec::new(),
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Check whether this provider has issuer `issuer`, ignoring a trailing
    /// slash.
    pub fn matches(&self, issuer: &str) -> bool {
        self.issuer.trim_end_matches('/') == issuer.trim_end_matches('/')
    }
}

/// Tokens returned by a successful refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderTokens {
    pub access_token: String,
    pub token_type: String,
    /// Lifetime of the access token in seconds.
    pub expires_in: Option<i64>,
    /// Scopes actually granted, if the provider says.
    pub scope: Option<String>,
    /// A new refresh token, if the provider rotates them.
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for ProviderTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTokens")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("rotated", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Errors reported by the identity provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider answered with an OAuth error.
    #[error("identity provider rejected the request: {error}")]
    Rejected {
        status: u16,
        error: String,
        description: Option<String>,
    },

    /// The provider could not be reached.
    #[error("identity provider unreachable: {0}")]
    Unreachable(String),
}

/// Refreshes access tokens at an OIDC provider.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Obtain an access token with `refresh_token`.
    ///
    /// Empty `scopes` or `audiences` mean the provider's defaults.
    async fn refresh(
        &self,
        provider: &ProviderConfig,
        refresh_token: &str,
        scopes: &[String],
        audiences: &[String],
    ) -> std::result::Result<ProviderTokens, ProviderError>;
}
