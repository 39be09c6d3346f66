//! Service configuration.
//!
//! Loaded from TOML. Every section has defaults, so a file only needs to name
//! what differs:
//!
//! ```toml
//! issuer = "https://mytoken.example"
//!
//! [database]
//! path = "/var/lib/mytoken/mytoken.db"
//!
//! [[providers]]
//! issuer = "https://idp.example"
//! name = "Example IdP"
//! scopes = ["openid", "profile"]
//! ```

use mytoken_core::{KeyRing, Keypair};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MytokenError, Result};
use crate::provider::ProviderConfig;

/// Configuration for the mytoken service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// URL of this server; the `iss` of every mytoken.
    pub issuer: String,
    pub database: DatabaseConfig,
    pub signing: SigningConfig,
    pub polling: PollingConfig,
    pub tokens: TokenConfig,
    pub features: FeatureConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8000".into(),
            database: DatabaseConfig::default(),
            signing: SigningConfig::default(),
            polling: PollingConfig::default(),
            tokens: TokenConfig::default(),
            features: FeatureConfig::default(),
            providers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mytoken.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// File holding the hex-encoded Ed25519 seed.
    pub key_file: PathBuf,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_file: PathBuf::from("mytoken.signing.key"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Lifetime of a polling code in seconds.
    pub expires_in: i64,
    /// Suggested seconds between polls.
    pub interval: i64,
    pub code_length: usize,
    pub consent_code_length: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            expires_in: 300,
            interval: 5,
            code_length: 16,
            consent_code_length: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub short_token_length: usize,
    pub transfer_code_length: usize,
    /// Lifetime of a transfer code in seconds.
    pub transfer_code_expires_in: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            short_token_length: 64,
            transfer_code_length: 8,
            transfer_code_expires_in: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub short_tokens: bool,
    pub transfer_codes: bool,
    pub polling_codes: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            short_tokens: true,
            transfer_codes: true,
            polling_codes: true,
        }
    }
}

impl ServiceConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| MytokenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| MytokenError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&s)
    }

    /// Reject values the service cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.issuer.is_empty() {
            return Err(MytokenError::Config("issuer must be set".into()));
        }
        if self.polling.expires_in <= 0 || self.tokens.transfer_code_expires_in <= 0 {
            return Err(MytokenError::Config("code lifetimes must be positive".into()));
        }
        if self.polling.code_length < 8
            || self.polling.consent_code_length < 8
            || self.tokens.short_token_length < 16
            || self.tokens.transfer_code_length < 6
        {
            return Err(MytokenError::Config("code lengths are too short".into()));
        }
        Ok(())
    }

    /// The provider with issuer `issuer`.
    pub fn provider(&self, issuer: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.matches(issuer))
    }

    /// Load the signing key from `signing.key_file`.
    pub fn load_key_ring(&self) -> Result<KeyRing> {
        let path = &self.signing.key_file;
        let seed = std::fs::read_to_string(path)
            .map_err(|e| MytokenError::Config(format!("{}: {}", path.display(), e)))?;
        let keypair = Keypair::from_hex_seed(seed.trim())
            .map_err(|e| MytokenError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(KeyRing::new(keypair))
    }

    /// This server's issuer URL without a trailing slash.
    pub fn issuer_url(&self) -> &str {
        self.issuer.trim_end_matches('/')
    }
}
