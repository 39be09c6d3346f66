//! # mytoken
//!
//! Long-lived delegation credentials ("mytokens") that stand in for a user's
//! OpenID-Connect identity and mint short-lived access tokens on demand.
//!
//! ## Overview
//!
//! - **Mytokens**: signed tokens carrying capabilities and restrictions
//! - **Hierarchy**: a mytoken may create children bounded by its subtoken
//!   capabilities; revocation cascades down the tree
//! - **Exchanges**: polling codes and transfer codes hand a mytoken to a
//!   client exactly once
//! - **Ledger**: every change is documented by an event in the same
//!   transaction
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mytoken::{MytokenService, ServiceConfig};
//! use mytoken::core::{ClientMetaData, FlowParameters, KeyRing};
//! use mytoken::store::SqliteStore;
//! # use mytoken::provider::{IdentityProvider, ProviderConfig, ProviderError, ProviderTokens};
//! # struct Idp;
//! # #[async_trait::async_trait]
//! # impl IdentityProvider for Idp {
//! #     async fn refresh(&self, _: &ProviderConfig, _: &str, _: &[String], _: &[String])
//! #         -> Result<ProviderTokens, ProviderError> { unimplemented!() }
//! # }
//!
//! async fn example() {
//!     let config = ServiceConfig::load("mytoken.toml").unwrap();
//!     let store = SqliteStore::open(&config.database.path).unwrap();
//!     let service = MytokenService::new(config, store, Idp, KeyRing::generate());
//!
//!     // Start a polling-code flow for a new root mytoken
//!     let client = ClientMetaData::new("192.0.2.1".parse().unwrap());
//!     let pending = service
//!         .create_pending_exchange(FlowParameters::new("https://idp.example"), &client)
//!         .await
//!         .unwrap();
//!     println!("visit {}", pending.consent_uri);
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `mytoken::core` - Tokens, capabilities, restrictions, exchange states
//! - `mytoken::store` - Storage abstraction and SQLite

pub mod config;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod provider;
pub mod service;

// Re-export component crates
pub use mytoken_core as core;
pub use mytoken_store as store;

// Re-export main types for convenience
pub use config::ServiceConfig;
pub use discovery::ConfigurationDocument;
pub use error::{ApiError, MytokenError, Result};
pub use handlers::{dispatch, Response};
pub use provider::{IdentityProvider, ProviderConfig, ProviderError, ProviderTokens};
pub use service::{
    AccessTokenGrant, AccessTokenRequest, ChildRequest, Clock, Delivery, IssuedMytoken,
    MytokenService, PendingExchange, Presented, ProviderIdentity, RevokeRequest, TokenInfo,
    TransferCode,
};
