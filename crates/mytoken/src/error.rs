//! Error types for the mytoken service.
//!
//! Every error maps to an API error body and a status code. Storage details
//! never leave the service: they are reported as an opaque internal error.

use mytoken_core::{CoreError, ExchangeError, TokenError};
use mytoken_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderError;

/// Errors that can occur during mytoken operations.
#[derive(Debug, Error)]
pub enum MytokenError {
    /// The request body did not have the expected shape.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Signature failure, unknown id, or revoked mytoken.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The mytoken lacks a capability the operation needs.
    #[error("insufficient capabilities: {0}")]
    InsufficientCapability(String),

    /// No restriction clause admits the request.
    #[error("usage restricted: {0}")]
    UsageRestricted(String),

    /// The OIDC issuer is not configured.
    #[error("unknown issuer: {0}")]
    UnknownIssuer(String),

    /// A child mytoken would exceed what its parent may delegate.
    #[error("creation rejected: {0}")]
    CreationRejected(String),

    /// The identity provider rejected the request or could not be reached.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A pending-exchange transition was not possible.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// The requested feature is switched off in the configuration.
    #[error("feature disabled: {0}")]
    FeatureDisabled(&'static str),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// A mytoken could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[source] StoreError),
}

impl From<StoreError> for MytokenError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UsageExhausted { mytoken_id, clause } => MytokenError::UsageRestricted(
                format!("clause {} of mytoken {} is used up", clause, mytoken_id),
            ),
            StoreError::Exchange(e) => MytokenError::Exchange(e),
            other => MytokenError::Storage(other),
        }
    }
}

impl From<TokenError> for MytokenError {
    fn from(e: TokenError) -> Self {
        MytokenError::InvalidToken(e.to_string())
    }
}

/// The error body returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ApiError {
    fn new(error: &str, description: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            error_description: Some(description.into()),
        }
    }
}

impl MytokenError {
    /// The status code this error is reported with.
    pub fn status(&self) -> u16 {
        match self {
            MytokenError::MalformedRequest(_)
            | MytokenError::UnknownIssuer(_)
            | MytokenError::FeatureDisabled(_) => 400,
            MytokenError::InvalidToken(_) => 401,
            MytokenError::InsufficientCapability(_)
            | MytokenError::UsageRestricted(_)
            | MytokenError::CreationRejected(_) => 403,
            MytokenError::Provider(ProviderError::Rejected { status, .. }) => *status,
            MytokenError::Provider(ProviderError::Unreachable(_)) => 502,
            MytokenError::Exchange(e) => match e {
                ExchangeError::AuthorizationPending => 428,
                ExchangeError::ConsentAlreadyDecided => 409,
                ExchangeError::ConsentRequired => 400,
                ExchangeError::UnknownCode
                | ExchangeError::AlreadyClaimed
                | ExchangeError::ConsentDeclined
                | ExchangeError::Expired => 401,
            },
            MytokenError::Config(_) | MytokenError::Encoding(_) | MytokenError::Storage(_) => 500,
        }
    }

    /// The body this error is reported with.
    pub fn to_api_error(&self) -> ApiError {
        match self {
            MytokenError::MalformedRequest(msg) => ApiError::new("invalid_request", msg.clone()),
            MytokenError::InvalidToken(msg) => ApiError::new("invalid_token", msg.clone()),
            MytokenError::InsufficientCapability(msg) | MytokenError::CreationRejected(msg) => {
                ApiError::new("insufficient_capabilities", msg.clone())
            }
            MytokenError::UsageRestricted(msg) => ApiError::new("usage_restricted", msg.clone()),
            MytokenError::UnknownIssuer(iss) => {
                ApiError::new("invalid_request", format!("the issuer {} is not supported", iss))
            }
            MytokenError::FeatureDisabled(feature) => {
                ApiError::new("invalid_request", format!("{} is not enabled on this server", feature))
            }
            MytokenError::Provider(ProviderError::Rejected {
                error, description, ..
            }) => ApiError {
                error: error.clone(),
                error_description: description.clone(),
            },
            MytokenError::Provider(e @ ProviderError::Unreachable(_)) => {
                ApiError::new("oidc_error", e.to_string())
            }
            MytokenError::Exchange(e) => {
                let code = match e {
                    ExchangeError::AuthorizationPending => "authorization_pending",
                    ExchangeError::ConsentDeclined => "access_denied",
                    ExchangeError::Expired => "expired_token",
                    ExchangeError::UnknownCode | ExchangeError::AlreadyClaimed => "invalid_grant",
                    ExchangeError::ConsentAlreadyDecided | ExchangeError::ConsentRequired => {
                        "invalid_request"
                    }
                };
                ApiError::new(code, e.to_string())
            }
            MytokenError::Config(_) | MytokenError::Encoding(_) | MytokenError::Storage(_) => {
                ApiError::new("internal_server_error", "an internal error occurred")
            }
        }
    }
}

/// Result type for mytoken operations.
pub type Result<T> = std::result::Result<T, MytokenError>;
