//! Error types for mytoken core.

use thiserror::Error;

/// Core errors that can occur while handling keys and restriction data.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("invalid restriction: {0}")]
    InvalidRestriction(String),

    #[error("invalid ip range: {0}")]
    InvalidIpRange(String),

    #[error("encoding error: {0}")]
    EncodingError(String),
}

/// Errors produced while decoding or validating a wire token.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("token was signed with an unknown key: {0}")]
    UnknownKey(String),

    #[error("signature verification failed")]
    SignatureFailed,

    #[error("invalid claims: {0}")]
    InvalidClaims(String),

    #[error("token is expired")]
    Expired,

    #[error("token is not yet valid")]
    NotYetValid,

    #[error("unknown short token")]
    UnknownShortToken,
}

impl From<CoreError> for TokenError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidSignature | CoreError::InvalidPublicKey => TokenError::SignatureFailed,
            CoreError::InvalidRestriction(msg) | CoreError::InvalidIpRange(msg) => {
                TokenError::InvalidClaims(msg)
            }
            CoreError::InvalidKeyMaterial(msg) | CoreError::EncodingError(msg) => {
                TokenError::Malformed(msg)
            }
        }
    }
}
