//! Wire encoding of mytokens.
//!
//! A long-form mytoken is a compact JWS: `header.claims.signature`, each part
//! base64url without padding. The header names the algorithm (`EdDSA`) and
//! the key id of the signing key. A short-form mytoken is an opaque random
//! string that the server maps to a long-form token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::claims::MytokenClaims;
use crate::crypto::{Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::{CoreError, TokenError};

/// JWS algorithm name for Ed25519.
pub const ALGORITHM: &str = "EdDSA";

const TOKEN_TYPE: &str = "JWT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
    kid: String,
}

/// Encode and sign a claim set as a long-form mytoken.
pub fn encode(claims: &MytokenClaims, keypair: &Keypair) -> Result<String, CoreError> {
    let header = Header {
        alg: ALGORITHM.to_string(),
        typ: TOKEN_TYPE.to_string(),
        kid: keypair.public_key().kid(),
    };
    let header = serde_json::to_vec(&header).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    let payload = serde_json::to_vec(claims).map_err(|e| CoreError::EncodingError(e.to_string()))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(payload)
    );
    let signature = keypair.sign(signing_input.as_bytes());

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.as_bytes())
    ))
}

/// Decode a long-form mytoken.
///
/// The signature must verify against `key` and the claims must pass
/// [`MytokenClaims::validate`] at `now`. Revocation is not checked here.
pub fn decode(token: &str, key: &Ed25519PublicKey, now: i64) -> Result<MytokenClaims, TokenError> {
    let mut parts = token.split('.');
    let (header_b64, payload_b64, signature_b64) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => return Err(TokenError::Malformed("expected three segments".into())),
        };

    let header: Header = serde_json::from_slice(&b64(header_b64)?)
        .map_err(|e| TokenError::Malformed(format!("header: {}", e)))?;
    if header.alg != ALGORITHM {
        return Err(TokenError::UnsupportedAlgorithm(header.alg));
    }
    if header.kid != key.kid() {
        return Err(TokenError::UnknownKey(header.kid));
    }

    let signature = Ed25519Signature::from_slice(&b64(signature_b64)?)?;
    let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|_| TokenError::SignatureFailed)?;

    let claims: MytokenClaims = serde_json::from_slice(&b64(payload_b64)?)
        .map_err(|e| TokenError::InvalidClaims(e.to_string()))?;
    claims.validate(now)?;
    Ok(claims)
}

fn b64(segment: &str) -> Result<Vec<u8>, TokenError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenError::Malformed(e.to_string()))
}

/// A mytoken as presented by a client.
#[derive(Clone, PartialEq, Eq)]
pub enum WireToken {
    /// Self-contained signed token.
    Long(String),
    /// Opaque reference resolved by the server.
    Short(String),
}

impl WireToken {
    /// Classify a presented token string.
    pub fn parse(token: &str) -> Result<Self, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::Malformed("empty token".into()));
        }
        if token.matches('.').count() == 2 {
            Ok(WireToken::Long(token.to_string()))
        } else if token.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(WireToken::Short(token.to_string()))
        } else {
            Err(TokenError::Malformed("unrecognized token format".into()))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WireToken::Long(s) | WireToken::Short(s) => s,
        }
    }
}

impl fmt::Debug for WireToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireToken::Long(_) => write!(f, "WireToken::Long(..)"),
            WireToken::Short(_) => write!(f, "WireToken::Short(..)"),
        }
    }
}

/// How a newly created mytoken is handed to the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// The long-form token.
    #[default]
    Token,
    /// A short-form reference.
    ShortToken,
    /// A transfer code that can be exchanged for the token once.
    TransferCode,
}

impl ResponseType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseType::Token => "token",
            ResponseType::ShortToken => "short_token",
            ResponseType::TransferCode => "transfer_code",
        }
    }
}
