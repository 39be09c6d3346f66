//! Signing keys for mytoken.
//!
//! Wraps Ed25519 signing with strong types and publishes the public half as a
//! JSON Web Key Set.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::CoreError;

/// A 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ed25519PublicKey(pub [u8; 32]);

impl Ed25519PublicKey {
    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Key identifier: the first 8 bytes of the Blake3 hash, hex.
    pub fn kid(&self) -> String {
        hex::encode(&blake3::hash(&self.0).as_bytes()[..8])
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CoreError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;

        let sig = Signature::from_bytes(&signature.0);

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }

    /// The JWK representation of this key.
    pub fn to_jwk(&self) -> Jwk {
        Jwk {
            kty: "OKP".into(),
            crv: "Ed25519".into(),
            alg: "EdDSA".into(),
            key_use: "sig".into(),
            kid: self.kid(),
            x: URL_SAFE_NO_PAD.encode(self.0),
        }
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Pub({})", &self.to_hex()[..16])
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature(pub [u8; 64]);

impl Ed25519Signature {
    /// Create from a byte slice of the right length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CoreError::EncodingError(format!("signature of {} bytes", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Sig({}...)", &hex::encode(self.0)[..16])
    }
}

/// A keypair for signing mytokens.
///
/// This wraps ed25519-dalek's SigningKey.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signing_key = SigningKey::generate(&mut rng);
        Self { signing_key }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Create from a hex-encoded seed, as stored in key files.
    pub fn from_hex_seed(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s.trim()).map_err(|e| CoreError::InvalidKeyMaterial(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidKeyMaterial("seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Get the public key.
    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        let sig = self.signing_key.sign(message);
        Ed25519Signature(sig.to_bytes())
    }

    /// Get the raw seed bytes (secret key material).
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The seed as hex, the format of key files.
    pub fn to_hex_seed(&self) -> String {
        hex::encode(self.seed())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.public_key())
    }
}

/// Hex Blake3 digest of a secret token, for records that must not hold the
/// token itself.
pub fn token_fingerprint(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

/// A single JSON Web Key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub kid: String,
    pub x: String,
}

/// A JSON Web Key Set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// The server's signing key.
///
/// Readers take an immutable snapshot of the current key; `rotate` is the
/// only way to change it.
#[derive(Debug)]
pub struct KeyRing {
    current: RwLock<Arc<Keypair>>,
}

impl KeyRing {
    /// Create a key ring around an existing keypair.
    pub fn new(keypair: Keypair) -> Self {
        Self {
            current: RwLock::new(Arc::new(keypair)),
        }
    }

    /// Create a key ring with a fresh random key.
    pub fn generate() -> Self {
        Self::new(Keypair::generate())
    }

    /// Snapshot of the current signing key.
    pub fn current(&self) -> Arc<Keypair> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the signing key, returning the previous one.
    ///
    /// Tokens signed with the previous key stop verifying.
    pub fn rotate(&self, next: Keypair) -> Arc<Keypair> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(next))
    }

    /// The published key set.
    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![self.current().public_key().to_jwk()],
        }
    }
}
