//! Strong type definitions for mytoken.
//!
//! Identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a mytoken.
///
/// Opaque and random; it carries no information about the token itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MytokenId(pub Uuid);

impl MytokenId {
    /// Generate a new random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for MytokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MytokenId({})", self.0)
    }
}

impl fmt::Display for MytokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MytokenId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl From<Uuid> for MytokenId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Network metadata of the client that sent a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetaData {
    /// The requester's address.
    pub ip: IpAddr,
    /// The requester's user agent, if it sent one.
    pub user_agent: Option<String>,
}

impl ClientMetaData {
    /// Metadata for a client at the given address.
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            user_agent: None,
        }
    }

    /// Attach a user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Current time in unix seconds.
pub fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
