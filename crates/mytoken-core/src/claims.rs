//! The claim set of a mytoken.
//!
//! Optional claims are absent on the wire when unset: no `exp` means the
//! mytoken never expires, no `subtoken_capabilities` means children are
//! bounded by the mytoken's own capabilities, and no `restrictions` means the
//! mytoken is unrestricted.

use serde::{Deserialize, Serialize};

use crate::capability::{Capability, CapabilitySet};
use crate::error::TokenError;
use crate::restriction::{self, Restriction};
use crate::types::MytokenId;

/// Version of the claim set layout.
pub const CLAIMS_VERSION: &str = "0.1";

/// Claims carried by a long-form mytoken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MytokenClaims {
    pub ver: String,

    /// Mytoken identifier.
    pub jti: MytokenId,

    /// URL of the issuing mytoken server.
    pub iss: String,

    /// `oidc_sub@oidc_iss`.
    pub sub: String,

    /// Issuer of the user's OIDC identity.
    pub oidc_iss: String,

    /// Subject of the user's OIDC identity.
    pub oidc_sub: String,

    pub iat: i64,

    pub nbf: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub capabilities: CapabilitySet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtoken_capabilities: Option<CapabilitySet>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restrictions: Vec<Restriction>,
}

impl MytokenClaims {
    /// Start building a claim set.
    pub fn builder(
        issuer: impl Into<String>,
        oidc_iss: impl Into<String>,
        oidc_sub: impl Into<String>,
    ) -> ClaimsBuilder {
        ClaimsBuilder::new(issuer.into(), oidc_iss.into(), oidc_sub.into())
    }

    /// The capabilities children of this mytoken are bounded by.
    pub fn subtoken_ceiling(&self) -> &CapabilitySet {
        self.subtoken_capabilities
            .as_ref()
            .unwrap_or(&self.capabilities)
    }

    /// Schema and time checks performed on every decode.
    pub fn validate(&self, now: i64) -> Result<(), TokenError> {
        if self.ver != CLAIMS_VERSION {
            return Err(TokenError::InvalidClaims(format!(
                "unsupported version {}",
                self.ver
            )));
        }
        if self.iss.is_empty() || self.oidc_iss.is_empty() || self.oidc_sub.is_empty() {
            return Err(TokenError::InvalidClaims("empty issuer or subject".into()));
        }
        if self.sub != subject_of(&self.oidc_sub, &self.oidc_iss) {
            return Err(TokenError::InvalidClaims("sub does not match oidc identity".into()));
        }
        if self.capabilities.is_empty() {
            return Err(TokenError::InvalidClaims("no capabilities".into()));
        }
        if self.subtoken_capabilities.is_some() && !self.capabilities.has(Capability::CreateMytoken) {
            return Err(TokenError::InvalidClaims(
                "subtoken_capabilities without create_mytoken".into(),
            ));
        }
        restriction::validate_all(&self.restrictions)?;

        if now < self.nbf {
            return Err(TokenError::NotYetValid);
        }
        if let Some(exp) = self.exp {
            if now > exp {
                return Err(TokenError::Expired);
            }
        }
        Ok(())
    }
}

/// The `sub` claim for an OIDC identity.
pub fn subject_of(oidc_sub: &str, oidc_iss: &str) -> String {
    format!("{}@{}", oidc_sub, oidc_iss)
}

/// Builder for [`MytokenClaims`].
#[derive(Debug, Clone)]
pub struct ClaimsBuilder {
    id: MytokenId,
    issuer: String,
    oidc_iss: String,
    oidc_sub: String,
    name: Option<String>,
    capabilities: CapabilitySet,
    subtoken_capabilities: Option<CapabilitySet>,
    restrictions: Vec<Restriction>,
}

impl ClaimsBuilder {
    fn new(issuer: String, oidc_iss: String, oidc_sub: String) -> Self {
        Self {
            id: MytokenId::generate(),
            issuer,
            oidc_iss,
            oidc_sub,
            name: None,
            capabilities: CapabilitySet::from([Capability::AccessToken]),
            subtoken_capabilities: None,
            restrictions: Vec::new(),
        }
    }

    /// Use a specific identifier instead of a random one.
    pub fn id(mut self, id: MytokenId) -> Self {
        self.id = id;
        self
    }

    pub fn name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn subtoken_capabilities(mut self, capabilities: Option<CapabilitySet>) -> Self {
        self.subtoken_capabilities = capabilities;
        self
    }

    pub fn restrictions(mut self, restrictions: Vec<Restriction>) -> Self {
        self.restrictions = restrictions;
        self
    }

    /// Finish the claim set, issued at `now`.
    ///
    /// Subtoken capabilities are dropped unless the mytoken may create
    /// children. The expiry follows the restrictions: once every clause has
    /// expired the mytoken is useless.
    pub fn build(self, now: i64) -> MytokenClaims {
        let subtoken_capabilities = self
            .subtoken_capabilities
            .filter(|_| self.capabilities.has(Capability::CreateMytoken));
        let exp = restriction::latest_expiry(&self.restrictions);

        MytokenClaims {
            ver: CLAIMS_VERSION.to_string(),
            jti: self.id,
            iss: self.issuer,
            sub: subject_of(&self.oidc_sub, &self.oidc_iss),
            oidc_iss: self.oidc_iss,
            oidc_sub: self.oidc_sub,
            iat: now,
            nbf: now,
            exp,
            name: self.name,
            capabilities: self.capabilities,
            subtoken_capabilities,
            restrictions: self.restrictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> MytokenClaims {
        MytokenClaims::builder("https://mytoken.example", "https://idp.example", "alice")
            .capabilities(CapabilitySet::from([Capability::AccessToken, Capability::CreateMytoken]))
            .subtoken_capabilities(Some(CapabilitySet::from([Capability::AccessToken])))
            .build(1_000)
    }

    #[test]
    fn test_builder_defaults() {
        let c = MytokenClaims::builder("https://mytoken.example", "https://idp.example", "alice")
            .build(1_000);
        assert_eq!(c.sub, "alice@https://idp.example");
        assert_eq!(c.capabilities, CapabilitySet::from([Capability::AccessToken]));
        assert_eq!(c.iat, 1_000);
        assert_eq!(c.exp, None);
        assert!(c.validate(1_000).is_ok());
    }

    #[test]
    fn test_subtoken_capabilities_dropped_without_create() {
        let c = MytokenClaims::builder("iss", "oidc", "bob")
            .capabilities(CapabilitySet::from([Capability::AccessToken]))
            .subtoken_capabilities(Some(CapabilitySet::all()))
            .build(0);
        assert_eq!(c.subtoken_capabilities, None);
    }

    #[test]
    fn test_subtoken_ceiling() {
        let c = claims();
        assert_eq!(c.subtoken_ceiling(), &CapabilitySet::from([Capability::AccessToken]));

        let no_explicit = MytokenClaims::builder("iss", "oidc", "bob")
            .capabilities(CapabilitySet::from([Capability::CreateMytoken, Capability::Revoke]))
            .build(0);
        assert_eq!(no_explicit.subtoken_ceiling(), &no_explicit.capabilities);
    }

    #[test]
    fn test_expiry_follows_restrictions() {
        let c = MytokenClaims::builder("iss", "oidc", "bob")
            .restrictions(vec![
                Restriction::any().with_window(None, Some(2_000)),
                Restriction::any().with_window(None, Some(3_000)),
            ])
            .build(1_000);
        assert_eq!(c.exp, Some(3_000));
        assert!(c.validate(3_000).is_ok());
        assert_eq!(c.validate(3_001), Err(TokenError::Expired));
        assert_eq!(c.validate(999), Err(TokenError::NotYetValid));
    }

    #[test]
    fn test_validate_rejects_bad_claims() {
        let mut c = claims();
        c.ver = "9".into();
        assert!(matches!(c.validate(1_000), Err(TokenError::InvalidClaims(_))));

        let mut c = claims();
        c.sub = "mallory@elsewhere".into();
        assert!(matches!(c.validate(1_000), Err(TokenError::InvalidClaims(_))));

        let mut c = claims();
        c.capabilities = CapabilitySet::new();
        assert!(matches!(c.validate(1_000), Err(TokenError::InvalidClaims(_))));
    }

    #[test]
    fn test_optional_claims_absent_on_wire() {
        let c = MytokenClaims::builder("iss", "oidc", "bob").build(0);
        let value = serde_json::to_value(&c).unwrap();
        assert!(value.get("exp").is_none());
        assert!(value.get("subtoken_capabilities").is_none());
        assert!(value.get("restrictions").is_none());
        assert!(value.get("name").is_none());
    }

    #[test]
    fn test_unknown_claims_rejected() {
        let mut value = serde_json::to_value(claims()).unwrap();
        value["admin"] = serde_json::Value::Bool(true);
        assert!(serde_json::from_value::<MytokenClaims>(value).is_err());
    }
}
