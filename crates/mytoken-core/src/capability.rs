//! Capabilities: coarse permission flags carried by a mytoken.
//!
//! The vocabulary is closed. Sets are compared by inclusion, both to gate
//! operations and to bound what a mytoken may delegate to its children.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Obtain access tokens from the identity provider.
    #[serde(rename = "AT")]
    AccessToken,
    /// Create child mytokens.
    #[serde(rename = "create_mytoken")]
    CreateMytoken,
    /// Revoke mytokens.
    #[serde(rename = "revoke")]
    Revoke,
    /// List the mytokens of the same user.
    #[serde(rename = "list_mytokens")]
    ListMytokens,
    /// Introspect the mytoken itself.
    #[serde(rename = "tokeninfo_introspect")]
    TokeninfoIntrospect,
    /// Read the event history of the mytoken.
    #[serde(rename = "tokeninfo_history")]
    TokeninfoHistory,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 6] = [
        Capability::AccessToken,
        Capability::CreateMytoken,
        Capability::Revoke,
        Capability::ListMytokens,
        Capability::TokeninfoIntrospect,
        Capability::TokeninfoHistory,
    ];

    /// The wire name of this capability.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::AccessToken => "AT",
            Capability::CreateMytoken => "create_mytoken",
            Capability::Revoke => "revoke",
            Capability::ListMytokens => "list_mytokens",
            Capability::TokeninfoIntrospect => "tokeninfo_introspect",
            Capability::TokeninfoHistory => "tokeninfo_history",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The set of every capability.
    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    /// Check whether the set contains `capability`.
    pub fn has(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// Check whether every member of this set is also in `other`.
    pub fn is_subset_of(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// The members of this set that are missing from `other`.
    pub fn exceeding(&self, other: &CapabilitySet) -> Vec<Capability> {
        self.0.difference(&other.0).copied().collect()
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn remove(&mut self, capability: Capability) -> bool {
        self.0.remove(&capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Capability; N]> for CapabilitySet {
    fn from(capabilities: [Capability; N]) -> Self {
        capabilities.into_iter().collect()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Capability::as_str).collect();
        write!(f, "[{}]", names.join(" "))
    }
}
