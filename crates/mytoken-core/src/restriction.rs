//! Restrictions and the restriction engine.
//!
//! A mytoken carries an ordered list of restriction clauses. Clauses are
//! alternatives: a request is authorized if at least one clause admits it and
//! still has quota left. The first eligible clause wins; the caller records
//! the use against that clause inside the transaction that performs the
//! operation.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::CoreError;

/// An IP address or CIDR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRange {
    addr: IpAddr,
    prefix: u8,
}

impl IpRange {
    /// Create a range from a network address and prefix length.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, CoreError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(CoreError::InvalidIpRange(format!(
                "prefix /{} too long for {}",
                prefix, addr
            )));
        }
        Ok(Self { addr, prefix })
    }

    /// A range containing exactly one address.
    pub fn single(addr: IpAddr) -> Self {
        let prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { addr, prefix }
    }

    /// Check whether `ip` lies inside this range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*ip),
            IpAddr::V4(_) => *ip,
        };
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpRange {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidIpRange(s.to_string());
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
                Self::new(addr, prefix)
            }
            None => Ok(Self::single(s.trim().parse().map_err(|_| invalid())?)),
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::single(self.addr) {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.prefix)
        }
    }
}

impl Serialize for IpRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The kind of operation a usage counter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageKind {
    /// Obtaining an access token.
    AccessToken,
    /// Everything else (creating children, introspection, revocation, ...).
    Other,
}

/// One restriction clause. Every field is optional; an empty clause matches
/// every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Restriction {
    /// Not valid before (unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    /// Not valid after (unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Space-separated scopes an access token may be requested for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Audiences an access token may be requested for.
    #[serde(default, rename = "audience", skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,

    /// Addresses the mytoken may be used from.
    #[serde(default, rename = "ip", skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpRange>,

    /// Maximum number of access tokens obtained through this clause.
    #[serde(default, rename = "usages_AT", skip_serializing_if = "Option::is_none")]
    pub usages_at: Option<u64>,

    /// Maximum number of other operations performed through this clause.
    #[serde(default, rename = "usages_other", skip_serializing_if = "Option::is_none")]
    pub usages_other: Option<u64>,
}

impl Restriction {
    /// The universal clause.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_audiences<I, S>(mut self, audiences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.audiences = audiences.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ips(mut self, ips: impl IntoIterator<Item = IpRange>) -> Self {
        self.ips = ips.into_iter().collect();
        self
    }

    pub fn with_window(mut self, nbf: Option<i64>, exp: Option<i64>) -> Self {
        self.nbf = nbf;
        self.exp = exp;
        self
    }

    pub fn with_usages_at(mut self, max: u64) -> Self {
        self.usages_at = Some(max);
        self
    }

    pub fn with_usages_other(mut self, max: u64) -> Self {
        self.usages_other = Some(max);
        self
    }

    /// Check whether this is the universal clause.
    pub fn is_universal(&self) -> bool {
        *self == Self::default()
    }

    /// The individual scopes of this clause, if it restricts scopes.
    pub fn scopes(&self) -> Option<Vec<&str>> {
        self.scope.as_deref().map(|s| s.split_whitespace().collect())
    }

    /// The usage ceiling for `kind`, if any.
    pub fn ceiling(&self, kind: UsageKind) -> Option<u64> {
        match kind {
            UsageKind::AccessToken => self.usages_at,
            UsageKind::Other => self.usages_other,
        }
    }

    /// Structural checks applied when a clause is created.
    pub fn validate(&self) -> Result<(), CoreError> {
        if let (Some(nbf), Some(exp)) = (self.nbf, self.exp) {
            if nbf > exp {
                return Err(CoreError::InvalidRestriction(format!(
                    "nbf {} is after exp {}",
                    nbf, exp
                )));
            }
        }
        if let Some(scope) = &self.scope {
            if scope.trim().is_empty() {
                return Err(CoreError::InvalidRestriction("empty scope".into()));
            }
        }
        if self.audiences.iter().any(|a| a.trim().is_empty()) {
            return Err(CoreError::InvalidRestriction("empty audience".into()));
        }
        Ok(())
    }

    fn admits_ip(&self, ip: &IpAddr) -> bool {
        self.ips.is_empty() || self.ips.iter().any(|range| range.contains(ip))
    }

    fn admits_time(&self, now: i64) -> bool {
        self.nbf.map_or(true, |nbf| now >= nbf) && self.exp.map_or(true, |exp| now <= exp)
    }

    fn has_quota(&self, usage: &Usage, kind: UsageKind) -> bool {
        self.ceiling(kind).map_or(true, |max| usage.get(kind) < max)
    }

    fn admits_scopes(&self, requested: &[String]) -> bool {
        match self.scopes() {
            None => true,
            Some(allowed) => requested.iter().all(|s| allowed.contains(&s.as_str())),
        }
    }

    fn admits_audiences(&self, requested: &[String]) -> bool {
        self.audiences.is_empty() || requested.iter().all(|a| self.audiences.contains(a))
    }
}

/// Usage counters of a single clause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(rename = "usages_AT_done")]
    pub at: u64,
    #[serde(rename = "usages_other_done")]
    pub other: u64,
}

impl Usage {
    pub fn get(&self, kind: UsageKind) -> u64 {
        match kind {
            UsageKind::AccessToken => self.at,
            UsageKind::Other => self.other,
        }
    }
}

/// A restriction clause together with its persisted usage counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedRestriction {
    #[serde(flatten)]
    pub restriction: Restriction,
    #[serde(flatten)]
    pub usage: Usage,
}

impl UsedRestriction {
    /// A clause that has never been used.
    pub fn fresh(restriction: Restriction) -> Self {
        Self {
            restriction,
            usage: Usage::default(),
        }
    }
}

/// What a request wants to do, and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Address of the requester.
    pub ip: IpAddr,
    /// Requested scopes (empty = none requested).
    pub scopes: Vec<String>,
    /// Requested audiences (empty = none requested).
    pub audiences: Vec<String>,
    /// Evaluation time (unix seconds).
    pub now: i64,
}

impl RequestContext {
    pub fn new(ip: IpAddr, now: i64) -> Self {
        Self {
            ip,
            scopes: Vec::new(),
            audiences: Vec::new(),
            now,
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        self.audiences = audiences;
        self
    }
}

/// Outcome of evaluating the restrictions of a mytoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed. `clause` is the index of the clause whose
    /// counter must be incremented, or `None` when the mytoken is unrestricted.
    Allowed { clause: Option<usize> },
    /// No clause admits the request.
    Denied,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Evaluate `restrictions` for an operation of `kind`.
///
/// An empty list allows everything. Otherwise the first clause (in list
/// order) that admits the requester's address, the current time, the
/// requested scopes and audiences, and still has quota for `kind` is
/// selected.
pub fn authorize(restrictions: &[UsedRestriction], kind: UsageKind, ctx: &RequestContext) -> Decision {
    if restrictions.is_empty() {
        return Decision::Allowed { clause: None };
    }

    restrictions
        .iter()
        .position(|r| {
            let clause = &r.restriction;
            clause.admits_ip(&ctx.ip)
                && clause.admits_time(ctx.now)
                && clause.has_quota(&r.usage, kind)
                && clause.admits_scopes(&ctx.scopes)
                && clause.admits_audiences(&ctx.audiences)
        })
        .map_or(Decision::Denied, |index| Decision::Allowed {
            clause: Some(index),
        })
}

/// Validate every clause of a list.
pub fn validate_all(restrictions: &[Restriction]) -> Result<(), CoreError> {
    restrictions.iter().try_for_each(Restriction::validate)
}

/// The time after which no clause can admit a request any more.
///
/// `None` when some clause has no expiry (or there are no clauses).
pub fn latest_expiry(restrictions: &[Restriction]) -> Option<i64> {
    restrictions
        .iter()
        .map(|r| r.exp)
        .collect::<Option<Vec<i64>>>()
        .and_then(|exps| exps.into_iter().max())
}

/// Split a space-separated list, dropping empty entries.
pub fn split_list(s: &str) -> Vec<String> {
    s.split_whitespace().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ctx(now: i64) -> RequestContext {
        RequestContext::new(ip("192.168.0.10"), now)
    }

    #[test]
    fn test_ip_range_contains() {
        let range: IpRange = "192.168.0.0/24".parse().unwrap();
        assert!(range.contains(&ip("192.168.0.10")));
        assert!(!range.contains(&ip("192.168.1.10")));

        let single: IpRange = "10.0.0.1".parse().unwrap();
        assert!(single.contains(&ip("10.0.0.1")));
        assert!(!single.contains(&ip("10.0.0.2")));

        let v6: IpRange = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains(&ip("2001:db8::1")));
        assert!(!v6.contains(&ip("2001:db9::1")));
        assert!(!v6.contains(&ip("192.168.0.10")));
    }

    #[test]
    fn test_ip_range_mapped_v4() {
        let range: IpRange = "192.168.0.0/16".parse().unwrap();
        let mapped = IpAddr::V6(Ipv4Addr::new(192, 168, 3, 4).to_ipv6_mapped());
        assert!(range.contains(&mapped));
    }

    #[test]
    fn test_ip_range_parse_errors() {
        assert!("192.168.0.0/33".parse::<IpRange>().is_err());
        assert!("nonsense".parse::<IpRange>().is_err());
        assert!("::/129".parse::<IpRange>().is_err());
        assert!(IpRange::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).is_ok());
    }

    #[test]
    fn test_ip_range_display() {
        assert_eq!("10.0.0.1".parse::<IpRange>().unwrap().to_string(), "10.0.0.1");
        assert_eq!("10.0.0.0/8".parse::<IpRange>().unwrap().to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_no_restrictions_allows_everything() {
        let decision = authorize(&[], UsageKind::AccessToken, &ctx(0));
        assert_eq!(decision, Decision::Allowed { clause: None });
    }

    #[test]
    fn test_universal_clause_allows() {
        let restrictions = vec![UsedRestriction::fresh(Restriction::any())];
        let decision = authorize(&restrictions, UsageKind::Other, &ctx(0));
        assert_eq!(decision, Decision::Allowed { clause: Some(0) });
    }

    #[test]
    fn test_time_window_inclusive() {
        let restrictions = vec![UsedRestriction::fresh(
            Restriction::any().with_window(Some(100), Some(200)),
        )];
        assert!(!authorize(&restrictions, UsageKind::Other, &ctx(99)).is_allowed());
        assert!(authorize(&restrictions, UsageKind::Other, &ctx(100)).is_allowed());
        assert!(authorize(&restrictions, UsageKind::Other, &ctx(200)).is_allowed());
        assert!(!authorize(&restrictions, UsageKind::Other, &ctx(201)).is_allowed());
    }

    #[test]
    fn test_ip_restriction() {
        let restrictions = vec![UsedRestriction::fresh(
            Restriction::any().with_ips(["10.0.0.0/8".parse().unwrap()]),
        )];
        assert!(!authorize(&restrictions, UsageKind::Other, &ctx(0)).is_allowed());

        let inside = RequestContext::new(ip("10.1.2.3"), 0);
        assert!(authorize(&restrictions, UsageKind::Other, &inside).is_allowed());
    }

    #[test]
    fn test_quota_per_kind() {
        let mut clause = UsedRestriction::fresh(Restriction::any().with_usages_at(1));
        clause.usage.at = 1;
        let restrictions = vec![clause];

        assert_eq!(
            authorize(&restrictions, UsageKind::AccessToken, &ctx(0)),
            Decision::Denied
        );
        // the other counter is unlimited
        assert!(authorize(&restrictions, UsageKind::Other, &ctx(0)).is_allowed());
    }

    #[test]
    fn test_scope_subset() {
        let restrictions = vec![UsedRestriction::fresh(
            Restriction::any().with_scope("openid profile"),
        )];

        let ok = ctx(0).with_scopes(vec!["profile".into()]);
        assert!(authorize(&restrictions, UsageKind::AccessToken, &ok).is_allowed());

        let both = ctx(0).with_scopes(vec!["openid".into(), "profile".into()]);
        assert!(authorize(&restrictions, UsageKind::AccessToken, &both).is_allowed());

        let too_wide = ctx(0).with_scopes(vec!["openid".into(), "email".into()]);
        assert_eq!(
            authorize(&restrictions, UsageKind::AccessToken, &too_wide),
            Decision::Denied
        );
    }

    #[test]
    fn test_audience_subset() {
        let restrictions = vec![UsedRestriction::fresh(Restriction::any().with_audiences(["a", "b"]))];

        let ok = ctx(0).with_audiences(vec!["a".into()]);
        assert!(authorize(&restrictions, UsageKind::AccessToken, &ok).is_allowed());

        let bad = ctx(0).with_audiences(vec!["c".into()]);
        assert!(!authorize(&restrictions, UsageKind::AccessToken, &bad).is_allowed());
    }

    #[test]
    fn test_first_eligible_clause_wins() {
        let mut exhausted = UsedRestriction::fresh(Restriction::any().with_usages_at(2));
        exhausted.usage.at = 2;
        let restrictions = vec![
            UsedRestriction::fresh(Restriction::any().with_scope("write")),
            exhausted,
            UsedRestriction::fresh(Restriction::any().with_scope("read").with_usages_at(5)),
            UsedRestriction::fresh(Restriction::any()),
        ];

        let read = ctx(0).with_scopes(vec!["read".into()]);
        assert_eq!(
            authorize(&restrictions, UsageKind::AccessToken, &read),
            Decision::Allowed { clause: Some(2) }
        );

        let nothing = ctx(0);
        assert_eq!(
            authorize(&restrictions, UsageKind::AccessToken, &nothing),
            Decision::Allowed { clause: Some(0) }
        );
    }

    #[test]
    fn test_validate() {
        assert!(Restriction::any().with_window(Some(10), Some(5)).validate().is_err());
        assert!(Restriction::any().with_scope("  ").validate().is_err());
        assert!(Restriction::any().with_audiences([""]).validate().is_err());
        assert!(Restriction::any().with_window(Some(5), Some(10)).validate().is_ok());
    }

    #[test]
    fn test_latest_expiry() {
        let a = Restriction::any().with_window(None, Some(100));
        let b = Restriction::any().with_window(None, Some(300));
        assert_eq!(latest_expiry(&[a.clone(), b.clone()]), Some(300));
        assert_eq!(latest_expiry(&[a, Restriction::any()]), None);
        assert_eq!(latest_expiry(&[]), None);
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{"exp":1700000000,"scope":"read","audience":["a"],"ip":["10.0.0.0/8"],"usages_AT":1}"#;
        let r: Restriction = serde_json::from_str(json).unwrap();
        assert_eq!(r.exp, Some(1_700_000_000));
        assert_eq!(r.audiences, vec!["a".to_string()]);
        assert_eq!(r.usages_at, Some(1));
        assert_eq!(r.usages_other, None);
        assert_eq!(serde_json::to_string(&r).unwrap(), json);
    }

    #[test]
    fn test_used_restriction_flattens_counters() {
        let mut used = UsedRestriction::fresh(Restriction::any().with_usages_at(3));
        used.usage.at = 2;
        let value = serde_json::to_value(&used).unwrap();
        assert_eq!(value["usages_AT"], 3);
        assert_eq!(value["usages_AT_done"], 2);
        assert_eq!(value["usages_other_done"], 0);
    }

    mod props {
        use super::super::*;
        use proptest::prelude::*;
        use std::net::Ipv4Addr;

        proptest! {
            #[test]
            fn range_contains_addresses_sharing_prefix(addr: u32, other: u32, prefix in 0u8..=32) {
                let range = IpRange::new(IpAddr::V4(Ipv4Addr::from(addr)), prefix).unwrap();
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
                let candidate = (addr & mask) | (other & !mask);
                prop_assert!(range.contains(&IpAddr::V4(Ipv4Addr::from(candidate))));
            }

            #[test]
            fn universal_clause_admits_everything(addr: u32, now in 0i64..i64::MAX / 2) {
                let ctx = RequestContext::new(IpAddr::V4(Ipv4Addr::from(addr)), now);
                let clauses = vec![UsedRestriction::fresh(Restriction::any())];
                prop_assert_eq!(
                    authorize(&clauses, UsageKind::Other, &ctx),
                    Decision::Allowed { clause: Some(0) }
                );
            }
        }
    }
}
