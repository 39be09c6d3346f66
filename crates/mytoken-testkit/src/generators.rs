//! Proptest generators for property-based testing.

use std::net::{IpAddr, Ipv4Addr};

use proptest::prelude::*;

use mytoken_core::{
    Capability, CapabilitySet, IpRange, RequestContext, Restriction, Usage, UsedRestriction,
};

/// Generate a single capability.
pub fn capability() -> impl Strategy<Value = Capability> {
    prop::sample::select(Capability::ALL.to_vec())
}

/// Generate any capability set, including the empty one.
pub fn capability_set() -> impl Strategy<Value = CapabilitySet> {
    prop::collection::vec(capability(), 0..=Capability::ALL.len())
        .prop_map(|caps| caps.into_iter().collect())
}

/// Generate an IPv4 address from a small pool so ranges and requests meet.
pub fn ipv4() -> impl Strategy<Value = IpAddr> {
    (0u8..4, 0u8..4).prop_map(|(c, d)| IpAddr::V4(Ipv4Addr::new(10, 0, c, d)))
}

/// Generate an IPv4 range inside 10.0.0.0/16.
pub fn ip_range() -> impl Strategy<Value = IpRange> {
    (ipv4(), 16u8..=32).prop_filter_map("valid prefix", |(addr, prefix)| {
        IpRange::new(addr, prefix).ok()
    })
}

/// Generate a scope list from a small vocabulary.
pub fn scope() -> impl Strategy<Value = String> {
    prop::sample::subsequence(vec!["openid", "profile", "email", "storage.read"], 1..=4)
        .prop_map(|scopes| scopes.join(" "))
}

/// Generate a valid restriction clause.
pub fn restriction() -> impl Strategy<Value = Restriction> {
    (
        prop::option::of(0i64..1_000),
        prop::option::of(0i64..1_000),
        prop::option::of(scope()),
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..=2),
        prop::collection::vec(ip_range(), 0..=2),
        prop::option::of(0u64..4),
        prop::option::of(0u64..4),
    )
        .prop_map(|(nbf, len, scope, audiences, ips, at, other)| Restriction {
            nbf,
            exp: nbf.zip(len).map(|(nbf, len)| nbf + len).or(len),
            scope,
            audiences: audiences.into_iter().map(String::from).collect(),
            ips,
            usages_at: at,
            usages_other: other,
        })
}

/// Generate a clause together with a usage within its ceilings.
pub fn used_restriction() -> impl Strategy<Value = UsedRestriction> {
    (restriction(), 0u64..5, 0u64..5).prop_map(|(restriction, at, other)| {
        let usage = Usage {
            at: restriction.usages_at.map_or(at, |max| at.min(max)),
            other: restriction.usages_other.map_or(other, |max| other.min(max)),
        };
        UsedRestriction { restriction, usage }
    })
}

/// Generate a request context over the same address pool and vocabulary.
pub fn request_context() -> impl Strategy<Value = RequestContext> {
    (
        ipv4(),
        0i64..2_000,
        prop::collection::vec(prop::sample::select(vec!["openid", "email", "admin"]), 0..=2),
        prop::collection::vec(prop::sample::select(vec!["a", "b", "z"]), 0..=1),
    )
        .prop_map(|(ip, now, scopes, audiences)| {
            RequestContext::new(ip, now)
                .with_scopes(scopes.into_iter().map(String::from).collect())
                .with_audiences(audiences.into_iter().map(String::from).collect())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mytoken_core::restriction::validate_all;
    use mytoken_core::{authorize, Decision, UsageKind};

    proptest! {
        #[test]
        fn generated_restrictions_are_valid(restrictions in prop::collection::vec(restriction(), 0..4)) {
            prop_assert!(validate_all(&restrictions).is_ok());
        }

        #[test]
        fn exceeding_is_empty_iff_subset(a in capability_set(), b in capability_set()) {
            prop_assert_eq!(a.exceeding(&b).is_empty(), a.is_subset_of(&b));
        }

        #[test]
        fn selected_clause_admits_request(
            clauses in prop::collection::vec(used_restriction(), 0..4),
            ctx in request_context(),
        ) {
            match authorize(&clauses, UsageKind::AccessToken, &ctx) {
                Decision::Allowed { clause: None } => prop_assert!(clauses.is_empty()),
                Decision::Allowed { clause: Some(i) } => {
                    let selected = &clauses[i];
                    if let Some(max) = selected.restriction.usages_at {
                        prop_assert!(selected.usage.at < max);
                    }
                    prop_assert!(selected.restriction.ips.is_empty()
                        || selected.restriction.ips.iter().any(|r| r.contains(&ctx.ip)));
                }
                Decision::Denied => prop_assert!(!clauses.is_empty()),
            }
        }
    }
}
